//! Decoding of raw stream frames.

use serde_json::Value;
use tracing::{info, warn};

use crate::notifications::Notification;

/// `type` value reserved for the connection handshake.
pub const HANDSHAKE_TYPE: &str = "connection";

pub const DEFAULT_EXCERPT_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Sent once by the server after the stream opens. Never cached.
    Handshake { message: Option<String> },
    Notification(Notification),
}

#[derive(Debug, Clone)]
pub struct EventDecoder {
    excerpt_len: usize,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_EXCERPT_LEN)
    }
}

impl EventDecoder {
    pub fn new(excerpt_len: usize) -> Self {
        Self { excerpt_len }
    }

    /// Classify a frame. Malformed frames are logged and dropped.
    pub fn decode(&self, raw: &str) -> Option<StreamEvent> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "Dropping unparseable frame ({}): {}",
                    e,
                    excerpt(raw, self.excerpt_len)
                );
                return None;
            }
        };

        if value.get("type").and_then(Value::as_str) == Some(HANDSHAKE_TYPE) {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string);
            info!(
                "Notification stream handshake: {}",
                message.as_deref().unwrap_or("-")
            );
            return Some(StreamEvent::Handshake { message });
        }

        match serde_json::from_value::<Notification>(value) {
            Ok(notification) => Some(StreamEvent::Notification(notification)),
            Err(e) => {
                warn!(
                    "Dropping frame that is not a notification ({}): {}",
                    e,
                    excerpt(raw, self.excerpt_len)
                );
                None
            }
        }
    }
}

/// At most `max_chars` characters of `raw`, marked when cut.
pub fn excerpt(raw: &str, max_chars: usize) -> String {
    match raw.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &raw[..cut]),
        None => raw.to_string(),
    }
}
