//! Server-to-client event stream transport.
//!
//! A [`Transport`] opens one connection per call and reports everything that
//! happens on it as [`TransportEvent`]s on a single channel, tagged with the
//! connection id so the consumer can ignore events from connections it has
//! already dropped.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{retry::Never, Event, EventSource};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connection readiness, as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl From<u8> for ReadyState {
    fn from(v: u8) -> Self {
        match v {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            _ => ReadyState::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    Open,
    /// One text frame, unparsed.
    Frame(String),
    /// A transport error. While `Open` this is informational only.
    Error {
        message: String,
        ready_state: ReadyState,
    },
    /// The connection ended without being asked to.
    Closed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub connection_id: u64,
    pub kind: TransportEventKind,
}

/// Where a connection reports its events.
#[derive(Debug, Clone)]
pub struct EventSink {
    connection_id: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(connection_id: u64, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Returns false once nobody listens anymore.
    pub fn send(&self, kind: TransportEventKind) -> bool {
        self.tx
            .send(TransportEvent {
                connection_id: self.connection_id,
                kind,
            })
            .is_ok()
    }

    pub fn opened(&self) -> bool {
        self.send(TransportEventKind::Open)
    }

    pub fn frame(&self, data: impl Into<String>) -> bool {
        self.send(TransportEventKind::Frame(data.into()))
    }

    pub fn error(&self, message: impl Into<String>, ready_state: ReadyState) -> bool {
        self.send(TransportEventKind::Error {
            message: message.into(),
            ready_state,
        })
    }

    pub fn closed(&self, reason: impl Into<String>) -> bool {
        self.send(TransportEventKind::Closed {
            reason: reason.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub user_id: usize,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot build stream request: {0}")]
    Request(String),
}

/// Handle to one live connection.
pub trait ConnectionHandle: Send {
    fn ready_state(&self) -> ReadyState;

    /// Close the connection. No `Closed` event is reported for a connection
    /// closed this way.
    fn close(&mut self);
}

pub trait Transport: Send + Sync {
    fn connect(
        &self,
        request: ConnectRequest,
        sink: EventSink,
    ) -> Result<Box<dyn ConnectionHandle>, TransportError>;
}

/// `<base>/notifications/stream?token=<urlencoded token>`.
///
/// The token travels in the query because the stream transport cannot carry
/// custom headers.
pub fn stream_url(base_url: &str, token: &str) -> String {
    format!(
        "{}/notifications/stream?token={}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(token)
    )
}

/// Server-sent events over `reqwest`.
///
/// The event source's own retry is disabled; reconnecting is the
/// controller's job.
pub struct SseTransport {
    client: Client,
}

impl SseTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for SseTransport {
    fn connect(
        &self,
        request: ConnectRequest,
        sink: EventSink,
    ) -> Result<Box<dyn ConnectionHandle>, TransportError> {
        let mut source = EventSource::new(self.client.get(&request.url))
            .map_err(|e| TransportError::Request(e.to_string()))?;
        source.set_retry_policy(Box::new(Never));

        let state = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));
        let cancel = CancellationToken::new();
        debug!(
            "Opening notification stream {} for user {}",
            sink.connection_id(),
            request.user_id
        );
        tokio::spawn(drive_event_source(
            source,
            sink,
            state.clone(),
            cancel.clone(),
        ));

        Ok(Box::new(SseConnection { state, cancel }))
    }
}

async fn drive_event_source(
    mut source: EventSource,
    sink: EventSink,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = source.next() => next,
        };

        match next {
            Some(Ok(Event::Open)) => {
                state.store(ReadyState::Open as u8, Ordering::SeqCst);
                sink.opened();
            }
            Some(Ok(Event::Message(message))) => {
                sink.frame(message.data);
            }
            Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                state.store(ReadyState::Closed as u8, Ordering::SeqCst);
                sink.closed("stream ended");
                break;
            }
            // With the retry policy set to `Never` the event source stops
            // after any error, so every error here ends the connection.
            // Errors that leave an open connection alive only come from
            // transports that keep their own keep-alive.
            Some(Err(err)) => {
                let ready_state = ReadyState::from(state.load(Ordering::SeqCst));
                let message = err.to_string();
                sink.error(message.clone(), ready_state);
                state.store(ReadyState::Closed as u8, Ordering::SeqCst);
                sink.closed(message);
                break;
            }
        }
    }
    source.close();
    info!("Notification stream {} finished", sink.connection_id());
}

struct SseConnection {
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
}

impl ConnectionHandle for SseConnection {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from(self.state.load(Ordering::SeqCst))
    }

    fn close(&mut self) {
        self.state.store(ReadyState::Closed as u8, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
