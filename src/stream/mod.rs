//! The server-push notification stream: transport, decoding and the
//! reconnecting controller that feeds the cache synchronizer.

mod controller;
mod decoder;
mod retry_policy;
mod transport;

pub use controller::{ConnectionState, ReconnectionController};
pub use decoder::{excerpt, EventDecoder, StreamEvent, DEFAULT_EXCERPT_LEN, HANDSHAKE_TYPE};
pub use retry_policy::{ReconnectPolicy, DEFAULT_RECONNECT_DELAY};
pub use transport::{
    stream_url, ConnectRequest, ConnectionHandle, EventSink, ReadyState, SseTransport, Transport,
    TransportError, TransportEvent, TransportEventKind,
};

#[cfg(test)]
pub(crate) use transport::mock;
