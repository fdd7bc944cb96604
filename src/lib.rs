//! Real-time notification delivery and local cache reconciliation.
//!
//! This library exposes the stream core, the query cache and the REST
//! wiring used by the `notification-sync` binary and the tests.

pub mod auth;
pub mod cache;
pub mod config;
pub mod notifications;
pub mod service;
pub mod stream;

// Re-export commonly used types for convenience
pub use auth::{AuthState, Identity};
pub use cache::{CacheKey, QueryCache};
pub use notifications::{HttpNotificationsApi, Notification, NotificationFilter};
pub use service::{NotificationSync, NotificationView, SyncSettings};
pub use stream::{ConnectionState, ReconnectPolicy, SseTransport};
