//! Common test infrastructure
//!
//! Provides a fake backend that serves the notification stream over
//! server-sent events plus the REST endpoints the cache refresher calls.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestServer, TEST_USER_ID, TEST_TOKEN};
//!
//! #[tokio::test]
//! async fn test_stream() {
//!     let server = TestServer::spawn().await;
//!     server.wait_for_connections(1).await;
//!     server.push(&common::notification_frame(1, "A"));
//! }
//! ```

#![allow(dead_code)]

mod constants;
mod server;

pub use constants::*;
pub use server::TestServer;

use recruit_notifications::cache::{CacheEntry, CacheKey, CacheValue, NotificationListing, QueryCache};
use std::time::Duration;

/// JSON body of a notification frame as the backend sends it.
pub fn notification_frame(id: u64, title: &str) -> String {
    notification_json(id, title).to_string()
}

pub fn notification_json(id: u64, title: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "title": title,
        "message": format!("Message for {}", title),
        "type": "info",
        "isRead": false,
        "createdAt": "2024-05-02T08:00:00Z",
    })
}

/// Poll the cache entry at `key` until `check` accepts it.
pub async fn wait_for_entry<F>(cache: &QueryCache, key: &CacheKey, what: &str, check: F) -> CacheEntry
where
    F: Fn(&CacheEntry) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(WAIT_TIMEOUT_MS);
    loop {
        if let Some(entry) = cache.entry(key).await {
            if check(&entry) {
                return entry;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}

/// Poll until the listing at `key` satisfies `check`.
pub async fn wait_for_listing<F>(
    cache: &QueryCache,
    key: &CacheKey,
    what: &str,
    check: F,
) -> NotificationListing
where
    F: Fn(&NotificationListing) -> bool,
{
    let entry = wait_for_entry(cache, key, what, |entry| {
        listing_of(entry).is_some_and(|listing| check(listing))
    })
    .await;
    listing_of(&entry).cloned().unwrap_or_else(|| NotificationListing::new(vec![]))
}

pub fn listing_of(entry: &CacheEntry) -> Option<&NotificationListing> {
    entry.value.as_ref().and_then(CacheValue::as_listing)
}
