//! Client-side query cache for notification data.

mod key;
pub mod optimistic;
mod refresher;
mod store;
mod synchronizer;

pub use key::{CacheKey, KeyFilter, ResourceKind, NOTIFICATIONS_PREFIX};
pub use refresher::{CacheRefresher, RefreshRequest};
pub use store::{
    CacheChange, CacheEntry, CacheObserver, CacheTxn, CacheValue, EntryStatus,
    NotificationListing, QueryCache,
};
pub use synchronizer::{ApplyOutcome, CacheSynchronizer};
