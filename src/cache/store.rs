//! Process-wide query cache.
//!
//! A single map from [`CacheKey`] to [`CacheEntry`], shared by the REST
//! layer (list refreshes, optimistic edits) and the stream synchronizer.
//! Every mutation runs inside [`QueryCache::transaction`], a synchronous
//! closure executed under one write lock, so a read-then-write sequence can
//! never interleave with another writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::trace;

use super::key::{CacheKey, KeyFilter};
use crate::notifications::{Notification, NotificationPage, NotificationSettings};

/// A notification listing made of one or more pages, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationListing {
    pub pages: Vec<NotificationPage>,
}

impl NotificationListing {
    pub fn new(pages: Vec<NotificationPage>) -> Self {
        Self { pages }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pages.iter().any(|page| page.contains(id))
    }

    pub fn total_count(&self) -> u64 {
        self.pages.first().map(|page| page.total_count).unwrap_or(0)
    }

    pub fn items(&self) -> impl Iterator<Item = &Notification> {
        self.pages.iter().flat_map(|page| page.notifications.iter())
    }

    pub fn ids(&self) -> Vec<u64> {
        self.items().map(|n| n.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(|page| page.notifications.is_empty())
    }
}

/// Cached value of an entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Notifications(NotificationListing),
    UnreadCount(u64),
    Settings(NotificationSettings),
    Json(serde_json::Value),
}

impl CacheValue {
    pub fn as_listing(&self) -> Option<&NotificationListing> {
        match self {
            Self::Notifications(listing) => Some(listing),
            _ => None,
        }
    }

    pub fn as_unread_count(&self) -> Option<u64> {
        match self {
            Self::UnreadCount(count) => Some(*count),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Fresh,
    /// Data is still served, but should be refetched in the background.
    Stale,
}

/// A stored entry. `value` is `None` while a view waits for its first load.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Option<CacheValue>,
    pub status: EntryStatus,
    pub is_fetching: bool,
    pub updated_at: Option<DateTime<Utc>>,
    generation: u64,
    observers: Arc<AtomicUsize>,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            value: None,
            status: EntryStatus::Stale,
            is_fetching: false,
            updated_at: None,
            generation: 0,
            observers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::SeqCst)
    }

    pub fn is_observed(&self) -> bool {
        self.observer_count() > 0
    }

    /// Bumped by every write and invalidation. A fetch that started at an
    /// older generation must not overwrite the entry.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Change notifications for UI observers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange {
    Updated(CacheKey),
    Invalidated(CacheKey),
    Removed(CacheKey),
}

impl CacheChange {
    pub fn key(&self) -> &CacheKey {
        match self {
            Self::Updated(key) | Self::Invalidated(key) | Self::Removed(key) => key,
        }
    }
}

/// Mutable view of the cache handed to transaction closures.
pub struct CacheTxn<'a> {
    entries: &'a mut HashMap<CacheKey, CacheEntry>,
    changes: Vec<CacheChange>,
}

impl CacheTxn<'_> {
    /// Keys selected by `filter`, in a stable order.
    pub fn keys(&self, filter: &KeyFilter) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|key| filter.matches(key))
            .cloned()
            .collect();
        keys.sort_by_key(|key| key.to_string());
        keys
    }

    pub fn entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn value(&self, key: &CacheKey) -> Option<&CacheValue> {
        self.entries.get(key).and_then(|entry| entry.value.as_ref())
    }

    /// Store a freshly loaded value.
    pub fn set(&mut self, key: &CacheKey, value: CacheValue) {
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::empty);
        entry.value = Some(value);
        entry.status = EntryStatus::Fresh;
        entry.is_fetching = false;
        entry.updated_at = Some(Utc::now());
        entry.generation += 1;
        self.changes.push(CacheChange::Updated(key.clone()));
    }

    /// Edit an existing entry in place, keeping its status.
    ///
    /// Returns false if the entry does not exist.
    pub fn modify<F>(&mut self, key: &CacheKey, f: F) -> bool
    where
        F: FnOnce(&mut Option<CacheValue>),
    {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        f(&mut entry.value);
        entry.updated_at = Some(Utc::now());
        entry.generation += 1;
        self.changes.push(CacheChange::Updated(key.clone()));
        true
    }

    pub fn mark_stale(&mut self, key: &CacheKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.status = EntryStatus::Stale;
        entry.generation += 1;
        self.changes.push(CacheChange::Invalidated(key.clone()));
        true
    }

    pub fn set_fetching(&mut self, key: &CacheKey, fetching: bool) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.is_fetching = fetching;
        }
    }

    pub fn remove(&mut self, key: &CacheKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.changes.push(CacheChange::Removed(key.clone()));
        }
        removed
    }
}

/// Keeps a view registered on a key. Dropping it only lowers the
/// observer count; cached data stays.
#[derive(Debug)]
pub struct CacheObserver {
    key: CacheKey,
    count: Arc<AtomicUsize>,
}

impl CacheObserver {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for CacheObserver {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct QueryCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    changes: broadcast::Sender<CacheChange>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            entries: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Run `f` under the write lock and publish the changes it made.
    pub async fn transaction<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut CacheTxn<'_>) -> R,
    {
        let mut entries = self.entries.write().await;
        let mut txn = CacheTxn {
            entries: &mut *entries,
            changes: Vec::new(),
        };
        let result = f(&mut txn);
        let changes = std::mem::take(&mut txn.changes);
        drop(entries);

        for change in changes {
            trace!("Cache change: {:?}", change);
            // No receivers is fine.
            let _ = self.changes.send(change);
        }
        result
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|entry| entry.value.clone())
    }

    pub async fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entries = self.entries.read().await;
        entries.get(key).cloned()
    }

    pub async fn keys(&self, filter: &KeyFilter) -> Vec<CacheKey> {
        let entries = self.entries.read().await;
        let mut keys: Vec<CacheKey> = entries
            .keys()
            .filter(|key| filter.matches(key))
            .cloned()
            .collect();
        keys.sort_by_key(|key| key.to_string());
        keys
    }

    pub async fn set(&self, key: &CacheKey, value: CacheValue) {
        self.transaction(|txn| txn.set(key, value)).await
    }

    /// Mark every entry selected by `filter` as stale. Data is kept.
    pub async fn invalidate(&self, filter: &KeyFilter) -> Vec<CacheKey> {
        self.transaction(|txn| {
            let keys = txn.keys(filter);
            for key in &keys {
                txn.mark_stale(key);
            }
            keys
        })
        .await
    }

    /// Register a view on `key`, creating an empty entry if needed.
    pub async fn observe(&self, key: CacheKey) -> CacheObserver {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_insert_with(CacheEntry::empty);
        entry.observers.fetch_add(1, Ordering::SeqCst);
        CacheObserver {
            key,
            count: entry.observers.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }

    pub async fn listing(&self, key: &CacheKey) -> Option<NotificationListing> {
        self.get(key)
            .await
            .and_then(|value| value.as_listing().cloned())
    }

    pub async fn unread_count(&self, user_id: usize) -> Option<u64> {
        self.get(&CacheKey::unread_count(user_id))
            .await
            .and_then(|value| value.as_unread_count())
    }
}
