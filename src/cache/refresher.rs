//! Background refresh of stale cache entries.
//!
//! Only entries that are stale and currently observed by a view are
//! refetched. Cached data is kept while the request runs, so views never
//! fall back to a loading state. Results are written only if the user that
//! requested the refresh is still the authenticated one.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::key::{CacheKey, ResourceKind};
use super::store::{CacheEntry, CacheValue, EntryStatus, NotificationListing, QueryCache};
use crate::auth::{Identity, IdentityReceiver};
use crate::notifications::{ApiError, NotificationsApi};

/// Keys of one user that should be refetched.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshRequest {
    pub user_id: usize,
    pub keys: Vec<CacheKey>,
}

pub struct CacheRefresher {
    cache: Arc<QueryCache>,
    api: Arc<dyn NotificationsApi>,
    identity: IdentityReceiver,
}

impl CacheRefresher {
    pub fn new(
        cache: Arc<QueryCache>,
        api: Arc<dyn NotificationsApi>,
        identity: IdentityReceiver,
    ) -> Self {
        Self {
            cache,
            api,
            identity,
        }
    }

    /// Process refresh requests until shutdown or until all senders are gone.
    ///
    /// Requests queued while a refresh runs are merged, so a burst of
    /// notifications costs one refetch per view.
    pub async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<RefreshRequest>,
        shutdown: CancellationToken,
    ) {
        info!("Cache refresher starting");
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let mut batch = vec![request];
            while let Ok(more) = requests.try_recv() {
                batch.push(more);
            }

            for request in merge_requests(batch) {
                self.refresh(request).await;
            }
        }
        info!("Cache refresher stopped");
    }

    /// Refetch the observed stale entries of a request.
    ///
    /// Returns how many entries were written.
    pub async fn refresh(&self, request: RefreshRequest) -> usize {
        let Some(identity) = self.current_identity(request.user_id) else {
            debug!(
                "Skipping refresh for user {}: no longer authenticated",
                request.user_id
            );
            return 0;
        };

        let mut refreshed = 0;
        for key in request.keys {
            let started = self
                .cache
                .transaction(|txn| {
                    let entry = txn.entry(&key)?;
                    if !entry.is_observed()
                        || entry.status != EntryStatus::Stale
                        || entry.is_fetching
                    {
                        return None;
                    }
                    let pages = entry
                        .value
                        .as_ref()
                        .and_then(CacheValue::as_listing)
                        .map(|listing| listing.pages.len())
                        .unwrap_or(0)
                        .max(1);
                    let generation = entry.generation();
                    txn.set_fetching(&key, true);
                    Some((pages as u32, generation))
                })
                .await;
            let Some((pages, generation)) = started else {
                continue;
            };

            let result = self.fetch(&identity, &key, pages).await;
            let written = self
                .cache
                .transaction(|txn| match result {
                    // Written while the request ran (for example a stream
                    // item was prepended): keep it stale for the queued
                    // follow-up instead of replacing it with older data.
                    Ok(Some(_))
                        if txn.entry(&key).map(CacheEntry::generation) != Some(generation) =>
                    {
                        debug!("{} changed during refresh, keeping it stale", key);
                        txn.set_fetching(&key, false);
                        false
                    }
                    Ok(Some(value)) if self.is_current(identity.user_id) => {
                        txn.set(&key, value);
                        true
                    }
                    Ok(_) => {
                        txn.set_fetching(&key, false);
                        false
                    }
                    Err(err) => {
                        warn!("Failed to refresh {}: {}", key, err);
                        txn.set_fetching(&key, false);
                        false
                    }
                })
                .await;
            if written {
                refreshed += 1;
            }
        }
        refreshed
    }

    async fn fetch(
        &self,
        identity: &Identity,
        key: &CacheKey,
        pages: u32,
    ) -> Result<Option<CacheValue>, ApiError> {
        let token = identity.token.as_str();
        let value = match &key.kind {
            ResourceKind::Notifications => {
                let mut fetched = Vec::with_capacity(pages as usize);
                for page in 1..=pages {
                    fetched.push(self.api.list_notifications(token, &key.filter, page).await?);
                }
                CacheValue::Notifications(NotificationListing::new(fetched))
            }
            ResourceKind::UnreadCount => CacheValue::UnreadCount(self.api.unread_count(token).await?),
            ResourceKind::Settings => CacheValue::Settings(self.api.get_settings(token).await?),
            ResourceKind::Other(_) => return Ok(None),
        };
        Ok(Some(value))
    }

    fn current_identity(&self, user_id: usize) -> Option<Identity> {
        self.identity
            .borrow()
            .as_ref()
            .filter(|identity| identity.user_id == user_id)
            .cloned()
    }

    fn is_current(&self, user_id: usize) -> bool {
        self.current_identity(user_id).is_some()
    }
}

/// Merge requests per user, keeping the first occurrence order of keys.
fn merge_requests(batch: Vec<RefreshRequest>) -> Vec<RefreshRequest> {
    let mut merged: Vec<RefreshRequest> = Vec::new();
    for request in batch {
        match merged.iter_mut().find(|r| r.user_id == request.user_id) {
            Some(existing) => {
                for key in request.keys {
                    if !existing.keys.contains(&key) {
                        existing.keys.push(key);
                    }
                }
            }
            None => merged.push(request),
        }
    }
    merged
}
