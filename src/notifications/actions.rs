//! User-initiated notification mutations.
//!
//! Each action edits the cache optimistically and calls the REST endpoint.
//! On failure only the edit itself is undone, so stream updates that landed
//! meanwhile stay. Either way the user's notification entries are then
//! marked stale for a background refetch.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::api::{ApiError, NotificationsApi};
use super::models::NotificationSettings;
use crate::auth::{Identity, IdentityReceiver};
use crate::cache::{optimistic, CacheKey, CacheValue, KeyFilter, QueryCache, RefreshRequest};

pub struct NotificationActions {
    cache: Arc<QueryCache>,
    api: Arc<dyn NotificationsApi>,
    identity: IdentityReceiver,
    refresh_tx: Option<mpsc::UnboundedSender<RefreshRequest>>,
}

impl NotificationActions {
    pub fn new(
        cache: Arc<QueryCache>,
        api: Arc<dyn NotificationsApi>,
        identity: IdentityReceiver,
        refresh_tx: Option<mpsc::UnboundedSender<RefreshRequest>>,
    ) -> Self {
        Self {
            cache,
            api,
            identity,
            refresh_tx,
        }
    }

    fn identity(&self) -> Result<Identity, ApiError> {
        self.identity
            .borrow()
            .clone()
            .ok_or(ApiError::NotAuthenticated)
    }

    pub async fn mark_read(&self, id: u64) -> Result<(), ApiError> {
        let identity = self.identity()?;
        let user_id = identity.user_id;
        let rollback = self
            .cache
            .transaction(|txn| optimistic::mark_read(txn, user_id, id))
            .await;

        match self.api.mark_read(&identity.token, id).await {
            Ok(()) => {
                self.revalidate(user_id).await;
                Ok(())
            }
            Err(err) => {
                warn!("Mark read of {} failed, rolling back: {}", id, err);
                self.cache.transaction(|txn| rollback.undo(txn)).await;
                self.revalidate(user_id).await;
                Err(err)
            }
        }
    }

    pub async fn mark_all_read(&self) -> Result<(), ApiError> {
        let identity = self.identity()?;
        let user_id = identity.user_id;
        let rollback = self
            .cache
            .transaction(|txn| optimistic::mark_all_read(txn, user_id))
            .await;

        match self.api.mark_all_read(&identity.token).await {
            Ok(()) => {
                self.revalidate(user_id).await;
                Ok(())
            }
            Err(err) => {
                warn!("Mark all read failed, rolling back: {}", err);
                self.cache.transaction(|txn| rollback.undo(txn)).await;
                self.revalidate(user_id).await;
                Err(err)
            }
        }
    }

    pub async fn delete(&self, id: u64) -> Result<(), ApiError> {
        let identity = self.identity()?;
        let user_id = identity.user_id;
        let rollback = self
            .cache
            .transaction(|txn| optimistic::delete(txn, user_id, id))
            .await;

        match self.api.delete(&identity.token, id).await {
            Ok(()) => {
                self.revalidate(user_id).await;
                Ok(())
            }
            Err(err) => {
                warn!("Delete of {} failed, rolling back: {}", id, err);
                self.cache.transaction(|txn| rollback.undo(txn)).await;
                self.revalidate(user_id).await;
                Err(err)
            }
        }
    }

    /// Settings are not edited optimistically; the cache takes the server's
    /// answer.
    pub async fn update_settings(
        &self,
        settings: &NotificationSettings,
    ) -> Result<NotificationSettings, ApiError> {
        let identity = self.identity()?;
        let updated = self.api.update_settings(&identity.token, settings).await?;
        self.cache
            .set(
                &CacheKey::settings(identity.user_id),
                CacheValue::Settings(updated.clone()),
            )
            .await;
        Ok(updated)
    }

    async fn revalidate(&self, user_id: usize) {
        let mut keys = self
            .cache
            .invalidate(&KeyFilter::NotificationListsOf(user_id))
            .await;
        keys.extend(self.cache.invalidate(&KeyFilter::UnreadCountOf(user_id)).await);
        debug!("Revalidating {} entries for user {}", keys.len(), user_id);

        if let Some(refresh_tx) = &self.refresh_tx {
            if refresh_tx.send(RefreshRequest { user_id, keys }).is_err() {
                warn!("Refresher is gone, skipping background refresh");
            }
        }
    }
}
