//! Wiring of the notification core.
//!
//! [`NotificationSync`] owns the background tasks (stream controller and
//! cache refresher) for the lifetime of the application. Views come and go
//! through [`NotificationSync::view`]; dropping a view never affects the
//! connection.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthState;
use crate::cache::{
    CacheChange, CacheEntry, CacheKey, CacheObserver, CacheRefresher, CacheSynchronizer,
    QueryCache, RefreshRequest,
};
use crate::notifications::{NotificationActions, NotificationsApi};
use crate::stream::{
    ConnectionState, EventDecoder, ReconnectPolicy, ReconnectionController, Transport,
};

/// Runtime settings of the notification core.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub base_url: String,
    pub reconnect: ReconnectPolicy,
    pub frame_excerpt_len: usize,
    pub refresh_enabled: bool,
}

pub struct NotificationSync {
    cache: Arc<QueryCache>,
    actions: Arc<NotificationActions>,
    state_rx: watch::Receiver<ConnectionState>,
    refresh_tx: Option<mpsc::UnboundedSender<RefreshRequest>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl NotificationSync {
    /// Build the core and spawn its tasks. Must run inside a tokio runtime.
    pub fn start(
        settings: SyncSettings,
        auth: &AuthState,
        transport: Arc<dyn Transport>,
        api: Arc<dyn NotificationsApi>,
        cache: Arc<QueryCache>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let refresh_tx = if settings.refresh_enabled {
            let (tx, rx) = mpsc::unbounded_channel();
            let refresher = CacheRefresher::new(cache.clone(), api.clone(), auth.subscribe());
            tasks.push(tokio::spawn(refresher.run(rx, shutdown.clone())));
            Some(tx)
        } else {
            info!("Background refresh disabled");
            None
        };

        let synchronizer =
            CacheSynchronizer::new(cache.clone(), auth.subscribe(), refresh_tx.clone());
        let controller = ReconnectionController::new(
            transport,
            &settings.base_url,
            settings.reconnect.clone(),
            EventDecoder::new(settings.frame_excerpt_len),
            synchronizer,
            auth.subscribe(),
        );
        let state_rx = controller.state_receiver();
        tasks.push(tokio::spawn(controller.run(shutdown.clone())));

        let actions = Arc::new(NotificationActions::new(
            cache.clone(),
            api,
            auth.subscribe(),
            refresh_tx.clone(),
        ));

        info!("Notification sync started for {}", settings.base_url);
        Self {
            cache,
            actions,
            state_rx,
            refresh_tx,
            shutdown,
            tasks,
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn actions(&self) -> Arc<NotificationActions> {
        self.actions.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn connection_states(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Register a view on `key`. A key with no data yet is queued for a
    /// background fetch.
    pub async fn view(&self, key: CacheKey) -> NotificationView {
        let changes = self.cache.subscribe();
        let observer = self.cache.observe(key.clone()).await;

        let needs_load = self
            .cache
            .entry(&key)
            .await
            .is_some_and(|entry| entry.value.is_none());
        if needs_load {
            if let Some(refresh_tx) = &self.refresh_tx {
                let request = RefreshRequest {
                    user_id: key.user_id,
                    keys: vec![key],
                };
                if refresh_tx.send(request).is_err() {
                    warn!("Refresher is gone, view will wait for stream data");
                }
            }
        }

        NotificationView {
            cache: self.cache.clone(),
            observer,
            changes,
        }
    }

    /// Stop the controller and the refresher, closing the stream.
    pub async fn shutdown(self) {
        info!("Shutting down notification sync");
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Notification task ended abnormally: {}", e);
            }
        }
    }
}

/// A consumer of one cache entry.
pub struct NotificationView {
    cache: Arc<QueryCache>,
    observer: CacheObserver,
    changes: broadcast::Receiver<CacheChange>,
}

impl NotificationView {
    pub fn key(&self) -> &CacheKey {
        self.observer.key()
    }

    pub async fn current(&self) -> Option<CacheEntry> {
        self.cache.entry(self.key()).await
    }

    /// Wait until the entry changes. Returns `None` once the cache is gone.
    pub async fn changed(&mut self) -> Option<CacheChange> {
        loop {
            match self.changes.recv().await {
                Ok(change) if change.key() == self.observer.key() => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("View on {} lagged by {} changes", self.key(), n);
                    return Some(CacheChange::Updated(self.key().clone()));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
