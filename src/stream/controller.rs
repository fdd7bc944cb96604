//! Identity-aware lifecycle of the notification stream.
//!
//! The controller keeps exactly one connection for the authenticated user:
//! it connects on login, tears the connection down on logout or when the
//! user changes, and schedules a single delayed reconnect when the stream
//! drops while the same user is still logged in. Views never own the
//! connection, so nothing a view does can close it.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decoder::{EventDecoder, StreamEvent};
use super::retry_policy::ReconnectPolicy;
use super::transport::{
    stream_url, ConnectRequest, ConnectionHandle, EventSink, ReadyState, Transport,
    TransportEvent, TransportEventKind,
};
use crate::auth::{Identity, IdentityReceiver};
use crate::cache::{ApplyOutcome, CacheSynchronizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nobody is logged in.
    Idle,
    Connecting,
    Open,
    /// The last connection ended. A retry may be pending.
    Closed,
}

struct ActiveConnection {
    id: u64,
    identity: Identity,
    handle: Box<dyn ConnectionHandle>,
    opened: bool,
}

#[derive(Debug, Clone)]
struct PendingRetry {
    identity: Identity,
    deadline: Instant,
}

enum Step {
    Shutdown,
    IdentityChanged,
    AuthGone,
    Transport(TransportEvent),
    RetryDue,
}

pub struct ReconnectionController {
    transport: Arc<dyn Transport>,
    base_url: String,
    policy: ReconnectPolicy,
    decoder: EventDecoder,
    synchronizer: CacheSynchronizer,
    identity_rx: IdentityReceiver,
    state_tx: watch::Sender<ConnectionState>,
    active: Option<ActiveConnection>,
    retry: Option<PendingRetry>,
    failed_attempts: u32,
    next_connection_id: u64,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl ReconnectionController {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: &str,
        policy: ReconnectPolicy,
        decoder: EventDecoder,
        synchronizer: CacheSynchronizer,
        identity_rx: IdentityReceiver,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            policy,
            decoder,
            synchronizer,
            identity_rx,
            state_tx,
            active: None,
            retry: None,
            failed_attempts: 0,
            next_connection_id: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn retry_pending(&self) -> bool {
        self.retry.is_some()
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry.as_ref().map(|retry| retry.deadline)
    }

    /// User the live connection belongs to, if any.
    pub fn active_user(&self) -> Option<usize> {
        self.active.as_ref().map(|active| active.identity.user_id)
    }

    /// Main loop. Call from a spawned task.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Notification stream controller starting (reconnect delay {:?})",
            self.policy.initial_delay
        );
        let initial = self.identity_rx.borrow_and_update().clone();
        self.on_identity(initial);

        loop {
            let retry_deadline = self.retry_deadline();
            let step = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Step::Shutdown,
                changed = self.identity_rx.changed() => {
                    if changed.is_ok() { Step::IdentityChanged } else { Step::AuthGone }
                }
                Some(event) = self.events_rx.recv() => Step::Transport(event),
                _ = tokio::time::sleep_until(retry_deadline.unwrap_or_else(Instant::now)),
                    if retry_deadline.is_some() => Step::RetryDue,
            };

            match step {
                Step::Shutdown => break,
                Step::IdentityChanged => {
                    let identity = self.identity_rx.borrow_and_update().clone();
                    self.on_identity(identity);
                }
                Step::AuthGone => {
                    warn!("Identity source dropped, stopping notification stream");
                    break;
                }
                Step::Transport(event) => self.on_transport_event(event).await,
                Step::RetryDue => self.on_retry_timer(),
            }
        }

        self.retry = None;
        self.close_active("shutdown");
        self.set_state(ConnectionState::Idle);
        info!("Notification stream controller stopped");
    }

    /// React to a new value of the identity stream.
    pub fn on_identity(&mut self, identity: Option<Identity>) {
        let Some(identity) = identity else {
            if self.retry.take().is_some() {
                debug!("Cancelled pending reconnect on logout");
            }
            self.close_active("logout");
            self.failed_attempts = 0;
            self.set_state(ConnectionState::Idle);
            return;
        };

        if let Some(active) = self.active.as_mut() {
            if active.identity.user_id == identity.user_id {
                // Already connecting or open for this user. A refreshed
                // token is only needed for the next connect.
                if active.identity.token != identity.token {
                    debug!("Token refreshed for user {}", identity.user_id);
                    active.identity = identity;
                }
                return;
            }
            info!(
                "User changed from {} to {}, replacing notification stream",
                active.identity.user_id, identity.user_id
            );
            self.close_active("user changed");
        }

        if let Some(retry) = &self.retry {
            if retry.identity == identity {
                return;
            }
            debug!("Identity changed, cancelling pending reconnect");
            self.retry = None;
        }

        self.failed_attempts = 0;
        self.connect(identity);
    }

    pub async fn on_transport_event(&mut self, event: TransportEvent) {
        let Some(active) = self.active.as_mut() else {
            debug!("Ignoring event from closed connection {}", event.connection_id);
            return;
        };
        if active.id != event.connection_id {
            debug!(
                "Ignoring event from stale connection {} (current {})",
                event.connection_id, active.id
            );
            return;
        }

        match event.kind {
            TransportEventKind::Open => {
                active.opened = true;
                info!("Notification stream open for user {}", active.identity.user_id);
                self.failed_attempts = 0;
                self.set_state(ConnectionState::Open);
            }
            TransportEventKind::Frame(raw) => {
                let user_id = active.identity.user_id;
                match self.decoder.decode(&raw) {
                    Some(StreamEvent::Notification(notification)) => {
                        let outcome = self.synchronizer.apply(user_id, notification).await;
                        if outcome == ApplyOutcome::Duplicate {
                            debug!("Duplicate notification delivery ignored");
                        }
                    }
                    Some(StreamEvent::Handshake { .. }) | None => {}
                }
            }
            TransportEventKind::Error {
                message,
                ready_state,
            } => {
                if ready_state == ReadyState::Open {
                    warn!("Notification stream error (keeping connection): {}", message);
                } else {
                    warn!("Notification stream error: {}", message);
                }
            }
            TransportEventKind::Closed { reason } => {
                let Some(closed) = self.active.take() else {
                    return;
                };
                warn!(
                    "Notification stream for user {} closed: {}",
                    closed.identity.user_id, reason
                );
                if !closed.opened {
                    self.failed_attempts += 1;
                }
                self.set_state(ConnectionState::Closed);

                let still_current = self.identity_rx.borrow().as_ref() == Some(&closed.identity);
                if still_current {
                    self.schedule_retry(closed.identity);
                }
            }
        }
    }

    /// The retry deadline passed. Connects only if the identity the retry
    /// was scheduled for is still the current one.
    pub fn on_retry_timer(&mut self) {
        let Some(retry) = self.retry.take() else {
            return;
        };
        if self.active.is_some() {
            debug!("Connection already active, dropping reconnect");
            return;
        }
        let current = self.identity_rx.borrow().clone();
        if current.as_ref() != Some(&retry.identity) {
            debug!(
                "Abandoning reconnect for user {}: identity changed",
                retry.identity.user_id
            );
            return;
        }
        info!("Reconnecting notification stream for user {}", retry.identity.user_id);
        self.connect(retry.identity);
    }

    fn connect(&mut self, identity: Identity) {
        self.close_active("reconnect");
        self.next_connection_id += 1;
        let id = self.next_connection_id;
        let request = ConnectRequest {
            url: stream_url(&self.base_url, &identity.token),
            user_id: identity.user_id,
        };
        self.set_state(ConnectionState::Connecting);

        match self
            .transport
            .connect(request, EventSink::new(id, self.events_tx.clone()))
        {
            Ok(handle) => {
                debug!("Connection {} started for user {}", id, identity.user_id);
                self.active = Some(ActiveConnection {
                    id,
                    identity,
                    handle,
                    opened: false,
                });
            }
            Err(e) => {
                warn!("Cannot open notification stream: {}", e);
                self.failed_attempts += 1;
                self.set_state(ConnectionState::Closed);
                self.schedule_retry(identity);
            }
        }
    }

    fn schedule_retry(&mut self, identity: Identity) {
        if !self.policy.should_retry(self.failed_attempts) {
            warn!(
                "Giving up on notification stream for user {} after {} failed attempts",
                identity.user_id, self.failed_attempts
            );
            return;
        }
        let delay = self.policy.delay_for(self.failed_attempts);
        info!(
            "Reconnecting notification stream for user {} in {:?}",
            identity.user_id, delay
        );
        self.retry = Some(PendingRetry {
            identity,
            deadline: Instant::now() + delay,
        });
    }

    fn close_active(&mut self, reason: &str) {
        if let Some(mut active) = self.active.take() {
            debug!(
                "Closing connection {} for user {} ({})",
                active.id, active.identity.user_id, reason
            );
            active.handle.close();
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}
