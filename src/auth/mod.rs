//! Authentication identity as seen by the notification core.
//!
//! The real login flow lives elsewhere; this module only publishes the
//! current `(user_id, token)` pair so the stream controller, the cache
//! synchronizer and the refresher can react to identity changes.

use tokio::sync::watch;

/// The authenticated user and the access token used for the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: usize,
    pub token: String,
}

impl Identity {
    pub fn new(user_id: usize, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }
}

/// Receiving side of the identity stream.
pub type IdentityReceiver = watch::Receiver<Option<Identity>>;

/// Publisher of identity changes.
///
/// `None` means nobody is logged in (or no token is available).
pub struct AuthState {
    sender: watch::Sender<Option<Identity>>,
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthState {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    /// Publish a logged-in identity. An empty token counts as logged out.
    pub fn login(&self, user_id: usize, token: impl Into<String>) {
        let token = token.into();
        if token.is_empty() {
            self.logout();
            return;
        }
        self.sender.send_replace(Some(Identity::new(user_id, token)));
    }

    pub fn logout(&self) {
        self.sender.send_replace(None);
    }

    pub fn current(&self) -> Option<Identity> {
        self.sender.borrow().clone()
    }

    pub fn current_user_id(&self) -> Option<usize> {
        self.sender.borrow().as_ref().map(|identity| identity.user_id)
    }

    pub fn subscribe(&self) -> IdentityReceiver {
        self.sender.subscribe()
    }
}
