//! Cache keys and the key-matching predicate.
//!
//! Every notification-related key renders to a path starting with
//! `["notifications", <user_id>]`, so the REST layer and the stream core
//! address the same entries. The sub-resource decides how a stream event
//! may touch the entry.

use std::fmt;

use crate::notifications::NotificationFilter;

pub const NOTIFICATIONS_PREFIX: &str = "notifications";

/// What a cache entry holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A (possibly filtered, possibly multi-page) notification listing.
    Notifications,
    /// The unread counter. Shares the notifications prefix.
    UnreadCount,
    /// Notification settings. Shares the notifications prefix.
    Settings,
    /// Anything else the application caches (profiles, jobs, ...).
    Other(String),
}

impl ResourceKind {
    fn sub_path(&self) -> Option<&str> {
        match self {
            Self::Notifications => None,
            Self::UnreadCount => Some("unread-count"),
            Self::Settings => Some("settings"),
            Self::Other(name) => Some(name.as_str()),
        }
    }
}

/// Structured cache key: `(resource_kind, user_id, filter)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: ResourceKind,
    pub user_id: usize,
    pub filter: NotificationFilter,
}

impl CacheKey {
    pub fn notifications(user_id: usize, filter: NotificationFilter) -> Self {
        Self {
            kind: ResourceKind::Notifications,
            user_id,
            filter,
        }
    }

    pub fn unread_count(user_id: usize) -> Self {
        Self {
            kind: ResourceKind::UnreadCount,
            user_id,
            filter: NotificationFilter::default(),
        }
    }

    pub fn settings(user_id: usize) -> Self {
        Self {
            kind: ResourceKind::Settings,
            user_id,
            filter: NotificationFilter::default(),
        }
    }

    pub fn other(name: impl Into<String>, user_id: usize) -> Self {
        Self {
            kind: ResourceKind::Other(name.into()),
            user_id,
            filter: NotificationFilter::default(),
        }
    }

    /// Path segments, e.g. `["notifications", "42", "unread-count"]`.
    pub fn path(&self) -> Vec<String> {
        let root = match &self.kind {
            ResourceKind::Other(name) => return vec![name.clone(), self.user_id.to_string()],
            _ => NOTIFICATIONS_PREFIX,
        };
        let mut path = vec![root.to_string(), self.user_id.to_string()];
        match self.kind.sub_path() {
            Some(sub) => path.push(sub.to_string()),
            None => {
                if self.filter != NotificationFilter::default() {
                    path.push(serde_json::to_string(&self.filter).unwrap_or_default());
                }
            }
        }
        path
    }

    /// Whether this key lives under the notifications prefix of `user_id`.
    pub fn is_under_notifications_of(&self, user_id: usize) -> bool {
        self.user_id == user_id && !matches!(self.kind, ResourceKind::Other(_))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().join("/"))
    }
}

/// Selects a set of cache entries.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyFilter {
    /// Notification listings of one user. Excludes the unread counter and
    /// settings even though they share the key prefix.
    NotificationListsOf(usize),
    /// The unread counter of one user.
    UnreadCountOf(usize),
    /// Everything under the notifications prefix of one user.
    NotificationsPrefixOf(usize),
    Exact(CacheKey),
}

impl KeyFilter {
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::NotificationListsOf(user_id) => {
                key.kind == ResourceKind::Notifications && key.user_id == *user_id
            }
            Self::UnreadCountOf(user_id) => {
                key.kind == ResourceKind::UnreadCount && key.user_id == *user_id
            }
            Self::NotificationsPrefixOf(user_id) => key.is_under_notifications_of(*user_id),
            Self::Exact(exact) => key == exact,
        }
    }
}
