//! Notification data models
//!
//! Wire format is camelCase JSON, shared by the stream frames and the REST
//! list endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Notification type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Info,
    Success,
    Warning,
    Error,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// A user notification.
///
/// Immutable once created, except for the `is_read` transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: u64,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
}

/// One page of a notification listing, as returned by the list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    pub total_count: u64,
    pub current_page: u32,
    pub per_page: u32,
}

impl NotificationPage {
    /// A first page holding exactly one notification.
    pub fn single(notification: Notification, per_page: u32) -> Self {
        Self {
            notifications: vec![notification],
            total_count: 1,
            current_page: 1,
            per_page,
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.notifications.iter().any(|n| n.id == id)
    }
}

/// Query parameters of a list view.
///
/// Doubles as the `filterParams` part of a cache key, so two views with the
/// same filter share one cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,
    #[serde(
        default,
        rename = "type",
        skip_serializing_if = "Option::is_none"
    )]
    pub notification_type: Option<NotificationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_page: Option<u32>,
}

pub const DEFAULT_PER_PAGE: u32 = 20;

impl NotificationFilter {
    pub fn unread_only() -> Self {
        Self {
            is_read: Some(false),
            ..Default::default()
        }
    }

    pub fn of_type(notification_type: NotificationType) -> Self {
        Self {
            notification_type: Some(notification_type),
            ..Default::default()
        }
    }

    pub fn per_page(&self) -> u32 {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE)
    }

    /// Whether a notification belongs in a list with this filter.
    pub fn accepts(&self, notification: &Notification) -> bool {
        if let Some(is_read) = self.is_read {
            if notification.is_read != is_read {
                return false;
            }
        }
        if let Some(notification_type) = self.notification_type {
            if notification.notification_type != notification_type {
                return false;
            }
        }
        true
    }

    /// Query string pairs for the list endpoint.
    pub fn query_pairs(&self, page: u32) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("page", page.to_string()),
            ("perPage", self.per_page().to_string()),
        ];
        if let Some(is_read) = self.is_read {
            pairs.push(("isRead", is_read.to_string()));
        }
        if let Some(notification_type) = self.notification_type {
            pairs.push(("type", notification_type.as_str().to_string()));
        }
        pairs
    }
}

/// Per-user notification preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettings {
    pub email_enabled: bool,
    pub push_enabled: bool,
    #[serde(default)]
    pub muted_types: Vec<NotificationType>,
}
