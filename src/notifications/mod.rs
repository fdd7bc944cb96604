//! User notifications module

pub mod actions;
pub mod api;
mod models;

pub use actions::NotificationActions;
pub use api::{ApiError, HttpNotificationsApi, NotificationsApi};
pub use models::{
    Notification, NotificationFilter, NotificationPage, NotificationSettings, NotificationType,
    DEFAULT_PER_PAGE,
};

#[cfg(test)]
pub(crate) use models::test_support;
