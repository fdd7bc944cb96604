//! REST operations on notifications.
//!
//! The stream core only consumes these; they are plain request/response
//! calls against the backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::models::{NotificationFilter, NotificationPage, NotificationSettings};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("not authenticated")]
    NotAuthenticated,
}

/// Notification endpoints used by the cache layer.
#[async_trait]
pub trait NotificationsApi: Send + Sync {
    /// GET /notifications, one page of a filtered listing.
    async fn list_notifications(
        &self,
        token: &str,
        filter: &NotificationFilter,
        page: u32,
    ) -> Result<NotificationPage, ApiError>;

    /// GET /notifications/unread-count
    async fn unread_count(&self, token: &str) -> Result<u64, ApiError>;

    /// PATCH /notifications/{id}/read
    async fn mark_read(&self, token: &str, id: u64) -> Result<(), ApiError>;

    /// PATCH /notifications/read-all
    async fn mark_all_read(&self, token: &str) -> Result<(), ApiError>;

    /// DELETE /notifications/{id}
    async fn delete(&self, token: &str, id: u64) -> Result<(), ApiError>;

    /// GET /notifications/settings
    async fn get_settings(&self, token: &str) -> Result<NotificationSettings, ApiError>;

    /// PUT /notifications/settings
    async fn update_settings(
        &self,
        token: &str,
        settings: &NotificationSettings,
    ) -> Result<NotificationSettings, ApiError>;
}

#[derive(Debug, Deserialize)]
struct UnreadCountResponse {
    count: u64,
}

/// `reqwest` implementation with bearer authentication.
pub struct HttpNotificationsApi {
    client: Client,
    base_url: String,
}

impl HttpNotificationsApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/notifications{}", self.base_url, path)
    }

    async fn send(request: RequestBuilder, token: &str) -> Result<Response, ApiError> {
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ApiError::NotAuthenticated);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl NotificationsApi for HttpNotificationsApi {
    async fn list_notifications(
        &self,
        token: &str,
        filter: &NotificationFilter,
        page: u32,
    ) -> Result<NotificationPage, ApiError> {
        debug!("Fetching notifications page {} ({:?})", page, filter);
        let request = self
            .client
            .get(self.url(""))
            .query(&filter.query_pairs(page));
        Ok(Self::send(request, token).await?.json().await?)
    }

    async fn unread_count(&self, token: &str) -> Result<u64, ApiError> {
        let request = self.client.get(self.url("/unread-count"));
        let response: UnreadCountResponse = Self::send(request, token).await?.json().await?;
        Ok(response.count)
    }

    async fn mark_read(&self, token: &str, id: u64) -> Result<(), ApiError> {
        let request = self.client.patch(self.url(&format!("/{}/read", id)));
        Self::send(request, token).await?;
        Ok(())
    }

    async fn mark_all_read(&self, token: &str) -> Result<(), ApiError> {
        let request = self.client.patch(self.url("/read-all"));
        Self::send(request, token).await?;
        Ok(())
    }

    async fn delete(&self, token: &str, id: u64) -> Result<(), ApiError> {
        let request = self.client.delete(self.url(&format!("/{}", id)));
        Self::send(request, token).await?;
        Ok(())
    }

    async fn get_settings(&self, token: &str) -> Result<NotificationSettings, ApiError> {
        let request = self.client.get(self.url("/settings"));
        Ok(Self::send(request, token).await?.json().await?)
    }

    async fn update_settings(
        &self,
        token: &str,
        settings: &NotificationSettings,
    ) -> Result<NotificationSettings, ApiError> {
        let request = self.client.put(self.url("/settings")).json(settings);
        Ok(Self::send(request, token).await?.json().await?)
    }
}
