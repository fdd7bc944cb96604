use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use recruit_notifications::cache::{CacheKey, CacheValue, NotificationListing, QueryCache};
use recruit_notifications::config::{AppConfig, CliConfig, FileConfig};
use recruit_notifications::notifications::{
    HttpNotificationsApi, NotificationFilter, NotificationsApi,
};
use recruit_notifications::{AuthState, NotificationSync, SseTransport};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Base URL of the backend API, e.g. https://api.example.com
    #[clap(long)]
    pub base_url: Option<String>,

    /// Id of the authenticated user.
    #[clap(long)]
    pub user_id: usize,

    /// Access token of the authenticated user.
    #[clap(long)]
    pub token: String,

    /// Path to a TOML config file. Values in the file override CLI values.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Timeout in seconds for REST requests.
    #[clap(long, default_value_t = 30)]
    pub request_timeout_sec: u64,

    /// Delay in milliseconds before reconnecting a dropped stream.
    #[clap(long, default_value_t = 3000)]
    pub reconnect_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        base_url: cli_args.base_url.clone(),
        request_timeout_secs: cli_args.request_timeout_sec,
        reconnect_delay_ms: cli_args.reconnect_delay_ms,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    let api: Arc<dyn NotificationsApi> = Arc::new(
        HttpNotificationsApi::new(&config.base_url, config.request_timeout())
            .context("Failed to build REST client")?,
    );
    // No timeout on the stream client: the connection is meant to stay open.
    let stream_client = reqwest::Client::builder()
        .build()
        .context("Failed to build stream client")?;
    let transport = Arc::new(SseTransport::new(stream_client));

    let auth = AuthState::new();
    auth.login(cli_args.user_id, cli_args.token.clone());
    if auth.current().is_none() {
        anyhow::bail!("An access token is required");
    }

    let cache = Arc::new(QueryCache::new());
    prime_cache(&cache, api.as_ref(), cli_args.user_id, &cli_args.token).await;

    let sync = NotificationSync::start(
        config.sync_settings(),
        &auth,
        transport,
        api,
        cache.clone(),
    );
    let list_key = CacheKey::notifications(cli_args.user_id, NotificationFilter::default());
    let view = sync.view(list_key.clone()).await;

    let mut changes = cache.subscribe();
    let mut states = sync.connection_states();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!("Connection state: {:?}", state);
            }
            change = changes.recv() => match change {
                Ok(change) => {
                    debug!("Cache change: {:?}", change);
                    if change.key() == &list_key {
                        if let Some(listing) = cache.listing(&list_key).await {
                            log_listing(&listing);
                        }
                    }
                    if change.key() == &CacheKey::unread_count(cli_args.user_id) {
                        if let Some(count) = cache.unread_count(cli_args.user_id).await {
                            info!("Unread notifications: {}", count);
                        }
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Change log lagged by {} entries", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    drop(view);
    sync.shutdown().await;
    info!("Bye");
    Ok(())
}

/// Load the unread count and the first page before the stream starts.
/// Failures are logged; the stream still runs.
async fn prime_cache(cache: &QueryCache, api: &dyn NotificationsApi, user_id: usize, token: &str) {
    match api.unread_count(token).await {
        Ok(count) => {
            info!("Unread notifications: {}", count);
            cache
                .set(&CacheKey::unread_count(user_id), CacheValue::UnreadCount(count))
                .await;
        }
        Err(e) => warn!("Failed to load unread count: {}", e),
    }

    let filter = NotificationFilter::default();
    match api.list_notifications(token, &filter, 1).await {
        Ok(page) => {
            info!(
                "Loaded {} of {} notifications",
                page.notifications.len(),
                page.total_count
            );
            cache
                .set(
                    &CacheKey::notifications(user_id, filter),
                    CacheValue::Notifications(NotificationListing::new(vec![page])),
                )
                .await;
        }
        Err(e) => warn!("Failed to load notifications: {}", e),
    }
}

fn log_listing(listing: &NotificationListing) {
    info!("Notifications ({} total):", listing.total_count());
    for notification in listing.items().take(5) {
        info!(
            "  [{}] #{} {}{}",
            notification.notification_type.as_str(),
            notification.id,
            notification.title,
            if notification.is_read { "" } else { " (new)" }
        );
    }
}
