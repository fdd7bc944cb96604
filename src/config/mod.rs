mod file_config;

pub use file_config::{FileConfig, ReconnectConfig, RefreshConfig};

use anyhow::{bail, Result};
use std::time::Duration;

use crate::service::SyncSettings;
use crate::stream::{ReconnectPolicy, DEFAULT_EXCERPT_LEN};

const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_secs: 30,
            reconnect_delay_ms: 3000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub frame_excerpt_len: usize,

    // Feature configs (with defaults)
    pub reconnect: ReconnectSettings,
    pub refresh_enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: Option<u32>,
}

impl ReconnectSettings {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let base_url = file
            .base_url
            .or_else(|| cli.base_url.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("base_url must be specified via --base-url or in config file")
            })?;
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            bail!("base_url is empty");
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            bail!("base_url must be an http(s) URL: {}", base_url);
        }

        let request_timeout_secs = file
            .request_timeout_secs
            .unwrap_or(cli.request_timeout_secs);
        if request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }

        let frame_excerpt_len = file.frame_excerpt_len.unwrap_or(DEFAULT_EXCERPT_LEN);

        // Reconnect settings - merge file config with defaults
        let rc_file = file.reconnect.unwrap_or_default();
        let initial_delay_ms = rc_file.initial_delay_ms.unwrap_or(cli.reconnect_delay_ms);
        let reconnect = ReconnectSettings {
            initial_delay_ms,
            backoff_multiplier: rc_file.backoff_multiplier.unwrap_or(1.0),
            max_delay_ms: rc_file.max_delay_ms.unwrap_or(DEFAULT_MAX_DELAY_MS.max(initial_delay_ms)),
            max_attempts: rc_file.max_attempts,
        };
        if reconnect.initial_delay_ms == 0 {
            bail!("reconnect.initial_delay_ms must be greater than zero");
        }
        if !reconnect.backoff_multiplier.is_finite() || reconnect.backoff_multiplier < 1.0 {
            bail!(
                "reconnect.backoff_multiplier must be at least 1.0, got {}",
                reconnect.backoff_multiplier
            );
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            bail!(
                "reconnect.max_delay_ms ({}) is below reconnect.initial_delay_ms ({})",
                reconnect.max_delay_ms,
                reconnect.initial_delay_ms
            );
        }
        if reconnect.max_attempts == Some(0) {
            bail!("reconnect.max_attempts must be at least 1 when set");
        }

        let refresh_enabled = file.refresh.unwrap_or_default().enabled.unwrap_or(true);

        Ok(Self {
            base_url,
            request_timeout_secs,
            frame_excerpt_len,
            reconnect,
            refresh_enabled,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            base_url: self.base_url.clone(),
            reconnect: self.reconnect.policy(),
            frame_excerpt_len: self.frame_excerpt_len,
            refresh_enabled: self.refresh_enabled,
        }
    }
}
