//! When to reconnect after the stream drops.
//!
//! Backoff is `initial_delay * multiplier^failed_attempts`, capped at
//! `max_delay`. The default is a fixed three second delay with no attempt
//! limit.

use std::time::Duration;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Applied per consecutive failed attempt. `1.0` keeps the delay fixed.
    pub backoff_multiplier: f64,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    /// Consecutive failed attempts after which we stop. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
            max_attempts: None,
        }
    }

    /// Delay before the next attempt, given how many attempts in a row have
    /// failed to reach `Open`.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| failed_attempts < max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}
