//! Shared constants for end-to-end tests

/// User the tests authenticate as
pub const TEST_USER_ID: usize = 42;

/// Token with characters that must be escaped in a query string
pub const TEST_TOKEN: &str = "tok en+/=";

/// Short reconnect delay so drop tests stay fast
pub const TEST_RECONNECT_DELAY_MS: u64 = 100;

/// Upper bound for any wait in the e2e tests
pub const WAIT_TIMEOUT_MS: u64 = 5000;

pub const POLL_INTERVAL_MS: u64 = 20;
