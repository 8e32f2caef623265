//! Tunables of the ledger core. Every field has a default, so a config file
//! only needs to name what it overrides.

use std::{io::Read, time::Duration};

use chrono::TimeDelta;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// how long a command waits for an account or request lock
    pub lock_timeout_ms: u64,
    /// internal retries of lock timeouts before surfacing them
    pub max_transient_retries: u32,
    /// first retry delay, doubled on each further attempt
    pub retry_backoff_ms: u64,
    /// time-to-live of payment requests created without an explicit one
    pub default_request_ttl_secs: i64,
    /// period of the background expiry sweep
    pub sweep_interval_ms: u64,
    /// largest page a history query may ask for
    pub max_page_size: usize,
    /// transactions shown in an account summary
    pub recent_activity_len: usize,
    /// length of generated public handles
    pub handle_length: usize,
    /// prefix of shareable payment links
    pub link_base_url: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 250,
            max_transient_retries: 3,
            retry_backoff_ms: 10,
            default_request_ttl_secs: 7 * 24 * 60 * 60,
            sweep_interval_ms: 1_000,
            max_page_size: 100,
            recent_activity_len: 5,
            handle_length: 10,
            link_base_url: "https://pay.example.com".to_string(),
        }
    }
}

impl LedgerConfig {
    /// Reads a JSON document, missing fields fall back to defaults.
    pub fn from_reader<R: Read>(reader: R) -> serde_json::Result<Self> {
        serde_json::from_reader(reader)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn default_request_ttl(&self) -> TimeDelta {
        TimeDelta::seconds(self.default_request_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            LedgerConfig::from_reader(r#"{"lock_timeout_ms": 5, "max_page_size": 10}"#.as_bytes())
                .unwrap();
        assert_eq!(config.lock_timeout(), Duration::from_millis(5));
        assert_eq!(config.max_page_size, 10);
        assert_eq!(config.recent_activity_len, 5);
        assert_eq!(config.default_request_ttl(), TimeDelta::days(7));
    }

    #[test]
    fn unknown_json_is_rejected() {
        assert!(LedgerConfig::from_reader("[1, 2]".as_bytes()).is_err());
    }
}
