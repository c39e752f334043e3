//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{AdapterError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// How often (in milliseconds) to re-check the host environment for an
    /// injected wallet connector. Extension injection races page load.
    pub connector_poll_interval_ms: u64,
    /// Give up waiting for a connector to appear after this many milliseconds.
    pub connector_discovery_timeout_ms: u64,
    /// Timeout for the connector's `is_enabled` round-trip.
    pub connector_enable_timeout_ms: u64,
    /// Required connector API version range, e.g. "1.x".
    pub required_api_version: String,
    /// SQLite database holding locally generated secret material.
    pub database_url: String,
    /// Fixed identifier under which the invoice secret key is stored.
    pub private_state_key: String,
    /// How often (in milliseconds) the indexer client polls for contract state.
    pub indexer_poll_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            connector_poll_interval_ms: parse_var("CONNECTOR_POLL_INTERVAL_MS", "100")?,
            connector_discovery_timeout_ms: parse_var("CONNECTOR_DISCOVERY_TIMEOUT_MS", "1000")?,
            connector_enable_timeout_ms: parse_var("CONNECTOR_ENABLE_TIMEOUT_MS", "5000")?,
            required_api_version: env_var("REQUIRED_API_VERSION")
                .unwrap_or_else(|_| "1.x".to_string()),
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./invoice_private_state.db".to_string()),
            private_state_key: env_var("PRIVATE_STATE_KEY")
                .unwrap_or_else(|_| "invoice-private-state".to_string()),
            indexer_poll_interval_ms: parse_var("INDEXER_POLL_INTERVAL_MS", "2000")?,
        })
    }

    pub fn connector_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connector_poll_interval_ms)
    }

    pub fn connector_discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.connector_discovery_timeout_ms)
    }

    pub fn connector_enable_timeout(&self) -> Duration {
        Duration::from_millis(self.connector_enable_timeout_ms)
    }

    pub fn indexer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.indexer_poll_interval_ms)
    }
}

impl Default for Config {
    /// Built-in defaults, independent of the process environment.
    fn default() -> Self {
        Config {
            connector_poll_interval_ms: 100,
            connector_discovery_timeout_ms: 1000,
            connector_enable_timeout_ms: 5000,
            required_api_version: "1.x".to_string(),
            database_url: "sqlite:./invoice_private_state.db".to_string(),
            private_state_key: "invoice-private-state".to_string(),
            indexer_poll_interval_ms: 2000,
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| AdapterError::Config(format!("Missing env var: {key}")))
}

fn parse_var(key: &str, default: &str) -> Result<u64> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| AdapterError::Config(format!("Invalid {key}")))
}
