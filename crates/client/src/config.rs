//! Configuration types for the MCP client.

use std::time::Duration;
use tether_core::protocol::{Capabilities, Implementation, PROTOCOL_VERSION};

/// Settings applied to every connection a registry opens.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Identity sent in `initialize`.
    pub client_info: Implementation,
    /// Protocol revision requested in `initialize`.
    pub protocol_version: String,
    /// Method families requested from peers.
    pub capabilities: Capabilities,
    /// Bound on the HTTP liveness probe.
    pub health_timeout: Duration,
    /// Backoff used by caller-level retries.
    pub retry_config: RetryConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation::new("tether", env!("CARGO_PKG_VERSION")),
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Capabilities::all(),
            health_timeout: Duration::from_secs(5),
            retry_config: RetryConfig::default(),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        std::cmp::min(backoff, self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            ..Default::default()
        };

        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let config = RetryConfig {
            max_backoff: Duration::from_millis(500),
            ..Default::default()
        };

        assert_eq!(config.backoff_for_attempt(10), Duration::from_millis(500));
    }

    #[test]
    fn test_client_options_defaults() {
        let options = ClientOptions::default();

        assert_eq!(options.protocol_version, "2025-06-18");
        assert_eq!(options.client_info.name, "tether");
        assert_eq!(options.health_timeout, Duration::from_secs(5));
        assert!(options.capabilities.tools.is_some());
    }
}
