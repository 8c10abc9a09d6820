//! Configuration types for bucketroute
//!
//! This module defines configuration structures used across components.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for bucketroute
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metadata service configuration
    pub metadata: MetadataConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Check that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        self.metadata.validate()
    }
}

/// Single-hop metadata service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Route operations directly to the bucket owner
    pub single_hop_enabled: bool,
    /// How long a bucket stays timed out after its primary failed (milliseconds)
    pub bucket_timeout_ms: u64,
    /// Maximum number of regions waiting for a metadata refresh
    pub refresh_queue_capacity: usize,
    /// Name of the background refresh thread
    pub worker_thread_name: String,
}

impl MetadataConfig {
    /// Bucket timeout window as a duration
    #[must_use]
    pub const fn bucket_timeout(&self) -> Duration {
        Duration::from_millis(self.bucket_timeout_ms)
    }

    /// Check that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.refresh_queue_capacity == 0 {
            return Err(Error::Configuration(
                "metadata.refresh_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.worker_thread_name.trim().is_empty() {
            return Err(Error::Configuration(
                "metadata.worker_thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            single_hop_enabled: true,
            bucket_timeout_ms: 5_000,
            refresh_queue_capacity: 1024,
            worker_thread_name: "metadata-refresh".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.metadata.single_hop_enabled);
        assert_eq!(config.metadata.bucket_timeout(), Duration::from_secs(5));
        assert_eq!(config.metadata.refresh_queue_capacity, 1024);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"metadata": {"bucket_timeout_ms": 250}}"#).unwrap();
        assert_eq!(config.metadata.bucket_timeout_ms, 250);
        assert!(config.metadata.single_hop_enabled);
        assert_eq!(config.metadata.worker_thread_name, "metadata-refresh");
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.metadata.refresh_queue_capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
