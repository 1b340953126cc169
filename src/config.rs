//! Configuration management for the disk buffer

use crate::errors::{BufferError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// File rotation and retention policy for one signal folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Maximum size of a single buffer file, in bytes
    pub max_file_size: u64,

    /// Maximum combined size of all buffer files in a folder, in bytes
    pub max_folder_size: u64,

    /// Age a file must reach before it can be read
    pub min_file_age_for_read_ms: u64,

    /// Age after which a file is deleted whether or not it was read
    pub max_file_age_for_read_ms: u64,

    /// Age after which a file stops accepting writes
    pub max_file_age_for_write_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_file_size: 1024 * 1024,
            max_folder_size: 10 * 1024 * 1024,
            min_file_age_for_read_ms: 33_000,
            max_file_age_for_read_ms: 18 * 60 * 60 * 1000,
            max_file_age_for_write_ms: 30_000,
        }
    }
}

impl StorageConfig {
    /// Load the storage policy from `DISK_BUFFER_*` environment variables
    pub fn from_env() -> Self {
        let mut config = StorageConfig::default();

        if let Some(size) = env_u64("DISK_BUFFER_MAX_FILE_SIZE") {
            config.max_file_size = size;
        }

        if let Some(size) = env_u64("DISK_BUFFER_MAX_FOLDER_SIZE") {
            config.max_folder_size = size;
        }

        if let Some(ms) = env_u64("DISK_BUFFER_MIN_FILE_AGE_FOR_READ_MS") {
            config.min_file_age_for_read_ms = ms;
        }

        if let Some(ms) = env_u64("DISK_BUFFER_MAX_FILE_AGE_FOR_READ_MS") {
            config.max_file_age_for_read_ms = ms;
        }

        if let Some(ms) = env_u64("DISK_BUFFER_MAX_FILE_AGE_FOR_WRITE_MS") {
            config.max_file_age_for_write_ms = ms;
        }

        config
    }

    /// Validate the policy.
    ///
    /// A file must stop accepting writes strictly before it becomes readable,
    /// so `min_file_age_for_read_ms` has to be greater than
    /// `max_file_age_for_write_ms`.
    pub fn validate(&self) -> Result<()> {
        if self.min_file_age_for_read_ms <= self.max_file_age_for_write_ms {
            return Err(BufferError::Config(
                "the max file age for writing must be lower than the min file age for reading"
                    .to_string(),
            ));
        }

        if self.max_file_age_for_read_ms < self.min_file_age_for_read_ms {
            return Err(BufferError::Config(
                "max_file_age_for_read_ms cannot be lower than min_file_age_for_read_ms"
                    .to_string(),
            ));
        }

        if self.max_file_size == 0 {
            return Err(BufferError::Config(
                "max_file_size must be greater than 0".to_string(),
            ));
        }

        if self.max_folder_size < self.max_file_size {
            return Err(BufferError::Config(
                "max_folder_size must be able to hold at least one file".to_string(),
            ));
        }

        Ok(())
    }
}

/// Settings for the buffering agent binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one sub-folder per signal type
    pub root_dir: PathBuf,

    /// URL of the telemetry gateway batches are drained to
    pub gateway_url: String,

    /// How often buffered batches are drained
    pub drain_interval: Duration,

    /// How long a drain waits for the gateway to accept a batch
    pub drain_timeout: Duration,

    /// HTTP timeout for gateway requests
    pub http_timeout: Duration,

    /// Maximum retry attempts inside one forward call
    pub max_retries: u32,

    /// Retry backoff base
    pub retry_backoff_ms: u64,

    /// File rotation policy shared by every signal folder
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/otel-disk-buffer"),
            gateway_url: "http://telemetry-gateway:9090".to_string(),
            drain_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff_ms: 1000,
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Config {
            storage: StorageConfig::from_env(),
            ..Config::default()
        };

        if let Ok(root_dir) = env::var("DISK_BUFFER_ROOT_DIR") {
            config.root_dir = PathBuf::from(root_dir);
        }

        if let Ok(gateway_url) = env::var("GATEWAY_URL") {
            config.gateway_url = gateway_url;
        }

        if let Some(seconds) = env_u64("DRAIN_INTERVAL_SECONDS") {
            config.drain_interval = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_u64("DRAIN_TIMEOUT_SECONDS") {
            config.drain_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_u64("HTTP_TIMEOUT_SECONDS") {
            config.http_timeout = Duration::from_secs(seconds);
        }

        if let Ok(max_retries) = env::var("MAX_RETRIES") {
            if let Ok(retries) = max_retries.parse() {
                config.max_retries = retries;
            }
        }

        if let Some(ms) = env_u64("RETRY_BACKOFF_MS") {
            config.retry_backoff_ms = ms;
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(BufferError::Config("root_dir cannot be empty".to_string()));
        }

        if self.gateway_url.is_empty() {
            return Err(BufferError::Config(
                "gateway_url cannot be empty".to_string(),
            ));
        }

        if self.drain_interval.is_zero() {
            return Err(BufferError::Config(
                "drain_interval must be greater than 0".to_string(),
            ));
        }

        self.storage.validate()
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min_read: u64, max_write: u64) -> StorageConfig {
        StorageConfig {
            min_file_age_for_read_ms: min_read,
            max_file_age_for_write_ms: max_write,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(StorageConfig::default().validate().is_ok());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_read_age_must_exceed_write_age() {
        for (min_read, max_write) in [(5, 5), (4, 5), (0, 0), (30_000, 33_000)] {
            let result = config(min_read, max_write).validate();
            assert!(
                matches!(result, Err(BufferError::Config(_))),
                "min_read={} max_write={} should be rejected",
                min_read,
                max_write
            );
        }

        assert!(config(6, 5).validate().is_ok());
    }

    #[test]
    fn test_folder_must_fit_one_file() {
        let config = StorageConfig {
            max_file_size: 100,
            max_folder_size: 99,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_drain_interval_rejected() {
        let config = Config {
            drain_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
