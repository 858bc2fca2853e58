//! Runtime configuration.
//!
//! Settings are read from `<config_dir>/eagle-guard/config.json`. A missing
//! file means defaults; every field is optional in the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GuardError;
use crate::retry::RetryPolicy;
use crate::types::DEFAULT_DELAY_TIMEOUT_MS;

/// Directory name used under the platform config/data directories.
pub const APP_DIR_NAME: &str = "eagle-guard";

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Socket file name inside the data directory.
pub const SOCKET_FILE_NAME: &str = "eagle-guard.sock";

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_delay_timeout_ms() -> u64 {
    DEFAULT_DELAY_TIMEOUT_MS
}

fn default_log_filter() -> String {
    "warn".to_string()
}

/// Process-wide settings.
///
/// # Example
///
/// ```
/// use eagle_guard::config::GuardConfig;
///
/// let config = GuardConfig::default();
/// assert_eq!(config.cache_ttl_secs, 300);
/// assert_eq!(config.preference_ttl_secs, 0);
/// assert_eq!(config.retry_attempts, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardConfig {
    /// Where the engine keeps `savedPreferences.json` and `blockData.json`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Unix socket the daemon listens on.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// TTL for expensive reads (block data, installed apps).
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// TTL for preference reads. Zero means revalidate on every read.
    #[serde(default)]
    pub preference_ttl_secs: u64,

    /// Attempts for idempotent reads.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// First backoff delay; doubles per attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Delay used before a timeout has ever been configured.
    #[serde(default = "default_delay_timeout_ms")]
    pub default_delay_timeout_ms: u64,

    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            socket_path: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            preference_ttl_secs: 0,
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            default_delay_timeout_ms: default_delay_timeout_ms(),
            log_filter: default_log_filter(),
        }
    }
}

impl GuardConfig {
    /// Returns the default config file location, if a config dir exists.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from `path`, or from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, GuardError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns a validation error for zero retry attempts or a zero default
    /// delay.
    pub fn validate(&self) -> Result<(), GuardError> {
        if self.retry_attempts == 0 {
            return Err(GuardError::validation("retry_attempts must be at least 1"));
        }
        if self.default_delay_timeout_ms == 0 {
            return Err(GuardError::validation(
                "default_delay_timeout_ms must be positive",
            ));
        }
        Ok(())
    }

    /// Data directory, falling back to the platform data dir.
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR_NAME)
    }

    /// Socket path, falling back to a file inside the data directory.
    #[must_use]
    pub fn resolved_socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.resolved_data_dir().join(SOCKET_FILE_NAME))
    }

    /// TTL for block data and installed apps.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// TTL for preferences.
    #[must_use]
    pub fn preference_ttl(&self) -> Duration {
        Duration::from_secs(self.preference_ttl_secs)
    }

    /// Retry policy for idempotent reads.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }
}
