//! Configuration
//!
//! Runtime configuration for the session manager and its daemon. Values
//! come from three layers, weakest first: built-in defaults, an optional
//! TOML file (XDG config directory by default), and `CHORUS_*` environment
//! variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Errors from configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed
        path: PathBuf,
        /// Underlying TOML error
        #[source]
        source: toml::de::Error,
    },
}

/// Complete chorus configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusConfig {
    /// Upstream provider base URL
    pub upstream_url: String,

    /// Upstream API key (optional for local providers)
    pub api_key: Option<String>,

    /// Per-request upstream timeout
    pub request_timeout_ms: u64,

    /// Overall budget for one upstream attempt, including streaming
    ///
    /// Exceeding it counts as a connection-level failure and is retried.
    pub attempt_timeout_ms: u64,

    /// Retry policy for transient upstream failures
    pub retry: RetryPolicy,

    /// How long a finished session stays queryable for late subscribers
    pub completed_ttl_ms: u64,

    /// How long a never-started, subscriber-less session may idle
    pub idle_ttl_ms: u64,

    /// Interval of the background eviction sweep
    pub sweep_interval_ms: u64,

    /// Per-subscriber frame channel capacity
    pub subscriber_capacity: usize,

    /// Daemon bind address
    pub bind_addr: String,
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            upstream_url: "http://localhost:11434".to_string(),
            api_key: None,
            request_timeout_ms: 120_000,
            attempt_timeout_ms: 180_000,
            retry: RetryPolicy::default(),
            completed_ttl_ms: 30_000,
            idle_ttl_ms: 60_000,
            sweep_interval_ms: 10_000,
            subscriber_capacity: 256,
            bind_addr: "127.0.0.1:8787".to_string(),
        }
    }
}

impl ChorusConfig {
    /// Per-request upstream timeout as a `Duration`
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Per-attempt budget as a `Duration`
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Terminal grace window as a `Duration`
    #[must_use]
    pub fn completed_ttl(&self) -> Duration {
        Duration::from_millis(self.completed_ttl_ms)
    }

    /// Idle eviction window as a `Duration`
    #[must_use]
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    /// Sweep interval as a `Duration`
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Apply `CHORUS_*` environment variable overrides
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("CHORUS_UPSTREAM_URL") {
            self.upstream_url = url;
        }
        if let Ok(key) = std::env::var("CHORUS_UPSTREAM_API_KEY") {
            self.api_key = Some(key);
        }
        if let Ok(bind) = std::env::var("CHORUS_BIND") {
            self.bind_addr = bind;
        }
        if let Ok(retries) = std::env::var("CHORUS_MAX_RETRIES") {
            if let Ok(value) = retries.parse() {
                self.retry.max_retries = value;
            }
        }
        self
    }
}

/// Default config file location (`$XDG_CONFIG_HOME/chorus/chorus.toml`)
#[must_use]
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chorus")
        .join("chorus.toml")
}

/// Load configuration from a specific file, with env overrides applied
///
/// # Errors
///
/// Returns `ConfigError` when the file exists but cannot be read or parsed.
/// A missing file is not an error: defaults are used.
pub fn load_config_from_path(path: &Path) -> Result<ChorusConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = ?path, "No config file, using defaults");
        return Ok(ChorusConfig::default().with_env_overrides());
    }

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: ChorusConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::info!(path = ?path, "Loaded configuration");
    Ok(config.with_env_overrides())
}

/// Load configuration from the default location
///
/// # Errors
///
/// Returns `ConfigError` when the default file exists but is unreadable or
/// malformed.
pub fn load_config() -> Result<ChorusConfig, ConfigError> {
    load_config_from_path(&default_config_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ChorusConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.completed_ttl(), Duration::from_secs(30));
        assert_eq!(config.bind_addr, "127.0.0.1:8787");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = load_config_from_path(Path::new("/nonexistent/chorus.toml")).unwrap();
        assert_eq!(config.upstream_url, ChorusConfig::default().upstream_url);
    }

    #[test]
    fn test_partial_toml_keeps_defaults_for_the_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
upstream_url = "https://inference.internal"
completed_ttl_ms = 5000

[retry]
max_retries = 1
initial_backoff_ms = 50
max_backoff_ms = 1000
backoff_multiplier = 2.0
use_jitter = false
"#
        )
        .unwrap();

        let config = load_config_from_path(file.path()).unwrap();
        assert_eq!(config.upstream_url, "https://inference.internal");
        assert_eq!(config.completed_ttl_ms, 5000);
        assert_eq!(config.retry.max_retries, 1);
        // Untouched fields keep their defaults
        assert_eq!(config.subscriber_capacity, 256);
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "upstream_url = [this is not toml").unwrap();

        let err = load_config_from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
