//! Loading and validating configuration files.
//!
//! A settings file is TOML. Every field is optional:
//!
//! ```toml
//! log_level = "info"
//!
//! [breaker]
//! failure_threshold = 3
//! recovery_timeout_ms = 5000
//! window_size = 10
//! counted_failure_kinds = ["timeout", "bad_status"]
//!
//! [metrics]
//! enabled = true
//! address = "127.0.0.1:8000"
//! namespace = "feature_store"
//! ```
//!
//! Parsing only checks syntax; [`Settings::validate`] and
//! [`Config::validate`] check values and report every problem at once.
use crate::Config;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, net::SocketAddr, path::Path};

/// Everything a process running a breaker needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Default log filter, used when `RUST_LOG` is unset.
    pub log_level: LogLevel,
    pub breaker: Config,
    pub metrics: MetricsSettings,
}

/// Log filter directive, e.g. `"info"` or `"tower_probe_breaker=debug"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

/// Prometheus exposition settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsSettings {
    /// Serve a scrape endpoint.
    pub enabled: bool,
    /// Scrape endpoint bind address.
    pub address: String,
    /// Optional prefix for every metric name.
    pub namespace: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {}", DisplayAll(.0))]
    Validation(Vec<ValidationError>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("failure_threshold must be greater than 0")]
    ZeroFailureThreshold,
    #[error("recovery_timeout_ms must be greater than 0")]
    ZeroRecoveryTimeout,
    #[error("window_size must be greater than 0")]
    ZeroWindowSize,
    #[error("window_size must be at most {max}, got {size}")]
    WindowTooLarge { size: usize, max: usize },
    #[error("metrics address {0:?} is not a valid socket address")]
    MetricsAddress(String),
}

struct DisplayAll<'a>(&'a [ValidationError]);

/// Reads, parses and validates a settings file.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let content = fs::read_to_string(path)?;
    let settings = Settings::from_toml(&content)?;
    tracing::debug!(path = %path.display(), "loaded settings");
    Ok(settings)
}

// === impl Settings ===

impl Settings {
    /// Parses and validates settings from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate().map_err(ConfigError::Validation)?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = self.breaker.validate().err().unwrap_or_default();
        if self.metrics.enabled && self.metrics.socket_addr().is_none() {
            errors.push(ValidationError::MetricsAddress(self.metrics.address.clone()));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// === impl Config ===

impl Config {
    /// Checks that every value is in range.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.failure_threshold == 0 {
            errors.push(ValidationError::ZeroFailureThreshold);
        }
        if self.recovery_timeout.is_zero() {
            errors.push(ValidationError::ZeroRecoveryTimeout);
        }
        if self.window_size == 0 {
            errors.push(ValidationError::ZeroWindowSize);
        } else if self.window_size > Config::MAX_WINDOW_SIZE {
            errors.push(ValidationError::WindowTooLarge {
                size: self.window_size,
                max: Config::MAX_WINDOW_SIZE,
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// === impl LogLevel ===

impl LogLevel {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel("info".to_string())
    }
}

// === impl MetricsSettings ===

impl MetricsSettings {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.parse().ok()
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        MetricsSettings {
            enabled: true,
            address: "127.0.0.1:8000".to_string(),
            namespace: None,
        }
    }
}

impl fmt::Display for DisplayAll<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            fmt::Display::fmt(err, f)?;
        }
        Ok(())
    }
}

/// (De)serializes a [`Duration`](std::time::Duration) as whole milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
