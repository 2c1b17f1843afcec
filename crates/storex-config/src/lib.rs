#![deny(unsafe_code)]

//! Configuration loading and validation for the StoreX driver.
//!
//! Loads TOML configuration files and validates them. [`StorexConfig`] is the
//! central structure: the device endpoint, command bridge tuning, and logging.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level driver configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StorexConfig {
    /// Which StoreX unit to talk to.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Command bridge tuning.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network endpoint and identifier of the StoreX unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Host name or IP address of the StoreX server.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port of the StoreX server.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Device identifier placed first in every command's argument list.
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            device_id: default_device_id(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3336
}

fn default_device_id() -> String {
    "1".to_string()
}

/// How the bridge decides that a reply is complete.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// The first non-empty read is the whole reply. Later bytes are not part
    /// of the exchange.
    #[default]
    FirstRead,
    /// Accumulate reads until the peer signals end of data with a
    /// zero-length read.
    UntilClose,
}

/// Command bridge tuning.
///
/// Both timeouts use `0` for "wait indefinitely".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Maximum bytes requested by a single receive.
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,

    /// Reply framing policy.
    #[serde(default)]
    pub framing: Framing,

    /// Bound on the connect wait, in milliseconds.
    #[serde(default)]
    pub connect_timeout_ms: u64,

    /// Bound on the wait for a reply, in milliseconds.
    #[serde(default)]
    pub response_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: default_receive_buffer_size(),
            framing: Framing::default(),
            connect_timeout_ms: 0,
            response_timeout_ms: 0,
        }
    }
}

fn default_receive_buffer_size() -> usize {
    256
}

impl BridgeConfig {
    /// Connect timeout, or `None` when disabled.
    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.connect_timeout_ms)
    }

    /// Response timeout, or `None` when disabled.
    pub fn response_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.response_timeout_ms)
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl StorexConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), "Loaded StoreX configuration");
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: StorexConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.host.is_empty() {
            return Err(ConfigError::Validation(
                "device.host must not be empty".to_string(),
            ));
        }
        if self.device.port == 0 {
            return Err(ConfigError::Validation(
                "device.port must be non-zero".to_string(),
            ));
        }
        if self.device.device_id.is_empty() {
            return Err(ConfigError::Validation(
                "device.device_id must not be empty".to_string(),
            ));
        }
        if self.bridge.receive_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "bridge.receive_buffer_size must be at least 1".to_string(),
            ));
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }
        Ok(())
    }
}
