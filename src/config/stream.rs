//! Stream configuration
//!
//! Loads connection settings from `.marketdata/config.toml` or an explicit path.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration directory and file name
pub const CONFIG_DIR: &str = ".marketdata";
pub const CONFIG_FILE: &str = "config.toml";

/// Default market data stream endpoint
pub const DEFAULT_URL: &str = "wss://data.alpaca.markets/stream";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Reconnection policy applied after an unexpected close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect after an abnormal close
    pub enabled: bool,
    /// Consecutive attempts before giving up (0 = unlimited)
    pub max_attempts: u32,
    /// Delay before each attempt, in milliseconds
    pub delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 0,
            delay_ms: 1000,
        }
    }
}

impl ReconnectConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Whether `attempt` (1-based) is within the allowed number of attempts
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt <= self.max_attempts)
    }
}

/// Market data stream configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// WebSocket endpoint URL
    pub url: String,
    /// API key ID
    pub key_id: Option<String>,
    /// API secret key
    pub secret_key: Option<String>,
    /// Streams to listen to after authenticating (e.g. `T.AAPL`, `Q.AAPL`, `AM.AAPL`)
    pub streams: Vec<String>,
    /// Reconnection policy
    pub reconnect: ReconnectConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            key_id: None,
            secret_key: None,
            streams: Vec::new(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Load configuration from a file; a missing file yields defaults
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from `<dir>/.marketdata/config.toml`
    pub fn load_from_dir(dir: &Path) -> ConfigResult<Self> {
        Self::load(&dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to a file, creating parent directories
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Credentials, if both halves are set and non-empty
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.key_id.as_deref(), self.secret_key.as_deref()) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some((key, secret))
            }
            _ => None,
        }
    }

    /// Check the configuration is usable for a connection
    pub fn validate(&self) -> ConfigResult<()> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid("url cannot be empty".to_string()));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "url must use ws:// or wss://, got {}",
                self.url
            )));
        }
        if self.credentials().is_none() {
            return Err(ConfigError::Invalid(
                "key_id and secret_key are required".to_string(),
            ));
        }
        if let Some(bad) = self.streams.iter().find(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("invalid stream name {:?}", bad)));
        }
        Ok(())
    }
}
