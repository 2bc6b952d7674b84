//! Configuration management
//!
//! An optional TOML file supplies defaults for the listen port, protocol,
//! TLS material, relay tuning, and logging. Command line flags take
//! precedence over everything here.

use crate::relay::RelayConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Relay tuning
    #[serde(default)]
    pub relay: RelaySettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen port
    pub port: Option<u16>,
    /// Proxy protocol (http, https, socks5)
    pub proto: Option<String>,
    /// TLS certificate path (https only)
    pub tls_cert: Option<String>,
    /// TLS key path
    pub tls_key: Option<String>,
}

/// Relay tuning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Inactivity deadline in seconds
    pub idle_timeout_secs: Option<u64>,
    /// Maximum bytes per copy iteration
    pub chunk_size: Option<usize>,
}

impl RelaySettings {
    /// Overlay these settings onto a base relay configuration.
    pub fn apply_to(&self, mut config: RelayConfig) -> RelayConfig {
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(chunk) = self.chunk_size {
            config.chunk_size = chunk;
        }
        config
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
