//! Configuration management for hepx

mod client;
mod proxy;
pub mod serde_utils;
mod server;

pub use client::{BackoffConfig, ClientConfig};
pub use proxy::{ProxyConfig, VisitorConfig};
pub use server::{PortRange, ServerConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Log levels accepted by `log_level`
pub const SUPPORTED_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hepx")
}

/// Default path of the server configuration file
pub fn default_server_config_path() -> PathBuf {
    default_config_dir().join("hxs.toml")
}

/// Default path of the client configuration file
pub fn default_client_config_path() -> PathBuf {
    default_config_dir().join("hxc.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

pub(crate) fn validate_log_level(level: &str) -> Result<(), ConfigError> {
    if SUPPORTED_LOG_LEVELS.contains(&level) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "invalid log level {:?}, optional values are {:?}",
            level, SUPPORTED_LOG_LEVELS
        )))
    }
}
