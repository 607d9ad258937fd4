//! Client configuration

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use super::serde_utils::duration_secs;
use super::{ProxyConfig, VisitorConfig};
use crate::auth::AuthConfig;
use crate::error::ConfigError;

/// Configuration for the client daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// User name reported at login; visitors are checked against it
    pub user: String,

    /// Server host to connect to
    pub server_addr: String,

    /// Server control port
    pub server_port: u16,

    /// Client authentication
    pub auth: AuthConfig,

    /// Log level: trace, debug, info, warn or error
    pub log_level: String,

    /// Exit instead of retrying when the first login fails
    pub login_fail_exit: bool,

    /// Work connections the server requests up front
    pub pool_count: u32,

    /// Timeout for dialing the server
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,

    /// Seconds between pings; 0 or negative disables heartbeats
    pub heartbeat_interval: i64,

    /// Seconds without a pong before the control is closed; 0 or negative
    /// disables the check
    pub heartbeat_timeout: i64,

    /// Reconnect backoff
    pub backoff: BackoffConfig,

    /// STUN server used by `nathole discover`
    pub nat_hole_stun_server: String,

    /// Free-form metadata sent at login
    pub metas: BTreeMap<String, String>,

    /// Tunnels to expose
    pub proxies: Vec<ProxyConfig>,

    /// Local listeners for secret tunnels
    pub visitors: Vec<VisitorConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user: whoami::username(),
            server_addr: "127.0.0.1".to_string(),
            server_port: 7000,
            auth: AuthConfig::default(),
            log_level: "info".to_string(),
            login_fail_exit: true,
            pool_count: 1,
            dial_timeout: Duration::from_secs(10),
            heartbeat_interval: 30,
            heartbeat_timeout: 90,
            backoff: BackoffConfig::default(),
            nat_hole_stun_server: "stun.easyvoip.com:3478".to_string(),
            metas: BTreeMap::new(),
            proxies: Vec::new(),
            visitors: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Server control address, as `host:port`
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }

    /// Effective ping interval, `None` when heartbeats are disabled
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval > 0).then(|| Duration::from_secs(self.heartbeat_interval as u64))
    }

    /// Effective pong timeout, `None` when disabled
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout > 0).then(|| Duration::from_secs(self.heartbeat_timeout as u64))
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        super::validate_log_level(&self.log_level)?;

        if self.server_port == 0 {
            return Err(ConfigError::Invalid("server_port must be set".to_string()));
        }

        if let (Some(interval), Some(timeout)) = (self.heartbeat_interval(), self.heartbeat_timeout()) {
            if interval >= timeout {
                return Err(ConfigError::Invalid(
                    "heartbeat_interval must be less than heartbeat_timeout".to_string(),
                ));
            }
        }

        let mut names = HashSet::new();
        for proxy in &self.proxies {
            proxy.validate()?;
            if !names.insert(proxy.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate proxy name: {}",
                    proxy.name
                )));
            }
        }

        for visitor in &self.visitors {
            visitor.validate()?;
        }

        Ok(())
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(20),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hx_protocol::ProxyOptions;

    const SAMPLE: &str = r#"
        user = "alice"
        server_addr = "tunnel.example.com"
        pool_count = 3

        [auth]
        token = "abc"

        [[proxies]]
        name = "ssh"
        type = "tcp"
        local_port = 22
        remote_port = 6000

        [[proxies]]
        name = "db"
        type = "stcp"
        local_port = 5432
        secret_key = "s3cret"

        [[visitors]]
        name = "db-visitor"
        server_name = "db"
        secret_key = "s3cret"
        bind_port = 15432
    "#;

    #[test]
    fn test_parse_sample() {
        let config: ClientConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.user, "alice");
        assert_eq!(config.server_address(), "tunnel.example.com:7000");
        assert_eq!(config.pool_count, 3);
        assert_eq!(config.proxies.len(), 2);
        assert!(matches!(config.proxies[1].options, ProxyOptions::Stcp(_)));
        assert_eq!(config.visitors[0].bind_address(), "127.0.0.1:15432");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_proxy_names_rejected() {
        let mut config: ClientConfig = toml::from_str(SAMPLE).unwrap();
        let dup = config.proxies[0].clone();
        config.proxies.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_disabled() {
        let config = ClientConfig {
            heartbeat_interval: 0,
            heartbeat_timeout: -1,
            ..Default::default()
        };
        assert_eq!(config.heartbeat_interval(), None);
        assert_eq!(config.heartbeat_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_heartbeat_interval_must_be_below_timeout() {
        let config = ClientConfig {
            heartbeat_interval: 90,
            heartbeat_timeout: 30,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
