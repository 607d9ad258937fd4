//! Server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::auth::AuthConfig;
use crate::error::ConfigError;

/// Inclusive range of ports tunnels may bind on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

/// Configuration for the server daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the control listener binds to
    pub bind_addr: String,

    /// Port the control listener binds to
    pub bind_port: u16,

    /// Address public tunnel listeners bind to
    pub proxy_bind_addr: String,

    /// Client authentication
    pub auth: AuthConfig,

    /// Log level: trace, debug, info, warn or error
    pub log_level: String,

    /// Send full error text to clients instead of a generic message
    pub detailed_errors_to_client: bool,

    /// Seconds without a ping before a control session is closed; 0 or
    /// negative disables the check
    pub heartbeat_timeout: i64,

    /// How long a user connection waits for a work connection
    #[serde(with = "duration_secs")]
    pub work_conn_timeout: Duration,

    /// Upper bound on the pool size a client may request at login
    pub max_pool_count: u32,

    /// Ports tunnels may bind; empty allows any
    pub allow_ports: Vec<PortRange>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 7000,
            proxy_bind_addr: "0.0.0.0".to_string(),
            auth: AuthConfig::default(),
            log_level: "info".to_string(),
            detailed_errors_to_client: true,
            heartbeat_timeout: 90,
            work_conn_timeout: Duration::from_secs(10),
            max_pool_count: 5,
            allow_ports: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Address the control listener binds to, as `host:port`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    /// Effective heartbeat timeout, `None` when disabled
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout > 0).then(|| Duration::from_secs(self.heartbeat_timeout as u64))
    }

    /// Whether a tunnel may bind `port`. Port 0 (server chooses) is always allowed.
    pub fn is_port_allowed(&self, port: u16) -> bool {
        port == 0 || self.allow_ports.is_empty() || self.allow_ports.iter().any(|r| r.contains(port))
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        super::validate_log_level(&self.log_level)?;

        for range in &self.allow_ports {
            if range.start > range.end {
                return Err(ConfigError::Invalid(format!(
                    "allow_ports: range {}-{} is reversed",
                    range.start, range.end
                )));
            }
        }

        if self.work_conn_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "work_conn_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
