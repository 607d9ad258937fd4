//! Proxy and visitor configuration

use serde::{Deserialize, Serialize};

use hx_protocol::{NewProxy, ProxyOptions};

use crate::error::ConfigError;

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

/// One tunnel the client wants the server to expose.
///
/// Equality is structural; the reconciliation manager restarts a proxy
/// whenever any field changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Unique name within the server
    pub name: String,

    /// Address of the local service
    #[serde(default = "default_local_ip")]
    pub local_ip: String,

    /// Port of the local service
    pub local_port: u16,

    /// Carried to the server, not acted upon
    #[serde(default)]
    pub use_encryption: bool,

    /// Carried to the server, not acted upon
    #[serde(default)]
    pub use_compression: bool,

    /// Type-specific options, selected by `type`
    #[serde(flatten)]
    pub options: ProxyOptions,
}

impl ProxyConfig {
    /// Address of the local service, as `host:port`
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    /// The registration message for this proxy
    pub fn to_new_proxy(&self) -> NewProxy {
        NewProxy {
            proxy_name: self.name.clone(),
            use_encryption: self.use_encryption,
            use_compression: self.use_compression,
            options: self.options.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("proxy name must not be empty".to_string()));
        }
        if self.local_port == 0 {
            return Err(ConfigError::Invalid(format!(
                "proxy {}: local_port must be set",
                self.name
            )));
        }
        if let ProxyOptions::Stcp(stcp) = &self.options {
            if stcp.secret_key.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "proxy {}: stcp requires secret_key",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// A local listener that reaches a secret (`stcp`) proxy through the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorConfig {
    /// Name of this visitor, for logs
    pub name: String,

    /// Name of the stcp proxy to visit
    pub server_name: String,

    /// Must match the proxy's secret key
    pub secret_key: String,

    #[serde(default = "default_local_ip")]
    pub bind_addr: String,

    pub bind_port: u16,

    #[serde(default)]
    pub use_encryption: bool,

    #[serde(default)]
    pub use_compression: bool,
}

impl VisitorConfig {
    /// Address the visitor listens on, as `host:port`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.server_name.is_empty() {
            return Err(ConfigError::Invalid(
                "visitor name and server_name must not be empty".to_string(),
            ));
        }
        if self.bind_port == 0 {
            return Err(ConfigError::Invalid(format!(
                "visitor {}: bind_port must be set",
                self.name
            )));
        }
        Ok(())
    }
}
