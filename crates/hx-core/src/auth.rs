//! Shared-secret authentication primitives
//!
//! Both ends derive a privilege key from the configured token and a Unix
//! timestamp; the server recomputes it to verify. The same derivation signs
//! visitor connections with the proxy's secret key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Derive the privilege key for `token` at `timestamp`
pub fn auth_key(token: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// How clients prove their identity at login
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Token,
}

/// Messages other than `Login` that also carry a privilege key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthScope {
    HeartBeats,
    NewWorkConns,
}

/// Authentication settings shared by client and server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub method: AuthMethod,
    pub token: String,
    pub additional_scopes: Vec<AuthScope>,
}

impl AuthConfig {
    pub fn has_scope(&self, scope: AuthScope) -> bool {
        self.additional_scopes.contains(&scope)
    }

    /// Privilege key to attach to an outgoing message
    pub fn privilege_key(&self, timestamp: i64) -> String {
        auth_key(&self.token, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_key_deterministic() {
        assert_eq!(auth_key("secret", 100), auth_key("secret", 100));
        assert_eq!(auth_key("secret", 100).len(), 64);
    }

    #[test]
    fn test_auth_key_depends_on_inputs() {
        assert_ne!(auth_key("secret", 100), auth_key("secret", 101));
        assert_ne!(auth_key("secret", 100), auth_key("other", 100));
    }

    #[test]
    fn test_auth_config_toml() {
        let cfg: AuthConfig = toml::from_str(
            r#"
            method = "token"
            token = "abc"
            additional_scopes = ["HeartBeats"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.method, AuthMethod::Token);
        assert!(cfg.has_scope(AuthScope::HeartBeats));
        assert!(!cfg.has_scope(AuthScope::NewWorkConns));
    }

    #[test]
    fn test_unsupported_method_rejected() {
        let result: Result<AuthConfig, _> = toml::from_str(r#"method = "oidc""#);
        assert!(result.is_err());
    }
}
