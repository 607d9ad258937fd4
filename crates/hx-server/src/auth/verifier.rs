//! Verifiers for login, heartbeat and work connection credentials

use std::sync::Arc;

use hx_core::auth::{auth_key, AuthConfig, AuthMethod, AuthScope};
use hx_core::AuthError;
use hx_protocol::{Login, NewWorkConnection, Ping};

/// Checks the credentials a client attaches to its messages
pub trait Verifier: Send + Sync {
    fn verify_login(&self, login: &Login) -> Result<(), AuthError>;
    fn verify_ping(&self, ping: &Ping) -> Result<(), AuthError>;
    fn verify_new_work_conn(&self, msg: &NewWorkConnection) -> Result<(), AuthError>;
}

/// Shared-token verification.
///
/// Logins are always checked; pings and work connections only when the
/// corresponding additional scope is enabled.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    token: String,
    verify_heartbeats: bool,
    verify_new_work_conns: bool,
}

impl TokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            token: config.token.clone(),
            verify_heartbeats: config.has_scope(AuthScope::HeartBeats),
            verify_new_work_conns: config.has_scope(AuthScope::NewWorkConns),
        }
    }

    fn check(&self, privilege_key: &str, timestamp: i64, what: &'static str) -> Result<(), AuthError> {
        if auth_key(&self.token, timestamp) == privilege_key {
            Ok(())
        } else {
            Err(AuthError::TokenMismatch(what))
        }
    }
}

impl Verifier for TokenVerifier {
    fn verify_login(&self, login: &Login) -> Result<(), AuthError> {
        self.check(&login.privilege_key, login.timestamp, "login")
    }

    fn verify_ping(&self, ping: &Ping) -> Result<(), AuthError> {
        if !self.verify_heartbeats {
            return Ok(());
        }
        self.check(&ping.privilege_key, ping.timestamp, "heartbeat")
    }

    fn verify_new_work_conn(&self, msg: &NewWorkConnection) -> Result<(), AuthError> {
        if !self.verify_new_work_conns {
            return Ok(());
        }
        self.check(&msg.privilege_key, msg.timestamp, "work connection")
    }
}

/// Accepts everything. Only used for trusted in-process transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPassVerifier;

impl Verifier for AlwaysPassVerifier {
    fn verify_login(&self, _login: &Login) -> Result<(), AuthError> {
        Ok(())
    }

    fn verify_ping(&self, _ping: &Ping) -> Result<(), AuthError> {
        Ok(())
    }

    fn verify_new_work_conn(&self, _msg: &NewWorkConnection) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Build the verifier for the configured auth method
pub fn new_verifier(config: &AuthConfig) -> Arc<dyn Verifier> {
    match config.method {
        AuthMethod::Token => Arc::new(TokenVerifier::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(scopes: Vec<AuthScope>) -> AuthConfig {
        AuthConfig {
            method: AuthMethod::Token,
            token: "secret".to_string(),
            additional_scopes: scopes,
        }
    }

    #[test]
    fn test_login_requires_matching_key() {
        let verifier = TokenVerifier::new(&config(vec![]));

        let good = Login {
            privilege_key: auth_key("secret", 1000),
            timestamp: 1000,
            ..Default::default()
        };
        assert!(verifier.verify_login(&good).is_ok());

        let bad = Login {
            privilege_key: auth_key("wrong", 1000),
            timestamp: 1000,
            ..Default::default()
        };
        assert_eq!(
            verifier.verify_login(&bad),
            Err(AuthError::TokenMismatch("login"))
        );
    }

    #[test]
    fn test_scopes_gate_ping_and_work_conn() {
        let unscoped = TokenVerifier::new(&config(vec![]));
        assert!(unscoped.verify_ping(&Ping::default()).is_ok());
        assert!(unscoped
            .verify_new_work_conn(&NewWorkConnection::default())
            .is_ok());

        let scoped = TokenVerifier::new(&config(vec![AuthScope::HeartBeats, AuthScope::NewWorkConns]));
        assert!(scoped.verify_ping(&Ping::default()).is_err());
        assert!(scoped
            .verify_new_work_conn(&NewWorkConnection::default())
            .is_err());

        let ping = Ping {
            privilege_key: auth_key("secret", 7),
            timestamp: 7,
        };
        assert!(scoped.verify_ping(&ping).is_ok());
    }

    #[test]
    fn test_always_pass() {
        let verifier = AlwaysPassVerifier;
        assert!(verifier.verify_login(&Login::default()).is_ok());
        assert!(verifier.verify_ping(&Ping::default()).is_ok());
    }
}
