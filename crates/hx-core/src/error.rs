//! Core error types for hepx

use std::path::PathBuf;
use thiserror::Error;

/// Authentication failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The privilege key does not match the configured token
    #[error("token in {0} doesn't match token from configuration")]
    TokenMismatch(&'static str),

    /// The auth method is not supported by this build
    #[error("unsupported auth method: {0}")]
    UnsupportedMethod(String),
}

/// NAT discovery and classification errors
#[derive(Error, Debug)]
pub enum NatError {
    /// Classification needs at least two observed addresses
    #[error("not enough addresses: need at least 2, got {0}")]
    InsufficientSamples(usize),

    /// An observed address is not `ip:port`
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The STUN exchange failed
    #[error("STUN error: {0}")]
    Stun(String),

    /// A result limit of zero was requested
    #[error("max items must be greater than 0")]
    InvalidLimit,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Build the error text sent back to a client.
///
/// Internal details are only exposed when `detailed` is set; otherwise the
/// client sees the generic `msg` and the detail stays in the server log.
pub fn generate_response_error(msg: &str, err: &dyn std::fmt::Display, detailed: bool) -> String {
    if detailed {
        err.to_string()
    } else {
        msg.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_response_error() {
        let err = AuthError::TokenMismatch("login");
        assert_eq!(
            generate_response_error("invalid login", &err, false),
            "invalid login"
        );
        assert_eq!(
            generate_response_error("invalid login", &err, true),
            "token in login doesn't match token from configuration"
        );
    }
}
