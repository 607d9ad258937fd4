//! Client error types

use thiserror::Error;

use hx_core::ConfigError;
use hx_protocol::{DispatcherError, ProtocolError};

use crate::proxy::ProxyPhase;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("proxy [{0}] not found")]
    ProxyNotFound(String),

    #[error("proxy [{name}] is {phase}, expected {expected}")]
    InvalidPhase {
        name: String,
        phase: ProxyPhase,
        expected: ProxyPhase,
    },

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("work connection rejected: {0}")]
    WorkConnRejected(String),

    #[error("visitor rejected: {0}")]
    VisitorRejected(String),

    #[error("unexpected message: expected {expected}, got {got:?}")]
    UnexpectedMessage {
        expected: &'static str,
        got: hx_protocol::MessageType,
    },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("control connection: {0}")]
    Dispatcher(#[from] DispatcherError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Errors that retrying the same request will not fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::LoginRejected(_) | ClientError::Config(_))
    }
}
