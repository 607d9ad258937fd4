//! Server error types

use thiserror::Error;

use hx_core::AuthError;
use hx_protocol::{DispatcherError, ProtocolError};

/// Errors raised while serving client connections
#[derive(Error, Debug)]
pub enum ServerError {
    /// The client failed authentication
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),

    /// A run id could not be generated
    #[error("failed to allocate run id: {0}")]
    IdAllocation(String),

    /// Another session already owns this proxy name
    #[error("proxy [{0}] already exists")]
    ProxyConflict(String),

    /// The proxy options are unusable
    #[error("invalid proxy [{name}]: {reason}")]
    InvalidProxy { name: String, reason: String },

    /// No work connection arrived in time
    #[error("timeout waiting for work connection")]
    WorkConnTimeout,

    /// A visitor presented bad credentials
    #[error("visitor rejected: {0}")]
    VisitorAuth(String),

    /// No control session is registered for the run id
    #[error("no client control found for run id [{0}]")]
    ControlNotFound(String),

    /// The control session has shut down
    #[error("control session closed")]
    SessionClosed,

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DispatcherError> for ServerError {
    fn from(_: DispatcherError) -> Self {
        ServerError::SessionClosed
    }
}
