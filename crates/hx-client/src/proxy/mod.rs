//! Client-side proxies
//!
//! The [`ProxyManager`] keeps one [`wrapper::ProxyWrapper`] per configured
//! tunnel and reconciles that set against new configuration.

mod manager;
mod worker;
mod wrapper;

pub use manager::ProxyManager;
pub use wrapper::{ProxyWrapper, START_ERROR_RETRY, WAIT_START_RESEND};

use hx_protocol::ProxyType;

/// Lifecycle phase of a client proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyPhase {
    /// Created, registration not yet sent
    New,
    /// `NewProxy` sent, waiting for the server's answer
    WaitStart,
    /// The server refused the proxy; retried later
    StartError,
    /// Registered and serving work connections
    Running,
    /// Stopped by reconciliation or shutdown
    Closed,
}

impl ProxyPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyPhase::New => "new",
            ProxyPhase::WaitStart => "wait start",
            ProxyPhase::StartError => "start error",
            ProxyPhase::Running => "running",
            ProxyPhase::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ProxyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStatus {
    pub name: String,
    pub proxy_type: ProxyType,
    pub phase: ProxyPhase,
    /// Address of the local service
    pub local_addr: String,
    /// Public address granted by the server, once running
    pub remote_addr: String,
    /// Last error reported by the server
    pub error: String,
}
