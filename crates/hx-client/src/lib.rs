//! hx-client: Client daemon for hepx tunnels
//!
//! The client keeps a control connection to the server, registers the
//! tunnels described in its configuration, and dials a work connection back
//! whenever the server needs one to carry a user's traffic to a local
//! service.

pub mod connector;
pub mod control;
pub mod error;
pub mod event;
pub mod proxy;
pub mod reconnect;
pub mod service;
pub mod visitor;

pub use control::Control;
pub use error::ClientError;
pub use proxy::{ProxyManager, ProxyPhase, ProxyStatus};
pub use service::Service;
