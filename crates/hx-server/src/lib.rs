//! hx-server: Rendezvous server for hepx tunnels
//!
//! The server accepts control connections from clients behind NAT,
//! authenticates them, and exposes the tunnels they register. Traffic for
//! a tunnel flows over work connections the client dials back on request.

pub mod auth;
pub mod control;
pub mod error;
pub mod proxy;
pub mod server;
pub mod service;
pub mod visitor;

pub use control::{ControlManager, ControlSession, SessionState};
pub use error::ServerError;
pub use service::Service;
