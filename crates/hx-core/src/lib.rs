//! hx-core: Core abstractions and configuration for hepx
//!
//! This crate provides shared types, configuration structures, the auth key
//! derivation used by both ends, and the NAT classification engine.

pub mod auth;
pub mod config;
pub mod error;
pub mod nathole;
pub mod time;
pub mod types;

pub use error::{generate_response_error, AuthError, ConfigError, NatError};
pub use types::{new_run_id, AsyncStream, BoxedStream, RunId};
