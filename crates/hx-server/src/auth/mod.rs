//! Client authentication

mod verifier;

pub use verifier::{new_verifier, AlwaysPassVerifier, TokenVerifier, Verifier};
