//! Core domain types

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length in bytes of a generated run id before hex encoding
const RUN_ID_BYTES: usize = 8;

/// Identifier of one client process, stable across its reconnects
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Create a run id from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Generate a fresh random run id (16 lowercase hex characters)
pub fn new_run_id() -> Result<RunId, rand::Error> {
    let mut buf = [0u8; RUN_ID_BYTES];
    rand::rngs::OsRng.try_fill_bytes(&mut buf)?;
    Ok(RunId(hex::encode(buf)))
}

/// A duplex byte stream.
///
/// Trait objects can only have a single non-auto principal trait, so
/// `AsyncRead + AsyncWrite` is wrapped into one.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

/// Any transport (TCP, in-process pipe, multiplexed substream) once accepted
pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Local machine identity reported at login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
}

impl HostInfo {
    /// Detect the current host
    pub fn detect() -> Self {
        Self {
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_id_format() {
        let id = new_run_id().unwrap();
        assert_eq!(id.as_str().len(), RUN_ID_BYTES * 2);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_new_run_id_unique() {
        let a = new_run_id().unwrap();
        let b = new_run_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_run_id_display() {
        assert_eq!(format!("{}", RunId::from("abc123")), "abc123");
    }
}
