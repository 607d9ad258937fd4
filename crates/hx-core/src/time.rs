//! Time helpers shared by client and server
//!
//! Wire timestamps are Unix seconds as `i64`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in seconds.
///
/// A clock set before the epoch yields 0 rather than failing.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Whether `timestamp` lies within `max_skew_secs` of now, in either direction
pub fn within_skew(timestamp: i64, max_skew_secs: i64) -> bool {
    (unix_timestamp() - timestamp).abs() <= max_skew_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_timestamp_is_positive() {
        assert!(unix_timestamp() > 0);
    }

    #[test]
    fn test_within_skew() {
        let now = unix_timestamp();
        assert!(within_skew(now, 10));
        assert!(within_skew(now - 5, 10));
        assert!(within_skew(now + 5, 10));
        assert!(!within_skew(now - 60, 10));
        assert!(!within_skew(now + 60, 10));
    }
}
