use std::fmt;
use std::time::Duration;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Secret bytes handed to the broker. Never parsed, never logged.
/// Wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload([REDACTED; {} bytes])", self.0.len())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Latest deadline a record may carry: the last millisecond of year 9999.
pub const LATEST_DEADLINE: i64 = 253_402_300_799_999;

/// A stored secret and its lifecycle metadata. Timestamps are Unix milliseconds.
#[derive(Debug, Clone)]
pub struct SecretRecord {
    pub payload: Payload,
    /// Set once at creation.
    pub created_at: i64,
    /// Deadline. The record is unavailable from this instant on.
    pub expires_at: i64,
    /// Destroy the record on the first successful read.
    pub burn_after_reading: bool,
    /// Flipped false -> true at most once, by the read that wins the burn.
    pub consumed: bool,
}

impl SecretRecord {
    pub fn new(payload: Payload, created_at: i64, ttl: Duration, burn_after_reading: bool) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            payload,
            created_at,
            expires_at: created_at.saturating_add(ttl_ms),
            burn_after_reading,
            consumed: false,
        }
    }

    /// True once `now` has reached the deadline.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub(crate) fn reveal(&self, burned: bool) -> Revealed {
        Revealed {
            payload: self.payload.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            burned,
        }
    }
}

/// What a successful retrieval hands back. Timestamps are for display only.
#[derive(Debug, Clone)]
pub struct Revealed {
    pub payload: Payload,
    pub created_at: i64,
    pub expires_at: i64,
    /// The read destroyed the record; the handle is now dead.
    pub burned: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_is_created_at_plus_ttl() {
        let r = SecretRecord::new("x".into(), 1_000, Duration::from_secs(2), true);
        assert_eq!(r.expires_at, 3_000);
        assert!(!r.is_expired(2_999));
        assert!(r.is_expired(3_000));
        assert!(!r.consumed);
    }

    #[test]
    fn huge_ttl_saturates() {
        let r = SecretRecord::new("x".into(), 1_000, Duration::MAX, false);
        assert_eq!(r.expires_at, i64::MAX);
    }

    #[test]
    fn payload_debug_is_redacted() {
        let p = Payload::from("hunter2");
        let shown = format!("{p:?}");
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("7 bytes"));
    }
}
