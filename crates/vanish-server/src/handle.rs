use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Random bytes per handle (128 bits).
pub const HANDLE_BYTES: usize = 16;

/// Opaque retrieval token naming a secret record.
///
/// Rendered as 32 lowercase hex characters. `Debug` prints a fingerprint
/// instead of the token, since the token alone grants access to the secret.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Handle(String);

impl Handle {
    /// Draw a fresh handle from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; HANDLE_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Accept only well-formed handles. Anything else can never name a record.
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed = raw.len() == HANDLE_BYTES * 2
            && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        well_formed.then(|| Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short SHA-256 digest, safe to put in logs and audit events.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.fingerprint())
    }
}
