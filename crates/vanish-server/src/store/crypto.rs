use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use tracing::info;
use zeroize::ZeroizeOnDrop;

/// File holding the record sealing key inside the storage directory.
pub const KEY_FILE: &str = "vanish.key";

/// 32-byte key sealing record payloads at rest.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Generate a fresh random key.
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    EncryptionKey(key)
}

/// Wrap raw key bytes. Returns `None` unless exactly 32 bytes are given.
pub fn load_key(bytes: &[u8]) -> Option<EncryptionKey> {
    let key: [u8; 32] = bytes.try_into().ok()?;
    Some(EncryptionKey(key))
}

/// Load `vanish.key` from `dir`, creating it on first use.
pub fn load_or_create_key(dir: &Path) -> Result<EncryptionKey> {
    let key_path = dir.join(KEY_FILE);
    if key_path.exists() {
        let bytes = fs::read(&key_path).context("read vanish.key")?;
        load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "vanish.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = generate_key();
        let mut file = create_private(&key_path).context("create vanish.key")?;
        file.write_all(key.as_bytes()).context("write vanish.key")?;
        file.sync_all().context("sync vanish.key")?;
        info!(path = %key_path.display(), "generated new record sealing key");
        Ok(key)
    }
}

/// Create (or truncate) a file readable only by the owner.
pub(crate) fn create_private(path: &Path) -> std::io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Encrypt `plaintext` with `key`, returning `(ciphertext, nonce)`.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; 12])> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypt `ciphertext` with `key` and `nonce`, returning plaintext.
pub fn decrypt(key: &EncryptionKey, ciphertext: &[u8], nonce_bytes: &[u8; 12]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = Nonce::from(*nonce_bytes);

    cipher
        .decrypt(&nonce, ciphertext)
        .map_err(|e| anyhow::anyhow!("decrypt: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = generate_key();
        let (ct, nonce) = encrypt(&key, b"db-user:db-pass").unwrap();
        assert_ne!(ct.as_slice(), b"db-user:db-pass");
        assert_eq!(decrypt(&key, &ct, &nonce).unwrap(), b"db-user:db-pass");
    }

    #[test]
    fn wrong_key_fails() {
        let (ct, nonce) = encrypt(&generate_key(), b"secret").unwrap();
        assert!(decrypt(&generate_key(), &ct, &nonce).is_err());
    }

    #[test]
    fn key_file_is_created_once_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_key(dir.path()).unwrap();
        let second = load_or_create_key(dir.path()).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn corrupt_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(KEY_FILE), b"short").unwrap();
        assert!(load_or_create_key(dir.path()).is_err());
    }
}
