use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::crypto::{self, EncryptionKey};
use super::{Access, Decision, Payload, RecordStore, SecretRecord};
use crate::error::StoreError;
use crate::handle::Handle;

const RECORD_EXT: &str = "json";
const STAGING_EXT: &str = "tmp";

/// On-disk layout of one record. The payload is sealed; the metadata stays
/// plaintext so the sweep can evict without decrypting.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    /// Hex ChaCha20-Poly1305 ciphertext of the payload.
    content: String,
    /// Hex 12-byte nonce.
    nonce: String,
    created_at: i64,
    expires_at: i64,
    burn_after_reading: bool,
    #[serde(default)]
    consumed: bool,
}

/// One JSON file per handle under a directory. A deleted file is a deleted
/// record.
///
/// Atomicity per handle comes from an in-process lock held across the whole
/// load, decide and delete sequence. Locks live in a table keyed by handle and
/// are dropped once nobody holds them, so unrelated handles never contend.
pub struct FileStore {
    dir: PathBuf,
    key: EncryptionKey,
    locks: DashMap<Handle, Arc<Mutex<()>>>,
}

impl FileStore {
    /// Open the store rooted at `dir`, creating the directory and the sealing
    /// key if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create store dir: {}", dir.display()))?;
        let key = crypto::load_or_create_key(dir)?;
        Ok(Self::with_key(dir, key))
    }

    pub fn with_key(dir: impl Into<PathBuf>, key: EncryptionKey) -> Self {
        Self {
            dir: dir.into(),
            key,
            locks: DashMap::new(),
        }
    }

    fn record_path(&self, handle: &Handle) -> PathBuf {
        self.dir.join(format!("{}.{RECORD_EXT}", handle.as_str()))
    }

    fn staging_path(&self, handle: &Handle) -> PathBuf {
        self.dir.join(format!("{}.{STAGING_EXT}", handle.as_str()))
    }

    /// Run `f` holding the exclusive lock for `handle`.
    fn with_lock<T>(&self, handle: &Handle, f: impl FnOnce() -> T) -> T {
        let lock = Arc::clone(self.locks.entry(handle.clone()).or_default().value());
        let out = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        drop(lock);
        // Only the table still references the lock: no waiter, safe to reclaim.
        self.locks
            .remove_if(handle, |_, lock| Arc::strong_count(lock) == 1);
        out
    }

    fn seal(&self, record: &SecretRecord) -> Result<Vec<u8>, StoreError> {
        let (ciphertext, nonce) = crypto::encrypt(&self.key, record.payload.as_bytes())
            .map_err(|e| StoreError::Seal(e.to_string()))?;
        let stored = StoredRecord {
            content: hex::encode(ciphertext),
            nonce: hex::encode(nonce),
            created_at: record.created_at,
            expires_at: record.expires_at,
            burn_after_reading: record.burn_after_reading,
            consumed: record.consumed,
        };
        serde_json::to_vec(&stored).map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn unseal(&self, stored: &StoredRecord) -> Result<SecretRecord> {
        let ciphertext = hex::decode(&stored.content).context("decode content")?;
        let nonce: [u8; 12] = hex::decode(&stored.nonce)
            .context("decode nonce")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("nonce must be 12 bytes"))?;
        let plaintext = crypto::decrypt(&self.key, &ciphertext, &nonce)?;
        Ok(SecretRecord {
            payload: Payload::new(plaintext),
            created_at: stored.created_at,
            expires_at: stored.expires_at,
            burn_after_reading: stored.burn_after_reading,
            consumed: stored.consumed,
        })
    }

    /// Read the plaintext metadata of a record. A file that cannot be parsed
    /// is destroyed and reported as missing. Caller holds the handle lock.
    fn read_stored(&self, handle: &Handle, path: &Path) -> Result<Option<StoredRecord>, StoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io("read record")(e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(stored) => Ok(Some(stored)),
            Err(e) => {
                warn!(handle = %handle.fingerprint(), error = %e, "discarding unreadable record");
                remove_file(path)?;
                Ok(None)
            }
        }
    }

    /// Load and decrypt a record. Same discard rule as [`Self::read_stored`].
    fn load(&self, handle: &Handle, path: &Path) -> Result<Option<SecretRecord>, StoreError> {
        let Some(stored) = self.read_stored(handle, path)? else {
            return Ok(None);
        };
        match self.unseal(&stored) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(handle = %handle.fingerprint(), error = %e, "discarding undecryptable record");
                remove_file(path)?;
                Ok(None)
            }
        }
    }
}

impl RecordStore for FileStore {
    fn put(&self, handle: &Handle, record: SecretRecord) -> Result<(), StoreError> {
        let bytes = self.seal(&record)?;
        let path = self.record_path(handle);
        let staging = self.staging_path(handle);

        self.with_lock(handle, || {
            write_synced(&staging, &bytes).map_err(StoreError::io("stage record"))?;
            // hard_link never replaces an existing file, so a colliding handle
            // cannot clobber a live record and readers never see a partial write.
            let published = fs::hard_link(&staging, &path);
            if let Err(e) = fs::remove_file(&staging) {
                debug!(error = %e, "could not remove staging file");
            }
            match published {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    Err(StoreError::DuplicateHandle)
                }
                Err(e) => Err(StoreError::io("publish record")(e)),
            }
        })
    }

    fn get_and_mutate(
        &self,
        handle: &Handle,
        decide: &mut dyn FnMut(&SecretRecord) -> Decision,
    ) -> Result<Access, StoreError> {
        let path = self.record_path(handle);
        self.with_lock(handle, || {
            let Some(mut record) = self.load(handle, &path)? else {
                return Ok(Access::Missing);
            };

            let access = match decide(&record) {
                Decision::DeliverAndDelete => {
                    // Deliver only once the file is gone.
                    if !remove_file(&path)? {
                        return Ok(Access::Missing);
                    }
                    record.consumed = true;
                    Access::Delivered(record.reveal(true))
                }
                Decision::DeliverAndKeep => Access::Delivered(record.reveal(false)),
                Decision::RejectAndDelete => {
                    remove_file(&path)?;
                    Access::Rejected
                }
                Decision::RejectAndKeep => Access::Rejected,
            };
            Ok(access)
        })
    }

    fn delete(&self, handle: &Handle) -> Result<bool, StoreError> {
        let path = self.record_path(handle);
        self.with_lock(handle, || remove_file(&path))
    }

    fn sweep(&self, now: i64) -> Result<usize, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(StoreError::io("scan store"))?;

        let mut removed = 0usize;
        for entry in entries {
            let path = entry.map_err(StoreError::io("scan store"))?.path();
            let Some(handle) = handle_from_path(&path) else {
                continue;
            };
            let expired = self.with_lock(&handle, || match self.read_stored(&handle, &path)? {
                Some(stored) if now >= stored.expires_at => remove_file(&path),
                _ => Ok(false),
            })?;
            if expired {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Map `<handle>.json` back to its handle. Other files are ignored.
fn handle_from_path(path: &Path) -> Option<Handle> {
    if path.extension()? != RECORD_EXT {
        return None;
    }
    Handle::parse(path.file_stem()?.to_str()?)
}

/// Remove a file, reporting whether it existed.
fn remove_file(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io("remove record")(e)),
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = crypto::create_private(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::{contract, now_millis};

    fn make_store() -> (FileStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn put_rejects_duplicates() {
        let (s, _dir) = make_store();
        contract::put_rejects_duplicates(&s);
    }

    #[test]
    fn missing_handle() {
        let (s, _dir) = make_store();
        contract::missing_handle(&s);
    }

    #[test]
    fn decisions_apply() {
        let (s, _dir) = make_store();
        contract::decisions_apply(&s);
    }

    #[test]
    fn delete_is_idempotent() {
        let (s, _dir) = make_store();
        contract::delete_is_idempotent(&s);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let (s, _dir) = make_store();
        contract::sweep_removes_only_expired(&s);
    }

    #[test]
    fn concurrent_burn_has_one_winner() {
        let (s, _dir) = make_store();
        contract::concurrent_burn_has_one_winner(Arc::new(s));
    }

    #[test]
    fn record_file_layout() {
        let (s, dir) = make_store();
        let h = Handle::generate();
        s.put(
            &h,
            SecretRecord::new("plain-secret".into(), 1_000, Duration::from_secs(60), true),
        )
        .unwrap();

        let raw = fs::read_to_string(dir.path().join(format!("{}.json", h.as_str()))).unwrap();
        assert!(!raw.contains("plain-secret"), "payload must be sealed at rest");

        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(json["content"].is_string());
        assert_eq!(json["created_at"], 1_000);
        assert_eq!(json["expires_at"], 61_000);
        assert_eq!(json["burn_after_reading"], true);
        assert_eq!(json["consumed"], false);
    }

    #[test]
    fn burn_leaves_no_files_behind() {
        let (s, dir) = make_store();
        let h = Handle::generate();
        s.put(
            &h,
            SecretRecord::new("x".into(), now_millis(), Duration::from_secs(60), true),
        )
        .unwrap();
        s.get_and_mutate(&h, &mut |_| Decision::DeliverAndDelete)
            .unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name != crypto::KEY_FILE)
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
        assert!(s.locks.is_empty(), "lock table should be reclaimed");
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let h = Handle::generate();
        {
            let s = FileStore::open(dir.path()).unwrap();
            s.put(
                &h,
                SecretRecord::new("persisted".into(), now_millis(), Duration::from_secs(60), false),
            )
            .unwrap();
        }
        let s = FileStore::open(dir.path()).unwrap();
        match s.get_and_mutate(&h, &mut |_| Decision::DeliverAndKeep).unwrap() {
            Access::Delivered(r) => assert_eq!(r.payload.as_bytes(), b"persisted"),
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn consumed_flag_on_disk_is_honored() {
        let (s, dir) = make_store();
        let h = Handle::generate();
        let mut record =
            SecretRecord::new("x".into(), now_millis(), Duration::from_secs(60), false);
        record.consumed = true;
        s.put(&h, record).unwrap();
        assert!(dir.path().join(format!("{}.json", h.as_str())).exists());

        let mut seen = None;
        s.get_and_mutate(&h, &mut |r| {
            seen = Some(r.consumed);
            Decision::RejectAndKeep
        })
        .unwrap();
        assert_eq!(seen, Some(true));
    }

    #[test]
    fn corrupt_record_is_discarded() {
        let (s, dir) = make_store();
        let h = Handle::generate();
        let path = dir.path().join(format!("{}.json", h.as_str()));
        fs::write(&path, b"{not json").unwrap();

        let access = s
            .get_and_mutate(&h, &mut |_| Decision::DeliverAndKeep)
            .unwrap();
        assert!(matches!(access, Access::Missing));
        assert!(!path.exists());
    }

    #[test]
    fn foreign_key_cannot_open_records() {
        let dir = tempfile::tempdir().unwrap();
        let h = Handle::generate();
        FileStore::with_key(dir.path(), crypto::generate_key())
            .put(
                &h,
                SecretRecord::new("x".into(), now_millis(), Duration::from_secs(60), true),
            )
            .unwrap();

        let other = FileStore::with_key(dir.path(), crypto::generate_key());
        let access = other
            .get_and_mutate(&h, &mut |_| Decision::DeliverAndDelete)
            .unwrap();
        assert!(matches!(access, Access::Missing));
    }

    #[test]
    fn sweep_ignores_unrelated_files() {
        let (s, dir) = make_store();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        fs::write(dir.path().join("zz.json"), b"{}").unwrap();
        assert_eq!(s.sweep(i64::MAX).unwrap(), 0);
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("zz.json").exists());
    }
}
