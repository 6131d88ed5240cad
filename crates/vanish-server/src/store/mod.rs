pub mod audit;
pub mod audit_log;
pub mod crypto;
pub mod file;
pub mod memory;
pub mod model;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StoreError;
use crate::handle::Handle;

pub use audit::{AuditEvent, AuditQuery, AuditSink, MemoryAuditLog};
pub use audit_log::{QueuedAuditLog, RedbAuditLog};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use model::{Payload, Revealed, SecretRecord, LATEST_DEADLINE};

/// Outcome chosen by the decision function passed to
/// [`RecordStore::get_and_mutate`]. The store applies it inside the same
/// atomic unit as the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    DeliverAndDelete,
    DeliverAndKeep,
    RejectAndDelete,
    RejectAndKeep,
}

/// Result of a single atomic access.
#[derive(Debug)]
pub enum Access {
    /// No record under the handle.
    Missing,
    /// The decision delivered. `burned` is set when the record was destroyed.
    Delivered(Revealed),
    /// The decision rejected; the record may or may not have been removed.
    Rejected,
}

/// Keyed storage for secret records with per-handle atomic check-then-act.
///
/// Operations on the same handle are mutually exclusive. Operations on
/// different handles must not wait on each other.
pub trait RecordStore: Send + Sync {
    /// Insert a record under a fresh handle. Never overwrites.
    fn put(&self, handle: &Handle, record: SecretRecord) -> Result<(), StoreError>;

    /// The only read path. Loads the record, runs `decide` on it and applies
    /// the decision before any other operation on the handle can observe it.
    fn get_and_mutate(
        &self,
        handle: &Handle,
        decide: &mut dyn FnMut(&SecretRecord) -> Decision,
    ) -> Result<Access, StoreError>;

    /// Remove a record. Returns whether one existed; absence is not an error.
    fn delete(&self, handle: &Handle) -> Result<bool, StoreError>;

    /// Remove every record whose deadline is at or before `now`.
    fn sweep(&self, now: i64) -> Result<usize, StoreError>;
}

/// Current wall-clock time as Unix milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Store whose every operation fails as if the disk were gone.
#[cfg(test)]
pub(crate) struct FailingStore;

#[cfg(test)]
impl FailingStore {
    fn fault(op: &'static str) -> StoreError {
        StoreError::Io {
            op,
            source: std::io::Error::other("disk unavailable"),
        }
    }
}

#[cfg(test)]
impl RecordStore for FailingStore {
    fn put(&self, _: &Handle, _: SecretRecord) -> Result<(), StoreError> {
        Err(Self::fault("write record"))
    }

    fn get_and_mutate(
        &self,
        _: &Handle,
        _: &mut dyn FnMut(&SecretRecord) -> Decision,
    ) -> Result<Access, StoreError> {
        Err(Self::fault("read record"))
    }

    fn delete(&self, _: &Handle) -> Result<bool, StoreError> {
        Err(Self::fault("remove record"))
    }

    fn sweep(&self, _: i64) -> Result<usize, StoreError> {
        Err(Self::fault("list records"))
    }
}
