use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{Access, Decision, RecordStore, SecretRecord};
use crate::error::StoreError;
use crate::handle::Handle;

/// Process-local store. Records die with the process.
///
/// Per-handle atomicity comes from the map's entry lock: the decision runs
/// while the entry is held, so no other operation on that handle interleaves.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<Handle, SecretRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn put(&self, handle: &Handle, record: SecretRecord) -> Result<(), StoreError> {
        match self.records.entry(handle.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateHandle),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    fn get_and_mutate(
        &self,
        handle: &Handle,
        decide: &mut dyn FnMut(&SecretRecord) -> Decision,
    ) -> Result<Access, StoreError> {
        let Entry::Occupied(entry) = self.records.entry(handle.clone()) else {
            return Ok(Access::Missing);
        };

        let access = match decide(entry.get()) {
            Decision::DeliverAndDelete => {
                let mut record = entry.remove();
                record.consumed = true;
                Access::Delivered(record.reveal(true))
            }
            Decision::DeliverAndKeep => Access::Delivered(entry.get().reveal(false)),
            Decision::RejectAndDelete => {
                entry.remove();
                Access::Rejected
            }
            Decision::RejectAndKeep => Access::Rejected,
        };
        Ok(access)
    }

    fn delete(&self, handle: &Handle) -> Result<bool, StoreError> {
        Ok(self.records.remove(handle).is_some())
    }

    fn sweep(&self, now: i64) -> Result<usize, StoreError> {
        let mut removed = 0usize;
        self.records.retain(|_, record| {
            let keep = !record.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}
