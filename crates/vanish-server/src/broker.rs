use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BrokerError, StoreError};
use crate::handle::Handle;
use crate::store::audit::{
    ACTION_SECRET_BURNED, ACTION_SECRET_CREATE, ACTION_SECRET_READ, ACTION_SECRET_REVOKE,
    ACTION_SECRET_SWEEP,
};
use crate::store::{
    now_millis, Access, AuditEvent, AuditSink, Decision, Payload, RecordStore, Revealed,
    SecretRecord, LATEST_DEADLINE,
};

/// How many fresh handles `create` draws before giving up on collisions.
pub const MAX_HANDLE_ATTEMPTS: u32 = 4;

/// Why a retrieval came back empty. Kept for logs and audit only; callers
/// outside the broker must treat every variant the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absence {
    NotFound,
    Expired,
    AlreadyConsumed,
}

impl Absence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::Expired => "expired",
            Self::AlreadyConsumed => "already consumed",
        }
    }
}

/// Result of a retrieval with the internal reason preserved.
#[derive(Debug)]
pub enum Retrieval {
    Revealed(Revealed),
    Absent(Absence),
}

impl Retrieval {
    pub fn into_revealed(self) -> Option<Revealed> {
        match self {
            Self::Revealed(r) => Some(r),
            Self::Absent(_) => None,
        }
    }
}

/// A freshly created record.
#[derive(Debug, Clone)]
pub struct Created {
    pub handle: Handle,
    /// Deadline, Unix milliseconds.
    pub expires_at: i64,
}

/// Enforces the one-time and TTL policy on top of a [`RecordStore`].
///
/// The broker is the only code that builds, mutates or deletes records, and
/// the sole arbiter of deadline and burn-after-reading correctness.
#[derive(Clone)]
pub struct Broker {
    store: Arc<dyn RecordStore>,
    audit: Arc<dyn AuditSink>,
}

impl Broker {
    pub fn new(store: Arc<dyn RecordStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Store `payload` under a fresh handle that stops resolving after `ttl`.
    pub fn create(
        &self,
        payload: Payload,
        ttl: Duration,
        burn_after_reading: bool,
    ) -> Result<Created, BrokerError> {
        if ttl.is_zero() {
            return Err(BrokerError::InvalidTtl);
        }
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        if now_millis().saturating_add(ttl_ms) > LATEST_DEADLINE {
            return Err(BrokerError::InvalidTtl);
        }

        for attempt in 1..=MAX_HANDLE_ATTEMPTS {
            let handle = Handle::generate();
            let record = SecretRecord::new(payload.clone(), now_millis(), ttl, burn_after_reading);
            let expires_at = record.expires_at;

            match self.store.put(&handle, record) {
                Ok(()) => {
                    debug!(handle = %handle.fingerprint(), ttl_ms = ttl.as_millis() as u64, burn_after_reading, "stored secret");
                    self.audit.record(AuditEvent::new(
                        ACTION_SECRET_CREATE,
                        Some(&handle),
                        true,
                        Some(format!(
                            "ttl_seconds={} burn_after_reading={burn_after_reading}",
                            ttl.as_secs()
                        )),
                    ));
                    return Ok(Created { handle, expires_at });
                }
                Err(StoreError::DuplicateHandle) => {
                    warn!(attempt, "handle collision, regenerating");
                }
                Err(e) => {
                    error!(error = %e, "store failed during create");
                    self.audit.record(AuditEvent::new(
                        ACTION_SECRET_CREATE,
                        None,
                        false,
                        Some("store unavailable".into()),
                    ));
                    return Err(BrokerError::StoreUnavailable(e));
                }
            }
        }

        error!(attempts = MAX_HANDLE_ATTEMPTS, "exhausted handle generation");
        self.audit.record(AuditEvent::new(
            ACTION_SECRET_CREATE,
            None,
            false,
            Some("handle generation exhausted".into()),
        ));
        Err(BrokerError::HandleExhausted {
            attempts: MAX_HANDLE_ATTEMPTS,
        })
    }

    /// Reveal the secret behind `raw_handle` if it is still available, burning
    /// it when its policy says so. Unknown, expired and already consumed
    /// handles all yield `None`.
    pub fn retrieve_and_burn(&self, raw_handle: &str) -> Result<Option<Revealed>, BrokerError> {
        self.retrieve(raw_handle).map(Retrieval::into_revealed)
    }

    /// Same as [`Self::retrieve_and_burn`] but keeps the reason for absence.
    pub fn retrieve(&self, raw_handle: &str) -> Result<Retrieval, BrokerError> {
        let Some(handle) = Handle::parse(raw_handle) else {
            self.audit.record(AuditEvent::new(
                ACTION_SECRET_READ,
                None,
                false,
                Some("malformed handle".into()),
            ));
            return Ok(Retrieval::Absent(Absence::NotFound));
        };

        let mut absence = Absence::NotFound;
        let access = self.store.get_and_mutate(&handle, &mut |record| {
            // Checked under the store's lock, never trusted to a prior sweep.
            if record.is_expired(now_millis()) {
                absence = Absence::Expired;
                Decision::RejectAndDelete
            } else if record.consumed {
                absence = Absence::AlreadyConsumed;
                Decision::RejectAndKeep
            } else if record.burn_after_reading {
                Decision::DeliverAndDelete
            } else {
                Decision::DeliverAndKeep
            }
        });

        let access = match access {
            Ok(access) => access,
            Err(e) => {
                error!(handle = %handle.fingerprint(), error = %e, "store failed during retrieve");
                self.audit.record(AuditEvent::new(
                    ACTION_SECRET_READ,
                    Some(&handle),
                    false,
                    Some("store unavailable".into()),
                ));
                return Err(BrokerError::StoreUnavailable(e));
            }
        };

        match access {
            Access::Delivered(revealed) => {
                let action = if revealed.burned {
                    ACTION_SECRET_BURNED
                } else {
                    ACTION_SECRET_READ
                };
                info!(handle = %handle.fingerprint(), burned = revealed.burned, "secret delivered");
                self.audit
                    .record(AuditEvent::new(action, Some(&handle), true, None));
                Ok(Retrieval::Revealed(revealed))
            }
            Access::Rejected => Ok(self.absent(&handle, absence)),
            Access::Missing => Ok(self.absent(&handle, Absence::NotFound)),
        }
    }

    fn absent(&self, handle: &Handle, absence: Absence) -> Retrieval {
        debug!(handle = %handle.fingerprint(), reason = absence.as_str(), "secret not available");
        self.audit.record(AuditEvent::new(
            ACTION_SECRET_READ,
            Some(handle),
            false,
            Some(absence.as_str().into()),
        ));
        Retrieval::Absent(absence)
    }

    /// Destroy a record ahead of its deadline. Idempotent.
    pub fn revoke(&self, raw_handle: &str) -> Result<(), BrokerError> {
        let Some(handle) = Handle::parse(raw_handle) else {
            return Ok(());
        };
        match self.store.delete(&handle) {
            Ok(existed) => {
                info!(handle = %handle.fingerprint(), existed, "secret revoked");
                self.audit.record(AuditEvent::new(
                    ACTION_SECRET_REVOKE,
                    Some(&handle),
                    true,
                    Some(format!("existed={existed}")),
                ));
                Ok(())
            }
            Err(e) => {
                error!(handle = %handle.fingerprint(), error = %e, "store failed during revoke");
                self.audit.record(AuditEvent::new(
                    ACTION_SECRET_REVOKE,
                    Some(&handle),
                    false,
                    Some("store unavailable".into()),
                ));
                Err(BrokerError::StoreUnavailable(e))
            }
        }
    }

    /// Reclaim every record whose deadline is at or before `now` (Unix ms).
    pub fn sweep_expired(&self, now: i64) -> Result<usize, BrokerError> {
        let removed = self.store.sweep(now).map_err(BrokerError::StoreUnavailable)?;
        if removed > 0 {
            info!(removed, "swept expired secrets");
            self.audit.record(AuditEvent::new(
                ACTION_SECRET_SWEEP,
                None,
                true,
                Some(format!("swept={removed}")),
            ));
        }
        Ok(removed)
    }

    /// Sweep on a fixed interval until `cancel` fires. Reclamation only: reads
    /// re-check deadlines themselves, so a stopped sweep is harmless.
    pub fn spawn_sweep(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = broker.sweep_expired(now_millis()) {
                            warn!(error = %e, "background sweep error");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::store::audit::AuditQuery;
    use crate::store::{FailingStore, FileStore, MemoryAuditLog, MemoryStore};

    const HOUR: Duration = Duration::from_secs(3600);

    fn memory_broker() -> (Broker, Arc<MemoryAuditLog>) {
        let audit = Arc::new(MemoryAuditLog::new());
        (Broker::new(Arc::new(MemoryStore::new()), audit.clone()), audit)
    }

    fn file_broker() -> (Broker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        (
            Broker::new(Arc::new(store), Arc::new(MemoryAuditLog::new())),
            dir,
        )
    }

    fn payload_of(revealed: Option<Revealed>) -> Option<String> {
        revealed.map(|r| r.payload.as_str().unwrap().to_owned())
    }

    fn round_trip(b: &Broker) {
        let h = b.create("X".into(), HOUR, true).unwrap().handle;
        assert_eq!(payload_of(b.retrieve_and_burn(h.as_str()).unwrap()), Some("X".into()));
        assert!(b.retrieve_and_burn(h.as_str()).unwrap().is_none());
    }

    fn deadline_without_sweep(b: &Broker) {
        let h = b
            .create("short".into(), Duration::from_millis(1), true)
            .unwrap()
            .handle;
        thread::sleep(Duration::from_millis(2));
        assert!(matches!(
            b.retrieve(h.as_str()).unwrap(),
            Retrieval::Absent(Absence::Expired)
        ));
        // The stale record was evicted by the rejected read.
        assert!(matches!(
            b.retrieve(h.as_str()).unwrap(),
            Retrieval::Absent(Absence::NotFound)
        ));
    }

    fn non_burning_persists_until_deadline(b: &Broker) {
        let h = b.create("reuse".into(), HOUR, false).unwrap().handle;
        for _ in 0..5 {
            let r = b.retrieve_and_burn(h.as_str()).unwrap().unwrap();
            assert_eq!(r.payload.as_str(), Some("reuse"));
            assert!(!r.burned);
        }

        let short = b
            .create("brief".into(), Duration::from_millis(300), false)
            .unwrap()
            .handle;
        assert!(b.retrieve_and_burn(short.as_str()).unwrap().is_some());
        thread::sleep(Duration::from_millis(350));
        assert!(b.retrieve_and_burn(short.as_str()).unwrap().is_none());
    }

    fn revoke_is_immediate_and_idempotent(b: &Broker) {
        let h = b.create("r".into(), HOUR, false).unwrap().handle;
        b.revoke(h.as_str()).unwrap();
        assert!(b.retrieve_and_burn(h.as_str()).unwrap().is_none());
        b.revoke(h.as_str()).unwrap();
        b.revoke("not-a-handle").unwrap();
    }

    fn at_most_once(b: &Broker, readers: usize) {
        let h = b.create("once".into(), HOUR, true).unwrap().handle;
        let barrier = Arc::new(Barrier::new(readers));
        let threads: Vec<_> = (0..readers)
            .map(|_| {
                let b = b.clone();
                let h = h.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    b.retrieve_and_burn(h.as_str()).unwrap().is_some()
                })
            })
            .collect();
        let successes = threads
            .into_iter()
            .filter_map(|t| t.join().unwrap().then_some(()))
            .count();
        assert_eq!(successes, 1, "{readers} readers");
    }

    #[test]
    fn round_trip_memory() {
        round_trip(&memory_broker().0);
    }

    #[test]
    fn round_trip_file() {
        round_trip(&file_broker().0);
    }

    #[test]
    fn deadline_enforced_without_sweep_memory() {
        deadline_without_sweep(&memory_broker().0);
    }

    #[test]
    fn deadline_enforced_without_sweep_file() {
        let (b, _dir) = file_broker();
        deadline_without_sweep(&b);
    }

    #[test]
    fn non_burning_persists_memory() {
        non_burning_persists_until_deadline(&memory_broker().0);
    }

    #[test]
    fn non_burning_persists_file() {
        let (b, _dir) = file_broker();
        non_burning_persists_until_deadline(&b);
    }

    #[test]
    fn revoke_memory() {
        revoke_is_immediate_and_idempotent(&memory_broker().0);
    }

    #[test]
    fn revoke_file() {
        let (b, _dir) = file_broker();
        revoke_is_immediate_and_idempotent(&b);
    }

    #[test]
    fn at_most_once_delivery_memory() {
        let (b, _) = memory_broker();
        for readers in [1, 2, 8, 32] {
            at_most_once(&b, readers);
        }
    }

    #[test]
    fn at_most_once_delivery_file() {
        let (b, _dir) = file_broker();
        for readers in [1, 2, 8, 32] {
            at_most_once(&b, readers);
        }
    }

    #[test]
    fn handles_are_distinct_for_identical_payloads() {
        let (b, _) = memory_broker();
        let handles: HashSet<String> = (0..64)
            .map(|_| b.create("same".into(), HOUR, true).unwrap().handle.as_str().to_owned())
            .collect();
        assert_eq!(handles.len(), 64);

        let a = b.create("same".into(), HOUR, true).unwrap().handle;
        let c = b.create("same".into(), HOUR, true).unwrap().handle;
        let a = u128::from_str_radix(a.as_str(), 16).unwrap();
        let c = u128::from_str_radix(c.as_str(), 16).unwrap();
        assert_ne!(a.abs_diff(c), 1, "handles must not be sequential");
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let (b, _) = memory_broker();
        assert!(matches!(
            b.create("x".into(), Duration::ZERO, true),
            Err(BrokerError::InvalidTtl)
        ));
    }

    #[test]
    fn unrenderable_deadline_is_rejected() {
        let (b, audit) = memory_broker();
        for ttl in [Duration::from_secs(400_000_000_000), Duration::MAX] {
            assert!(matches!(
                b.create("x".into(), ttl, true),
                Err(BrokerError::InvalidTtl)
            ));
        }
        assert!(audit.events().is_empty());
        assert!(b.create("x".into(), Duration::from_secs(100 * 365 * 86_400), true).is_ok());
    }

    #[test]
    fn store_faults_are_errors_not_absences() {
        let audit = Arc::new(MemoryAuditLog::new());
        let b = Broker::new(Arc::new(FailingStore), audit.clone());
        let h = Handle::generate();

        assert!(matches!(
            b.create("x".into(), HOUR, true),
            Err(BrokerError::StoreUnavailable(_))
        ));
        assert!(matches!(
            b.retrieve(h.as_str()),
            Err(BrokerError::StoreUnavailable(_))
        ));
        assert!(matches!(
            b.retrieve_and_burn(h.as_str()),
            Err(BrokerError::StoreUnavailable(_))
        ));
        assert!(matches!(
            b.revoke(h.as_str()),
            Err(BrokerError::StoreUnavailable(_))
        ));
        assert!(matches!(
            b.sweep_expired(now_millis()),
            Err(BrokerError::StoreUnavailable(_))
        ));

        let events = audit.events();
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| !e.success));
        assert!(events
            .iter()
            .all(|e| e.detail.as_deref() == Some("store unavailable")));
    }

    #[test]
    fn consumed_record_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let b = Broker::new(store.clone(), Arc::new(MemoryAuditLog::new()));
        let h = Handle::generate();
        let mut record = SecretRecord::new("x".into(), now_millis(), HOUR, false);
        record.consumed = true;
        store.put(&h, record).unwrap();

        assert!(matches!(
            b.retrieve(h.as_str()).unwrap(),
            Retrieval::Absent(Absence::AlreadyConsumed)
        ));
    }

    #[test]
    fn burned_handle_reports_not_found() {
        let (b, _) = memory_broker();
        let h = b.create("x".into(), HOUR, true).unwrap().handle;
        b.retrieve_and_burn(h.as_str()).unwrap();
        assert!(matches!(
            b.retrieve(h.as_str()).unwrap(),
            Retrieval::Absent(Absence::NotFound)
        ));
    }

    #[test]
    fn malformed_handle_is_absent() {
        let (b, _) = memory_broker();
        assert!(matches!(
            b.retrieve("../etc/passwd").unwrap(),
            Retrieval::Absent(Absence::NotFound)
        ));
    }

    #[test]
    fn sweep_reclaims_expired() {
        let (b, _) = memory_broker();
        b.create("a".into(), Duration::from_millis(1), true).unwrap();
        b.create("b".into(), Duration::from_millis(1), true).unwrap();
        let live = b.create("c".into(), HOUR, true).unwrap().handle;

        assert_eq!(b.sweep_expired(now_millis() + 10).unwrap(), 2);
        assert!(b.retrieve_and_burn(live.as_str()).unwrap().is_some());
    }

    #[test]
    fn audit_never_sees_payload_or_handle() {
        let (b, audit) = memory_broker();
        let h = b.create("top-secret-password".into(), HOUR, true).unwrap().handle;
        b.retrieve_and_burn(h.as_str()).unwrap();
        b.retrieve_and_burn(h.as_str()).unwrap();
        b.revoke(h.as_str()).unwrap();

        let events = audit.events();
        let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(
            actions,
            vec![
                ACTION_SECRET_CREATE,
                ACTION_SECRET_BURNED,
                ACTION_SECRET_READ,
                ACTION_SECRET_REVOKE
            ]
        );
        for event in &events {
            let dump = format!("{event:?}");
            assert!(!dump.contains("top-secret-password"));
            assert!(!dump.contains(h.as_str()));
        }
        let failed = audit
            .query(&AuditQuery {
                action: Some(ACTION_SECRET_READ.into()),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(failed[0].detail.as_deref(), Some("not found"));
        assert!(!failed[0].success);
    }

    #[tokio::test]
    async fn spawned_sweep_stops_on_cancel() {
        let (b, _) = memory_broker();
        let cancel = CancellationToken::new();
        let task = b.spawn_sweep(Duration::from_millis(5), cancel.clone());
        b.create("gone".into(), Duration::from_millis(1), true).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        task.await.unwrap();

        let sweeps = b
            .audit()
            .query(&AuditQuery {
                action: Some(ACTION_SECRET_SWEEP.into()),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(sweeps.len(), 1);
    }
}
