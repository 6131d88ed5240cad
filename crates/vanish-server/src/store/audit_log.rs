use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::audit::{AuditEvent, AuditQuery, AuditSink};

const AUDIT_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("audit_log");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const AUDIT_SEQ_KEY: &str = "audit_seq";

/// Most events the background writer commits in one transaction.
const WRITE_BATCH: usize = 256;

/// Persistent audit log in a redb database. Event ids are monotonic.
#[derive(Clone)]
pub struct RedbAuditLog {
    db: Arc<Database>,
}

impl RedbAuditLog {
    /// Open (or create) the audit database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open audit database")?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(AUDIT_LOG)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Append an event, allocating its id from the counters table.
    pub fn append(&self, event: AuditEvent) -> Result<u64> {
        self.append_batch(vec![event])
    }

    /// Append events in one transaction. Returns the last id allocated.
    pub fn append_batch(&self, events: Vec<AuditEvent>) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let last = {
            let mut counters = write_txn.open_table(COUNTERS)?;
            let mut audit = write_txn.open_table(AUDIT_LOG)?;
            let mut seq = counters.get(AUDIT_SEQ_KEY)?.map(|g| g.value()).unwrap_or(0);
            for mut event in events {
                seq += 1;
                event.id = seq;
                let bytes = bincode::serde::encode_to_vec(&event, bincode::config::standard())
                    .context("bincode encode audit event")?;
                audit.insert(seq, bytes.as_slice())?;
            }
            counters.insert(AUDIT_SEQ_KEY, seq)?;
            seq
        };
        write_txn.commit()?;
        Ok(last)
    }

    /// List events matching the query, most recent first.
    pub fn list(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT_LOG)?;

        let mut events = Vec::new();
        for item in table.iter()?.rev() {
            let (_k, v) = item?;
            let (event, _): (AuditEvent, _) =
                bincode::serde::decode_from_slice(v.value(), bincode::config::standard())
                    .context("bincode decode audit event")?;

            if query.since.is_some_and(|since| event.timestamp < since) {
                break; // ids are monotonic, older events follow
            }
            if !query.matches(&event) {
                continue;
            }
            events.push(event);
            if events.len() >= query.limit {
                break;
            }
        }
        Ok(events)
    }

    /// Remove events older than `retention_seconds`. Returns count removed.
    pub fn prune(&self, retention_seconds: i64) -> Result<usize> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let cutoff = now - retention_seconds;

        let ids_to_remove: Vec<u64> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(AUDIT_LOG)?;
            let mut ids = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let (event, _): (AuditEvent, _) =
                    bincode::serde::decode_from_slice(v.value(), bincode::config::standard())
                        .context("bincode decode audit for prune")?;
                if event.timestamp < cutoff {
                    ids.push(k.value());
                } else {
                    break;
                }
            }
            ids
        };

        if ids_to_remove.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(AUDIT_LOG)?;
            for id in &ids_to_remove {
                table.remove(*id)?;
            }
        }
        write_txn.commit()?;

        let removed = ids_to_remove.len();
        info!(removed, "pruned old audit events");
        Ok(removed)
    }

    /// Prune on a fixed interval until `cancel` fires.
    pub fn spawn_retention_sweep(
        self,
        interval: Duration,
        retention_seconds: i64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let log = self.clone();
                        match tokio::task::spawn_blocking(move || log.prune(retention_seconds)).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(error = %e, "audit retention sweep error"),
                            Err(e) => warn!(error = %e, "audit retention task failed"),
                        }
                    }
                }
            }
        })
    }
}

impl RedbAuditLog {
    /// Start a writer task that commits queued events in batches. The
    /// returned sink never touches the database when recording.
    ///
    /// When `cancel` fires the writer stops accepting events, commits what is
    /// already queued and exits.
    pub fn spawn_writer(self, cancel: CancellationToken) -> (QueuedAuditLog, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = QueuedAuditLog {
            tx,
            log: self.clone(),
        };

        let task = tokio::spawn(async move {
            let mut batch = Vec::with_capacity(WRITE_BATCH);
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    n = rx.recv_many(&mut batch, WRITE_BATCH) => n,
                };
                if received == 0 {
                    break;
                }
                self.flush(&mut batch).await;
            }

            rx.close();
            while rx.recv_many(&mut batch, WRITE_BATCH).await > 0 {
                self.flush(&mut batch).await;
            }
            debug!("audit writer stopped");
        });

        (sink, task)
    }

    async fn flush(&self, batch: &mut Vec<AuditEvent>) {
        let events = std::mem::take(batch);
        let count = events.len();
        let log = self.clone();
        match tokio::task::spawn_blocking(move || log.append_batch(events)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, count, "failed to write audit events"),
            Err(e) => warn!(error = %e, count, "audit writer task failed"),
        }
    }
}

/// Audit sink backed by [`RedbAuditLog`] that queues events for a background
/// writer. Queries read the database and see events once they are committed.
#[derive(Clone)]
pub struct QueuedAuditLog {
    tx: mpsc::UnboundedSender<AuditEvent>,
    log: RedbAuditLog,
}

impl AuditSink for QueuedAuditLog {
    fn record(&self, event: AuditEvent) {
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event) {
            warn!(action = %event.action, "audit writer stopped; event dropped");
        }
    }

    fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        self.log.list(query)
    }
}

impl AuditSink for RedbAuditLog {
    fn record(&self, event: AuditEvent) {
        let action = event.action.clone();
        if let Err(e) = self.append(event) {
            warn!(error = %e, action = %action, "failed to record audit event");
        }
    }

    fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        self.list(query)
    }
}
