use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::handle::Handle;

// ── Action constants ─────────────────────────────────────────────────────────

pub const ACTION_SECRET_CREATE: &str = "secret.create";
pub const ACTION_SECRET_READ: &str = "secret.read";
pub const ACTION_SECRET_BURNED: &str = "secret.burned";
pub const ACTION_SECRET_REVOKE: &str = "secret.revoke";
pub const ACTION_SECRET_SWEEP: &str = "secret.sweep";
pub const ACTION_GRANT_ISSUE: &str = "grant.issue";
pub const ACTION_GRANT_REVOKE: &str = "grant.revoke";

// ── AuditEvent ───────────────────────────────────────────────────────────────

/// One audit entry. `handle` holds a fingerprint, never the handle itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    /// Unix seconds.
    pub timestamp: i64,
    pub action: String,
    pub handle: Option<String>,
    pub success: bool,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(
        action: &str,
        handle: Option<&Handle>,
        success: bool,
        detail: Option<String>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        Self {
            id: 0, // allocated by the sink
            timestamp,
            action: action.to_owned(),
            handle: handle.map(Handle::fingerprint),
            success,
            detail,
        }
    }
}

// ── AuditQuery ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AuditQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub action: Option<String>,
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            action: None,
            limit: 100,
        }
    }
}

impl AuditQuery {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.timestamp > until) {
            return false;
        }
        if let Some(ref action) = self.action {
            if event.action != *action {
                return false;
            }
        }
        true
    }
}

// ── AuditSink ────────────────────────────────────────────────────────────────

/// Destination for audit events, injected wherever events are produced.
///
/// `record` is infallible from the caller's point of view: a sink that fails
/// to persist logs the failure instead of failing the secret operation.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);

    /// Events matching `query`, most recent first.
    fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>>;
}

/// Audit sink that keeps events in memory.
#[derive(Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, mut event: AuditEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        event.id = events.len() as u64 + 1;
        events.push(event);
    }

    fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        Ok(events
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(query.limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_a_fingerprint_not_the_handle() {
        let h = Handle::generate();
        let event = AuditEvent::new(ACTION_SECRET_CREATE, Some(&h), true, None);
        assert_eq!(event.handle.as_deref(), Some(h.fingerprint().as_str()));
        assert_ne!(event.handle.as_deref(), Some(h.as_str()));
    }

    #[test]
    fn memory_log_queries_newest_first() {
        let log = MemoryAuditLog::new();
        log.record(AuditEvent::new(ACTION_SECRET_CREATE, None, true, None));
        log.record(AuditEvent::new(ACTION_SECRET_READ, None, false, None));
        log.record(AuditEvent::new(ACTION_SECRET_CREATE, None, true, None));

        let all = log.query(&AuditQuery::default()).unwrap();
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 2, 1]);

        let creates = log
            .query(&AuditQuery {
                action: Some(ACTION_SECRET_CREATE.into()),
                limit: 1,
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].id, 3);
    }

    #[test]
    fn query_time_window() {
        let mut event = AuditEvent::new(ACTION_SECRET_READ, None, true, None);
        event.timestamp = 500;
        let window = AuditQuery {
            since: Some(100),
            until: Some(400),
            ..AuditQuery::default()
        };
        assert!(!window.matches(&event));
        event.timestamp = 300;
        assert!(window.matches(&event));
    }
}
