//! Audit log: every event is persisted first, then broadcast to live
//! subscribers.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use knowledgeforge_shared::{AuditEvent, Result};
use knowledgeforge_storage::{AuditEntry, Storage};

/// Live buffer size; slow subscribers past it see `Lagged` and can catch up
/// from [`AuditLog::history`].
pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

/// Append-only event log shared by every pipeline component.
#[derive(Clone)]
pub struct AuditLog {
    storage: Arc<Storage>,
    sender: broadcast::Sender<AuditEntry>,
}

impl AuditLog {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self::with_capacity(storage, DEFAULT_AUDIT_CAPACITY)
    }

    pub fn with_capacity(storage: Arc<Storage>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { storage, sender }
    }

    /// Persist `event` and announce it. Returns its sequence number.
    pub async fn record(&self, event: AuditEvent) -> Result<u64> {
        let seq = self.storage.append_audit_event(&event).await?;
        let kind = event.kind();
        let entry = AuditEntry {
            seq,
            recorded_at: chrono::Utc::now(),
            event,
        };
        // No subscribers is fine; the table is the record.
        let receivers = self.sender.send(entry).unwrap_or(0);
        debug!(seq, kind, receivers, "audit event recorded");
        Ok(seq)
    }

    /// Live events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEntry> {
        self.sender.subscribe()
    }

    /// Persisted events after `after`, oldest first.
    pub async fn history(&self, after: u64, limit: u64) -> Result<Vec<AuditEntry>> {
        self.storage.list_audit_events(after, limit).await
    }
}
