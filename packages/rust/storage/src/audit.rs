//! Append-only audit log.

use chrono::{DateTime, Utc};
use libsql::params;
use serde::Serialize;

use knowledgeforge_shared::{AuditEvent, Result};

use crate::{Storage, parse_ts, storage_err, to_i64, to_u64};

/// A persisted audit event with its position in the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: AuditEvent,
}

impl Storage {
    /// Append `event`; returns its sequence number.
    pub async fn append_audit_event(&self, event: &AuditEvent) -> Result<u64> {
        let payload = serde_json::to_string(event)?;
        self.check_writable()?;
        let conn = self.writer.lock().await;
        conn.execute(
            "INSERT INTO audit_events (kind, payload_json, recorded_at) VALUES (?1, ?2, ?3)",
            params![event.kind(), payload, Utc::now().to_rfc3339()],
        )
        .await
        .map_err(storage_err)?;
        Ok(to_u64(conn.last_insert_rowid()))
    }

    /// Events with `seq > after`, oldest first, at most `limit`.
    pub async fn list_audit_events(&self, after: u64, limit: u64) -> Result<Vec<AuditEntry>> {
        let mut rows = self
            .reader
            .query(
                "SELECT seq, payload_json, recorded_at FROM audit_events
                 WHERE seq > ?1 ORDER BY seq LIMIT ?2",
                params![to_i64(after), to_i64(limit)],
            )
            .await
            .map_err(storage_err)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let payload: String = row.get(1).map_err(storage_err)?;
            let recorded_at: String = row.get(2).map_err(storage_err)?;
            entries.push(AuditEntry {
                seq: to_u64(row.get::<i64>(0).map_err(storage_err)?),
                recorded_at: parse_ts(&recorded_at)?,
                event: serde_json::from_str(&payload)?,
            });
        }
        Ok(entries)
    }

    /// Count of events of one kind (see [`AuditEvent::kind`]).
    pub async fn count_audit_events(&self, kind: &str) -> Result<u64> {
        let mut rows = self
            .reader
            .query(
                "SELECT COUNT(*) FROM audit_events WHERE kind = ?1",
                params![kind],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(to_u64(row.get::<i64>(0).map_err(storage_err)?)),
            None => Ok(0),
        }
    }
}
