//! libSQL storage layer for the knowledge store and its ledgers.
//!
//! The [`Storage`] struct wraps a local libSQL database holding committed
//! triples, entity version tokens, the commit log, dead letters, knowledge
//! service records, promotion decisions, and the audit log.
//!
//! **Access rules:**
//! - Writes go through a single writer connection, one transaction at a time.
//! - Reads use a separate connection in WAL mode and see the last committed
//!   state; they are never blocked by an in-flight commit.
//! - [`Storage::open_readonly`] handles reject every write.

mod audit;
mod graph;
mod ledger;
mod migrations;
mod services;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tokio::sync::{Mutex, MutexGuard};

use knowledgeforge_shared::{KnowledgeForgeError, Result};

pub use audit::AuditEntry;
pub use ledger::CommitLogEntry;
pub use services::ServiceTransition;

/// Milliseconds a connection waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    /// Owns the connections below.
    _db: Database,
    writer: Mutex<Connection>,
    reader: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KnowledgeForgeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let writer = db.connect().map_err(storage_err)?;
        pragma(&writer, "PRAGMA journal_mode=WAL").await?;
        pragma(&writer, &format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;

        let storage = Self {
            reader: db.connect().map_err(storage_err)?,
            writer: Mutex::new(writer),
            _db: db,
            readonly: false,
        };
        pragma(&storage.reader, &format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for audit and status consumers).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let reader = db.connect().map_err(storage_err)?;
        pragma(&reader, &format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;

        Ok(Self {
            writer: Mutex::new(db.connect().map_err(storage_err)?),
            reader,
            _db: db,
            readonly: true,
        })
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;
        let conn = self.writer.lock().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    KnowledgeForgeError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .reader
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(KnowledgeForgeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Take the writer and open an immediate transaction on it.
    async fn begin(&self) -> Result<MutexGuard<'_, Connection>> {
        self.check_writable()?;
        let conn = self.writer.lock().await;
        conn.execute("BEGIN IMMEDIATE", params![])
            .await
            .map_err(storage_err)?;
        Ok(conn)
    }

    /// Single write statement outside an explicit transaction.
    async fn write(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<u64> {
        self.check_writable()?;
        let conn = self.writer.lock().await;
        conn.execute(sql, params).await.map_err(storage_err)
    }
}

/// Finish a transaction opened by [`Storage::begin`]: commit when `outcome`
/// says so, roll back otherwise or on error.
async fn finish<T>(conn: &Connection, outcome: Result<(T, bool)>) -> Result<T> {
    match outcome {
        Ok((value, true)) => {
            if let Err(e) = conn.execute("COMMIT", params![]).await {
                let _ = conn.execute("ROLLBACK", params![]).await;
                return Err(storage_err(e));
            }
            Ok(value)
        }
        Ok((value, false)) => {
            conn.execute("ROLLBACK", params![])
                .await
                .map_err(storage_err)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", params![]).await;
            Err(e)
        }
    }
}

/// PRAGMAs that report a value must be run as queries.
async fn pragma(conn: &Connection, sql: &str) -> Result<()> {
    let mut rows = conn.query(sql, params![]).await.map_err(storage_err)?;
    while let Ok(Some(_)) = rows.next().await {}
    Ok(())
}

fn storage_err(e: impl std::fmt::Display) -> KnowledgeForgeError {
    KnowledgeForgeError::Storage(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KnowledgeForgeError::Storage(format!("invalid date: {e}")))
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Storage;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    pub(crate) async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("kf_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_storage;
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
        assert_eq!(storage.current_revision().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reopen_does_not_reapply_migrations() {
        let tmp = std::env::temp_dir().join(format!("kf_test_{}.db", Uuid::now_v7()));
        drop(Storage::open(&tmp).await.unwrap());
        let storage = Storage::open(&tmp).await.expect("reopen");
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("kf_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert!(ro.is_readonly());
        assert_eq!(ro.current_revision().await.unwrap(), 0);
        let result = ro
            .append_audit_event(&knowledgeforge_shared::AuditEvent::PackageDeadLettered {
                package_hash: "h".into(),
                source_id: "S1".into(),
                attempts: 3,
            })
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
