//! Commit log, schema-rejection counters and dead letters.

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use serde::Serialize;
use tracing::{instrument, warn};

use knowledgeforge_shared::{
    CommitResult, DeadLetter, KnowledgePackage, Result, SourceId, TripleDiagnostic,
};

use crate::{Storage, finish, parse_ts, storage_err, to_u64};

/// One row of the commit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitLogEntry {
    pub package_hash: String,
    pub source_id: SourceId,
    pub domain: String,
    pub revision: u64,
    pub triples: u64,
    pub committed_at: DateTime<Utc>,
}

impl Storage {
    /// The recorded result of an earlier successful commit of `package_hash`.
    pub async fn committed_result(&self, package_hash: &str) -> Result<Option<CommitResult>> {
        let mut rows = self
            .reader
            .query(
                "SELECT result_json FROM commit_log WHERE package_hash = ?1",
                params![package_hash],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => {
                let json: String = row.get(0).map_err(storage_err)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Successful commits for `domain`, in revision order.
    pub async fn list_commits(&self, domain: &str) -> Result<Vec<CommitLogEntry>> {
        let mut rows = self
            .reader
            .query(
                "SELECT package_hash, source_id, domain, revision, triples, committed_at
                 FROM commit_log WHERE domain = ?1 ORDER BY revision",
                params![domain],
            )
            .await
            .map_err(storage_err)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let committed_at: String = row.get(5).map_err(storage_err)?;
            entries.push(CommitLogEntry {
                package_hash: row.get(0).map_err(storage_err)?,
                source_id: SourceId(row.get(1).map_err(storage_err)?),
                domain: row.get(2).map_err(storage_err)?,
                revision: to_u64(row.get::<i64>(3).map_err(storage_err)?),
                triples: to_u64(row.get::<i64>(4).map_err(storage_err)?),
                committed_at: parse_ts(&committed_at)?,
            });
        }
        Ok(entries)
    }

    /// Count one more schema rejection of `package`.
    ///
    /// Once the count reaches `max_failures` the package moves to the dead
    /// letter table in the same transaction and the result says so.
    #[instrument(skip_all, fields(package = %package.content_hash))]
    pub async fn record_schema_rejection(
        &self,
        package: &KnowledgePackage,
        diagnostics: Vec<TripleDiagnostic>,
        max_failures: u32,
    ) -> Result<CommitResult> {
        let conn = self.begin().await?;
        let outcome = count_rejection(&conn, package, diagnostics, max_failures)
            .await
            .map(|result| (result, true));
        finish(&conn, outcome).await
    }

    /// The dead letter for `package_hash`, if it was dead-lettered.
    pub async fn dead_letter(&self, package_hash: &str) -> Result<Option<DeadLetter>> {
        let mut rows = self
            .reader
            .query(
                "SELECT package_hash, source_id, domain, attempts, diagnostics_json, dead_lettered_at
                 FROM dead_letters WHERE package_hash = ?1",
                params![package_hash],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_dead_letter(&row)?)),
            None => Ok(None),
        }
    }

    /// Dead letters, optionally restricted to one domain, oldest first.
    pub async fn list_dead_letters(&self, domain: Option<&str>) -> Result<Vec<DeadLetter>> {
        let mut rows = match domain {
            Some(domain) => {
                self.reader
                    .query(
                        "SELECT package_hash, source_id, domain, attempts, diagnostics_json, dead_lettered_at
                         FROM dead_letters WHERE domain = ?1 ORDER BY dead_lettered_at",
                        params![domain],
                    )
                    .await
            }
            None => {
                self.reader
                    .query(
                        "SELECT package_hash, source_id, domain, attempts, diagnostics_json, dead_lettered_at
                         FROM dead_letters ORDER BY dead_lettered_at",
                        params![],
                    )
                    .await
            }
        }
        .map_err(storage_err)?;

        let mut letters = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            letters.push(row_to_dead_letter(&row)?);
        }
        Ok(letters)
    }
}

async fn count_rejection(
    conn: &Connection,
    package: &KnowledgePackage,
    diagnostics: Vec<TripleDiagnostic>,
    max_failures: u32,
) -> Result<CommitResult> {
    let diagnostics_json = serde_json::to_string(&diagnostics)?;
    let now = Utc::now().to_rfc3339();
    let hash = package.content_hash.as_str();

    conn.execute(
        "INSERT INTO schema_rejections (package_hash, source_id, domain, attempts, diagnostics_json, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4, ?5)
         ON CONFLICT(package_hash) DO UPDATE SET
           attempts = attempts + 1,
           diagnostics_json = excluded.diagnostics_json,
           updated_at = excluded.updated_at",
        params![
            hash,
            package.source_id.0.as_str(),
            package.domain.as_str(),
            diagnostics_json.as_str(),
            now.as_str(),
        ],
    )
    .await
    .map_err(storage_err)?;

    let mut rows = conn
        .query(
            "SELECT attempts FROM schema_rejections WHERE package_hash = ?1",
            params![hash],
        )
        .await
        .map_err(storage_err)?;
    let attempts = match rows.next().await.map_err(storage_err)? {
        Some(row) => to_u32(row.get::<i64>(0).map_err(storage_err)?),
        None => 1,
    };
    drop(rows);

    let dead_lettered = attempts >= max_failures;
    if dead_lettered {
        conn.execute(
            "INSERT OR REPLACE INTO dead_letters (package_hash, source_id, domain, attempts, diagnostics_json, dead_lettered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                hash,
                package.source_id.0.as_str(),
                package.domain.as_str(),
                i64::from(attempts),
                diagnostics_json.as_str(),
                now.as_str(),
            ],
        )
        .await
        .map_err(storage_err)?;
        warn!(attempts, "package dead-lettered");
    }

    Ok(CommitResult::SchemaRejected {
        package_hash: package.content_hash.clone(),
        diagnostics,
        attempts,
        dead_lettered,
    })
}

fn to_u32(v: i64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

fn row_to_dead_letter(row: &libsql::Row) -> Result<DeadLetter> {
    let diagnostics_json: String = row.get(4).map_err(storage_err)?;
    let at: String = row.get(5).map_err(storage_err)?;
    Ok(DeadLetter {
        package_hash: row.get(0).map_err(storage_err)?,
        source_id: SourceId(row.get(1).map_err(storage_err)?),
        domain: row.get(2).map_err(storage_err)?,
        attempts: to_u32(row.get::<i64>(3).map_err(storage_err)?),
        diagnostics: serde_json::from_str(&diagnostics_json)?,
        dead_lettered_at: parse_ts(&at)?,
    })
}
