//! Committed triples, entity version tokens and the package commit primitive.

use std::collections::BTreeMap;

use chrono::Utc;
use libsql::{Connection, params};
use tracing::{debug, instrument};

use knowledgeforge_shared::{
    AnchorId, CommitResult, EntityConflict, EntityKey, EntityRef, KnowledgeForgeError,
    KnowledgePackage, Provenance, Result, SourceId, Subgraph, Triple, VersionSnapshot,
    VersionToken,
};

use crate::{Storage, finish, parse_ts, storage_err, to_i64, to_u64};

const TRIPLE_COLUMNS: &str = "domain, subject_key, subject_name, subject_type, predicate, \
     object_key, object_name, object_type, source_id, anchor, extracted_at, \
     extractor_version, confidence";

impl Storage {
    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Store-wide revision as of the last commit.
    pub async fn current_revision(&self) -> Result<u64> {
        read_revision(&self.reader).await
    }

    /// Every entity's version token plus the revision they were read at, in
    /// one statement so the two agree.
    pub async fn version_snapshot(&self) -> Result<VersionSnapshot> {
        let mut rows = self
            .reader
            .query(
                "SELECT 'rev', '', revision FROM store_revision
                 UNION ALL
                 SELECT 'ver', entity_key, version FROM entity_versions",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut revision = 0;
        let mut versions = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let tag: String = row.get(0).map_err(storage_err)?;
            let value = to_u64(row.get::<i64>(2).map_err(storage_err)?);
            if tag == "rev" {
                revision = value;
            } else {
                let key: String = row.get(1).map_err(storage_err)?;
                versions.insert(EntityKey::from_normalized(key), VersionToken(value));
            }
        }
        Ok(VersionSnapshot::new(revision, versions))
    }

    /// Current token of one entity (`v0` if never written).
    pub async fn entity_version(&self, key: &EntityKey) -> Result<VersionToken> {
        read_version(&self.reader, key).await
    }

    /// All committed triples of `domain`, oldest first.
    pub async fn subgraph(&self, domain: &str) -> Result<Subgraph> {
        let mut rows = self
            .reader
            .query(
                &format!(
                    "SELECT (SELECT revision FROM store_revision), {TRIPLE_COLUMNS}
                     FROM triples WHERE domain = ?1 ORDER BY id"
                ),
                params![domain],
            )
            .await
            .map_err(storage_err)?;

        let mut revision = None;
        let mut triples = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            revision.get_or_insert(to_u64(row.get::<i64>(0).map_err(storage_err)?));
            triples.push(row_to_triple(&row, 1)?);
        }

        let revision = match revision {
            Some(r) => r,
            None => self.current_revision().await?,
        };
        Ok(Subgraph::new(domain, revision, triples))
    }

    /// Number of committed triples in `domain`.
    pub async fn triple_count(&self, domain: &str) -> Result<u64> {
        let mut rows = self
            .reader
            .query(
                "SELECT COUNT(*) FROM triples WHERE domain = ?1",
                params![domain],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(to_u64(row.get::<i64>(0).map_err(storage_err)?)),
            None => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Apply a validated package in one transaction.
    ///
    /// Every subject's stored token must equal the package's base token;
    /// otherwise nothing is written and the mismatches come back as
    /// [`CommitResult::Conflict`]. On success each subject's token is bumped
    /// with a compare-and-swap, the store revision advances by one, the
    /// triples are upserted and the result is recorded in the commit log.
    #[instrument(skip_all, fields(package = %package.content_hash, source = %package.source_id))]
    pub async fn commit_package(&self, package: &KnowledgePackage) -> Result<CommitResult> {
        let conn = self.begin().await?;
        let outcome = apply_package(&conn, package)
            .await
            .map(|result| {
                let commit = result.is_success();
                (result, commit)
            });
        finish(&conn, outcome).await
    }
}

async fn apply_package(conn: &Connection, package: &KnowledgePackage) -> Result<CommitResult> {
    let subjects = package.subjects();

    let mut conflicts = Vec::new();
    for key in &subjects {
        let expected = package.base_version(key);
        let actual = read_version(conn, key).await?;
        if actual != expected {
            conflicts.push(EntityConflict {
                entity: key.clone(),
                expected,
                actual,
            });
        }
    }
    if !conflicts.is_empty() {
        debug!(conflicts = conflicts.len(), "version tokens moved");
        return Ok(CommitResult::Conflict {
            package_hash: package.content_hash.clone(),
            conflicts,
        });
    }

    let now = Utc::now().to_rfc3339();
    let mut versions = BTreeMap::new();
    for key in &subjects {
        let expected = package.base_version(key);
        let written = if expected == VersionToken(0) {
            conn.execute(
                "INSERT OR IGNORE INTO entity_versions (entity_key, version, updated_at)
                 VALUES (?1, 1, ?2)",
                params![key.as_str(), now.as_str()],
            )
            .await
        } else {
            conn.execute(
                "UPDATE entity_versions SET version = version + 1, updated_at = ?3
                 WHERE entity_key = ?1 AND version = ?2",
                params![key.as_str(), to_i64(expected.0), now.as_str()],
            )
            .await
        };
        let affected = written.map_err(storage_err)?;

        if affected != 1 {
            return Err(KnowledgeForgeError::Storage(format!(
                "version compare-and-swap failed for {key} at {expected}"
            )));
        }
        versions.insert(key.clone(), expected.next());
    }

    conn.execute(
        "UPDATE store_revision SET revision = revision + 1 WHERE id = 1",
        params![],
    )
    .await
    .map_err(storage_err)?;
    let revision = read_revision(conn).await?;

    for triple in &package.triples {
        upsert_triple(conn, triple, &package.content_hash, revision).await?;
    }

    let result = CommitResult::Success {
        package_hash: package.content_hash.clone(),
        revision,
        versions,
        triples_applied: package.triples.len(),
    };

    let result_json = serde_json::to_string(&result)?;
    conn.execute(
        "INSERT INTO commit_log (package_hash, source_id, domain, revision, triples, result_json, committed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            package.content_hash.as_str(),
            package.source_id.0.as_str(),
            package.domain.as_str(),
            to_i64(revision),
            to_i64(package.triples.len() as u64),
            result_json,
            now.as_str(),
        ],
    )
    .await
    .map_err(storage_err)?;

    Ok(result)
}

async fn upsert_triple(
    conn: &Connection,
    triple: &Triple,
    package_hash: &str,
    revision: u64,
) -> Result<()> {
    let prov = &triple.provenance;
    conn.execute(
        "INSERT INTO triples (domain, subject_key, subject_name, subject_type, predicate,
                              object_key, object_name, object_type, source_id, anchor,
                              extracted_at, extractor_version, confidence, package_hash, revision)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(domain, subject_key, predicate, object_key, source_id) DO UPDATE SET
           subject_name = excluded.subject_name,
           subject_type = excluded.subject_type,
           object_name = excluded.object_name,
           object_type = excluded.object_type,
           anchor = excluded.anchor,
           extracted_at = excluded.extracted_at,
           extractor_version = excluded.extractor_version,
           confidence = excluded.confidence,
           package_hash = excluded.package_hash,
           revision = excluded.revision",
        params![
            triple.domain.as_str(),
            triple.subject.key.as_str(),
            triple.subject.name.as_str(),
            triple.subject.entity_type.as_str(),
            triple.predicate.as_str(),
            triple.object.key.as_str(),
            triple.object.name.as_str(),
            triple.object.entity_type.as_str(),
            prov.source_id.0.as_str(),
            prov.anchor.as_str(),
            prov.extracted_at.to_rfc3339(),
            prov.extractor_version.as_str(),
            prov.confidence,
            package_hash,
            to_i64(revision),
        ],
    )
    .await
    .map_err(storage_err)?;
    Ok(())
}

async fn read_revision(conn: &Connection) -> Result<u64> {
    let mut rows = conn
        .query("SELECT revision FROM store_revision WHERE id = 1", params![])
        .await
        .map_err(storage_err)?;
    match rows.next().await.map_err(storage_err)? {
        Some(row) => Ok(to_u64(row.get::<i64>(0).map_err(storage_err)?)),
        None => Ok(0),
    }
}

async fn read_version(conn: &Connection, key: &EntityKey) -> Result<VersionToken> {
    let mut rows = conn
        .query(
            "SELECT version FROM entity_versions WHERE entity_key = ?1",
            params![key.as_str()],
        )
        .await
        .map_err(storage_err)?;
    match rows.next().await.map_err(storage_err)? {
        Some(row) => Ok(VersionToken(to_u64(
            row.get::<i64>(0).map_err(storage_err)?,
        ))),
        None => Ok(VersionToken(0)),
    }
}

/// Decode [`TRIPLE_COLUMNS`] starting at column `at`.
fn row_to_triple(row: &libsql::Row, at: i32) -> Result<Triple> {
    let text = |i: i32| row.get::<String>(at + i).map_err(storage_err);
    Ok(Triple {
        domain: text(0)?,
        subject: EntityRef {
            key: EntityKey::from_normalized(text(1)?),
            name: text(2)?,
            entity_type: text(3)?,
        },
        predicate: text(4)?,
        object: EntityRef {
            key: EntityKey::from_normalized(text(5)?),
            name: text(6)?,
            entity_type: text(7)?,
        },
        provenance: Provenance {
            source_id: SourceId(text(8)?),
            anchor: AnchorId(text(9)?),
            extracted_at: parse_ts(&text(10)?)?,
            extractor_version: text(11)?,
            confidence: row.get::<f64>(at + 12).map_err(storage_err)?,
        },
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use knowledgeforge_shared::{
        Anchor, AnchorId, EntityKey, EntityRef, KnowledgePackage, PackageId, PackageStatus,
        Provenance, SourceId, Triple, VersionToken,
    };

    /// A one-paragraph package asserting `subject worksOn object`.
    pub(crate) fn package(subject: &str, object: &str, base: u64) -> KnowledgePackage {
        let source_id = SourceId::from("S1");
        let anchor = AnchorId::new(&source_id, 1, 1);
        let triple = Triple {
            domain: "eng".into(),
            subject: EntityRef::new(subject, "Person"),
            predicate: "worksOn".into(),
            object: EntityRef::new(object, "Project"),
            provenance: Provenance {
                source_id: source_id.clone(),
                anchor: anchor.clone(),
                extracted_at: Utc::now(),
                extractor_version: "test".into(),
                confidence: 0.9,
            },
        };
        let mut base_versions = BTreeMap::new();
        base_versions.insert(EntityKey::normalize(subject), VersionToken(base));
        KnowledgePackage {
            id: PackageId::new(),
            source_id,
            source_hash: format!("{subject}-{object}"),
            domain: "eng".into(),
            extractor_version: "test".into(),
            created_at: Utc::now(),
            status: PackageStatus::Complete,
            anchors: vec![Anchor {
                id: anchor,
                section: 1,
                paragraph: 1,
                heading: None,
                text: format!("{subject} works on {object}."),
            }],
            entities: vec![],
            relations: vec![],
            frames: vec![],
            triples: vec![triple],
            base_versions,
            failed_units: vec![],
            discarded_proposals: 0,
            content_hash: String::new(),
        }
        .seal()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::package;
    use super::*;
    use crate::test_support::test_storage;

    #[tokio::test]
    async fn commit_bumps_tokens_and_revision() {
        let storage = test_storage().await;
        let result = storage.commit_package(&package("Alice", "Apollo", 0)).await.unwrap();

        match result {
            CommitResult::Success {
                revision,
                versions,
                triples_applied,
                ..
            } => {
                assert_eq!(revision, 1);
                assert_eq!(triples_applied, 1);
                assert_eq!(versions[&EntityKey::normalize("alice")], VersionToken(1));
            }
            other => panic!("expected success, got {other:?}"),
        }

        let alice = EntityKey::normalize("Alice");
        assert_eq!(storage.entity_version(&alice).await.unwrap(), VersionToken(1));
        let snapshot = storage.version_snapshot().await.unwrap();
        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.token_for(&alice), VersionToken(1));

        let graph = storage.subgraph("eng").await.unwrap();
        assert_eq!(graph.revision, 1);
        assert_eq!(graph.triples.len(), 1);
        assert_eq!(graph.triples[0].subject.name, "Alice");
        assert_eq!(graph.triples[0].provenance.anchor.as_str(), "S1#s1.p1");
    }

    #[tokio::test]
    async fn stale_base_token_conflicts_without_writing() {
        let storage = test_storage().await;
        storage.commit_package(&package("Alice", "Apollo", 0)).await.unwrap();

        let result = storage.commit_package(&package("Alice", "Zephyr", 0)).await.unwrap();
        match result {
            CommitResult::Conflict { conflicts, .. } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].expected, VersionToken(0));
                assert_eq!(conflicts[0].actual, VersionToken(1));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(storage.triple_count("eng").await.unwrap(), 1);
        assert_eq!(storage.current_revision().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recommitting_a_fact_updates_in_place() {
        let storage = test_storage().await;
        storage.commit_package(&package("Alice", "Apollo", 0)).await.unwrap();
        let again = storage.commit_package(&package("Alice", "Apollo", 1)).await.unwrap();
        assert!(again.is_success());
        assert_eq!(storage.triple_count("eng").await.unwrap(), 1);
        assert_eq!(
            storage.entity_version(&EntityKey::normalize("alice")).await.unwrap(),
            VersionToken(2)
        );
    }

    #[tokio::test]
    async fn empty_domain_reports_current_revision() {
        let storage = test_storage().await;
        storage.commit_package(&package("Alice", "Apollo", 0)).await.unwrap();
        let graph = storage.subgraph("finance").await.unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.revision, 1);
    }
}
