//! Knowledge Write Queue: the only path by which packages reach the store.
//!
//! Each subject entity has a FIFO lane. A package holds the lanes of every
//! subject it writes (taken in sorted key order, so two packages can never
//! wait on each other) while it is validated and committed. Commits then
//! compare the package's base tokens against the store inside one
//! transaction.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{Mutex as Lane, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use knowledgeforge_shared::{
    AuditEvent, CommitResult, DomainSchema, EntityKey, KnowledgeForgeError, KnowledgePackage,
    QueueConfig, Result, TripleDiagnostic, Violation,
};
use knowledgeforge_storage::Storage;

use crate::audit::AuditLog;

pub struct WriteQueue {
    storage: Arc<Storage>,
    audit: AuditLog,
    config: QueueConfig,
    schemas: RwLock<HashMap<String, Arc<DomainSchema>>>,
    lanes: Mutex<HashMap<EntityKey, Arc<Lane<()>>>>,
}

impl WriteQueue {
    pub fn new(storage: Arc<Storage>, audit: AuditLog, config: QueueConfig) -> Self {
        Self {
            storage,
            audit,
            config,
            schemas: RwLock::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the schema packages of `schema.domain` are
    /// validated against. Focus gaps are stripped; they only steer extraction.
    pub fn register_schema(&self, schema: &DomainSchema) {
        let mut base = schema.clone();
        base.focus.clear();
        let mut schemas = self.schemas.write().unwrap_or_else(|p| p.into_inner());
        schemas.insert(base.domain.clone(), Arc::new(base));
    }

    fn schema_for(&self, domain: &str) -> Result<Arc<DomainSchema>> {
        self.schemas
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(domain)
            .cloned()
            .ok_or_else(|| {
                KnowledgeForgeError::validation(format!("no schema registered for domain {domain}"))
            })
    }

    /// Validate and commit `package`.
    ///
    /// Already-committed content hashes return their recorded result, and
    /// dead-lettered ones return the recorded rejection, without touching
    /// the store.
    #[instrument(skip_all, fields(package = %package.content_hash, source = %package.source_id, domain = %package.domain))]
    pub async fn enqueue(&self, package: &KnowledgePackage) -> Result<CommitResult> {
        let schema = self.schema_for(&package.domain)?;
        let subjects = package.subjects();
        let lanes = self.acquire(&subjects).await;
        let result = self.commit_locked(&schema, package).await;
        drop(lanes);
        self.release(&subjects);
        result
    }

    /// Number of subject lanes currently tracked.
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    async fn commit_locked(
        &self,
        schema: &DomainSchema,
        package: &KnowledgePackage,
    ) -> Result<CommitResult> {
        if let Some(prior) = self.storage.committed_result(&package.content_hash).await? {
            debug!("content hash already committed, replaying result");
            return Ok(prior);
        }
        if let Some(letter) = self.storage.dead_letter(&package.content_hash).await? {
            debug!(attempts = letter.attempts, "content hash is dead-lettered");
            return Ok(CommitResult::SchemaRejected {
                package_hash: letter.package_hash,
                diagnostics: letter.diagnostics,
                attempts: letter.attempts,
                dead_lettered: true,
            });
        }

        let diagnostics = validate(schema, package);
        if !diagnostics.is_empty() {
            let rejected = self
                .storage
                .record_schema_rejection(package, diagnostics, self.config.max_schema_failures)
                .await?;
            if let CommitResult::SchemaRejected {
                attempts,
                dead_lettered: true,
                ..
            } = &rejected
            {
                self.audit
                    .record(AuditEvent::PackageDeadLettered {
                        package_hash: package.content_hash.clone(),
                        source_id: package.source_id.clone(),
                        attempts: *attempts,
                    })
                    .await?;
            }
            warn!(result = rejected.label(), "package failed schema validation");
            return Ok(rejected);
        }

        let result = self.storage.commit_package(package).await?;
        match &result {
            CommitResult::Success {
                revision,
                triples_applied,
                ..
            } => info!(revision, triples = triples_applied, "package committed"),
            CommitResult::Conflict { conflicts, .. } => {
                info!(entities = conflicts.len(), "package conflicts with newer writes")
            }
            CommitResult::SchemaRejected { .. } => {}
        }
        Ok(result)
    }

    /// Take the lanes of `subjects` in sorted order.
    async fn acquire(&self, subjects: &BTreeSet<EntityKey>) -> Vec<OwnedMutexGuard<()>> {
        let lanes: Vec<Arc<Lane<()>>> = {
            let mut map = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
            subjects
                .iter()
                .map(|key| map.entry(key.clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(lanes.len());
        for lane in lanes {
            guards.push(lane.lock_owned().await);
        }
        guards
    }

    /// Forget lanes nobody holds or waits on.
    fn release(&self, subjects: &BTreeSet<EntityKey>) {
        let mut map = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        for key in subjects {
            if map.get(key).is_some_and(|lane| Arc::strong_count(lane) == 1) {
                map.remove(key);
            }
        }
    }
}

/// Per-triple schema and grounding diagnostics; empty means valid.
pub fn validate(schema: &DomainSchema, package: &KnowledgePackage) -> Vec<TripleDiagnostic> {
    package
        .triples
        .iter()
        .enumerate()
        .filter_map(|(index, triple)| {
            let mut violations = schema.check_triple(triple);
            if !package.is_grounded(triple) {
                violations.push(Violation::Ungrounded {
                    anchor: triple.provenance.anchor.to_string(),
                });
            }
            (!violations.is_empty()).then(|| TripleDiagnostic {
                index,
                subject: triple.subject.name.clone(),
                predicate: triple.predicate.clone(),
                object: triple.object.name.clone(),
                violations,
            })
        })
        .collect()
}
