//! Source extraction: one document in, one four-layer knowledge package out.
//!
//! L0 segmentation is local; each unit is then sent to the reasoning service
//! (concurrently, bounded by a semaphore), proposals are filtered against the
//! schema, merged by entity resolution, framed per subject and lowered to
//! grounded triples. A unit whose call fails stays in the package as L0 only
//! and the package is marked partial.

mod resolve;
mod segment;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use knowledgeforge_reasoning::{
    CallFailure, Proposal, ReasoningClient, ReasoningRequest, call_with_policy,
};
use knowledgeforge_shared::{
    DomainSchema, ExtractorConfig, KnowledgePackage, PackageId, PackageStatus, SourceDocument,
    SourceId, UnitFailure, VersionSnapshot,
};

pub use segment::segment;

// ---------------------------------------------------------------------------
// ExtractionFailure
// ---------------------------------------------------------------------------

/// Why no package could be produced.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractionFailure {
    #[error("source {source_id} is {size} bytes, limit is {max}")]
    TooLarge {
        source_id: SourceId,
        size: usize,
        max: usize,
    },

    #[error("source {source_id} has no text units")]
    Empty { source_id: SourceId },

    #[error("source {source_id} is tagged {found}, schema is for {expected}")]
    DomainMismatch {
        source_id: SourceId,
        expected: String,
        found: String,
    },

    /// Every unit's inference call failed.
    #[error("reasoning unavailable for all {units} units of {source_id}: {last_error}")]
    ReasoningUnavailable {
        source_id: SourceId,
        units: usize,
        last_error: String,
    },
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Turns source documents into knowledge packages.
#[derive(Clone)]
pub struct Extractor {
    client: Arc<dyn ReasoningClient>,
    config: ExtractorConfig,
}

impl Extractor {
    pub fn new(client: Arc<dyn ReasoningClient>, config: ExtractorConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extract `source` against `schema`. Every subject written by the
    /// package carries its token from `snapshot` as the base version.
    #[instrument(skip_all, fields(source = %source.id, domain = %schema.domain))]
    pub async fn extract(
        &self,
        source: &SourceDocument,
        schema: &DomainSchema,
        snapshot: &VersionSnapshot,
    ) -> std::result::Result<KnowledgePackage, ExtractionFailure> {
        let started = Instant::now();

        if source.size_bytes() > self.config.max_source_bytes {
            return Err(ExtractionFailure::TooLarge {
                source_id: source.id.clone(),
                size: source.size_bytes(),
                max: self.config.max_source_bytes,
            });
        }
        if source.domain != schema.domain {
            return Err(ExtractionFailure::DomainMismatch {
                source_id: source.id.clone(),
                expected: schema.domain.clone(),
                found: source.domain.clone(),
            });
        }

        // L0
        let anchors = segment(&source.id, &source.content);
        if anchors.is_empty() {
            return Err(ExtractionFailure::Empty {
                source_id: source.id.clone(),
            });
        }
        debug!(units = anchors.len(), "segmented source");

        // Fan out one reasoning call per unit.
        let fragment = schema.fragment();
        let semaphore = Arc::new(Semaphore::new(self.config.unit_concurrency.max(1)));
        let mut handles = Vec::with_capacity(anchors.len());
        for anchor in &anchors {
            let client = self.client.clone();
            let sem = semaphore.clone();
            let policy = self.config.call_policy.clone();
            let request = ReasoningRequest {
                unit_id: anchor.id.to_string(),
                context: segment::unit_context(anchor),
                schema: fragment.clone(),
            };
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await;
                call_with_policy(client.as_ref(), &request, &policy).await
            }));
        }

        let mut outcomes: Vec<std::result::Result<Proposal, CallFailure>> =
            Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(CallFailure {
                    error: knowledgeforge_shared::KnowledgeForgeError::reasoning_fatal(format!(
                        "unit task failed: {e}"
                    )),
                    attempts: 0,
                }),
            });
        }

        // L1
        let mut resolver = resolve::Resolver::new(schema, self.config.min_confidence);
        let mut failed_units = Vec::new();
        for (anchor, outcome) in anchors.iter().zip(outcomes) {
            match outcome {
                Ok(proposal) => resolver.absorb(&anchor.id, &proposal.response),
                Err(failure) => {
                    warn!(unit = %anchor.id, error = %failure, "unit degraded to L0 only");
                    failed_units.push(UnitFailure {
                        anchor: anchor.id.clone(),
                        error: failure.error.to_string(),
                        attempts: failure.attempts,
                    });
                }
            }
        }

        if failed_units.len() == anchors.len() {
            let last_error = failed_units
                .last()
                .map(|f| f.error.clone())
                .unwrap_or_default();
            return Err(ExtractionFailure::ReasoningUnavailable {
                source_id: source.id.clone(),
                units: anchors.len(),
                last_error,
            });
        }

        // L2 + L3
        let frames = resolver.frames();
        let extracted_at = Utc::now();
        let triples = resolve::lower(
            &frames,
            &schema.domain,
            &source.id,
            &self.config.extractor_version,
            extracted_at,
        );

        let base_versions: BTreeMap<_, _> = triples
            .iter()
            .map(|t| (t.subject.key.clone(), snapshot.token_for(&t.subject.key)))
            .collect();

        let status = if failed_units.is_empty() {
            PackageStatus::Complete
        } else {
            PackageStatus::Partial
        };

        let package = KnowledgePackage {
            id: PackageId::new(),
            source_id: source.id.clone(),
            source_hash: source.content_hash.clone(),
            domain: schema.domain.clone(),
            extractor_version: self.config.extractor_version.clone(),
            created_at: extracted_at,
            status,
            entities: resolver.typed_entities(),
            relations: resolver.relations().to_vec(),
            frames,
            triples,
            base_versions,
            failed_units,
            discarded_proposals: resolver.discarded,
            anchors,
            content_hash: String::new(),
        }
        .seal();

        let elapsed = started.elapsed();
        if elapsed > self.config.target {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                target_secs = self.config.target.as_secs(),
                "extraction exceeded its time target"
            );
        }
        info!(
            units = package.anchors.len(),
            failed_units = package.failed_units.len(),
            entities = package.entities.len(),
            triples = package.triples.len(),
            discarded = package.discarded_proposals,
            partial = matches!(package.status, PackageStatus::Partial),
            elapsed_ms = elapsed.as_millis() as u64,
            "extraction complete"
        );

        Ok(package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use knowledgeforge_reasoning::{FnReasoningClient, ProposedRelation, ReasoningResponse};
    use knowledgeforge_shared::{
        CallPolicy, EntityKey, KnowledgeForgeError, RelationType, VersionToken,
    };

    fn schema() -> DomainSchema {
        DomainSchema::new(
            "eng",
            vec![
                RelationType::new("worksOn", "Person", "Project"),
                RelationType::new("partOf", "Project", "Program"),
            ],
        )
    }

    fn config() -> ExtractorConfig {
        ExtractorConfig {
            call_policy: CallPolicy {
                timeout: Duration::from_millis(500),
                max_attempts: 2,
                backoff: Duration::from_millis(1),
            },
            extractor_version: "test-extractor".into(),
            ..ExtractorConfig::default()
        }
    }

    /// Proposes `<A> works on <B>` and `<A> is part of <B>` sentences; fails
    /// every unit mentioning "FAIL".
    fn sentence_client() -> Arc<dyn ReasoningClient> {
        Arc::new(FnReasoningClient::new("sentences", |req: &ReasoningRequest| {
            if req.context.contains("FAIL") {
                return Err(KnowledgeForgeError::reasoning_transient("backend down"));
            }
            let mut relations = Vec::new();
            for sentence in req.context.split('.') {
                for (phrase, predicate) in [(" works on ", "worksOn"), (" is part of ", "partOf")] {
                    if let Some((s, o)) = sentence.split_once(phrase) {
                        relations.push(ProposedRelation {
                            subject: s.trim().into(),
                            predicate: predicate.into(),
                            object: o.trim().into(),
                            confidence: 0.9,
                        });
                    }
                }
            }
            Ok(ReasoningResponse {
                entities: vec![],
                relations,
                confidence: 0.9,
            })
        }))
    }

    #[tokio::test]
    async fn extracts_grounded_triples() {
        let extractor = Extractor::new(sentence_client(), config());
        let source = SourceDocument::new(
            "S1",
            "eng",
            "Alice works on Apollo.\n\nApollo is part of Artemis.\n\nBob works on Apollo.",
        );
        let package = extractor
            .extract(&source, &schema(), &VersionSnapshot::default())
            .await
            .unwrap();

        assert_eq!(package.status, PackageStatus::Complete);
        assert_eq!(package.anchors.len(), 3);
        assert_eq!(package.triples.len(), 3);
        assert!(package.triples.iter().all(|t| package.is_grounded(t)));
        assert_eq!(package.frames.len(), 3);
        assert_eq!(package.content_hash, package.compute_content_hash());
        assert_eq!(package.extractor_version, "test-extractor");
    }

    #[tokio::test]
    async fn failed_unit_marks_package_partial() {
        let extractor = Extractor::new(sentence_client(), config());
        let source = SourceDocument::new("S2", "eng", "Alice works on Apollo.\n\nFAIL here.");
        let package = extractor
            .extract(&source, &schema(), &VersionSnapshot::default())
            .await
            .unwrap();

        assert_eq!(package.status, PackageStatus::Partial);
        assert_eq!(package.anchors.len(), 2);
        assert_eq!(package.failed_units.len(), 1);
        assert_eq!(package.failed_units[0].attempts, 2);
        assert_eq!(package.triples.len(), 1);
    }

    #[tokio::test]
    async fn all_units_failing_is_an_extraction_failure() {
        let extractor = Extractor::new(sentence_client(), config());
        let source = SourceDocument::new("S3", "eng", "FAIL one.\n\nFAIL two.");
        let err = extractor
            .extract(&source, &schema(), &VersionSnapshot::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionFailure::ReasoningUnavailable { units: 2, .. }));
    }

    #[tokio::test]
    async fn rejects_oversize_and_empty_sources() {
        let mut cfg = config();
        cfg.max_source_bytes = 8;
        let extractor = Extractor::new(sentence_client(), cfg);
        let big = SourceDocument::new("big", "eng", "Alice works on Apollo.");
        assert!(matches!(
            extractor
                .extract(&big, &schema(), &VersionSnapshot::default())
                .await,
            Err(ExtractionFailure::TooLarge { .. })
        ));

        let extractor = Extractor::new(sentence_client(), config());
        let empty = SourceDocument::new("empty", "eng", "\n\n   \n");
        assert!(matches!(
            extractor
                .extract(&empty, &schema(), &VersionSnapshot::default())
                .await,
            Err(ExtractionFailure::Empty { .. })
        ));
    }

    #[tokio::test]
    async fn base_versions_come_from_snapshot() {
        let extractor = Extractor::new(sentence_client(), config());
        let source = SourceDocument::new("S1", "eng", "Alice works on Apollo.");
        let mut versions = BTreeMap::new();
        versions.insert(EntityKey::normalize("Alice"), VersionToken(3));
        let package = extractor
            .extract(&source, &schema(), &VersionSnapshot::new(7, versions))
            .await
            .unwrap();
        assert_eq!(
            package.base_version(&EntityKey::normalize("alice")),
            VersionToken(3)
        );
        assert_eq!(package.base_versions.len(), 1);
    }
}
