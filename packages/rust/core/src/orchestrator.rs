//! Extraction Orchestrator: the bounded state machine that drives one domain
//! from sources to a validated knowledge service.
//!
//! ```text
//! Sourcing → Extracting → Committing → ScenarioGen → Validating ─┬→ Succeeded
//!               ↑                                                ├→ Refining ─┐
//!               └────────────────────────────────────────────────┼────────────┘
//!                                                                └→ Failed
//! ```
//!
//! A run is sequential. Each cycle re-extracts every usable source against a
//! schema focused on the previous cycle's gaps, commits through the
//! [`WriteQueue`], regenerates the suite from the committed subgraph and
//! validates a freshly built service against it. The run ends on the first
//! cycle that meets the quality gate, or fails at the cycle ceiling.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use knowledgeforge_extractor::{ExtractionFailure, Extractor};
use knowledgeforge_scenarios::{CapabilityManifest, ScenarioGenerator, TestSuite, predicate_coverage};
use knowledgeforge_shared::{
    AuditEvent, CommitResult, CycleDiagnostics, DomainSchema, FailureReason, Gap,
    KnowledgePackage, KnowledgeServiceRecord, OrchestratorConfig, PackageStatus, Result,
    RevisionRange, RunState, ServiceId, ServiceStatus, SourceCycleReport, SourceDocument,
    SourceLineage,
};
use knowledgeforge_storage::Storage;

use crate::audit::AuditLog;
use crate::service::KnowledgeService;
use crate::validation::{
    CompletenessEstimator, GraphServiceBuilder, RelationCoverage, ServiceBuilder, run_suite,
    uncovered_gaps,
};
use crate::write_queue::WriteQueue;

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

/// One domain's run: its schema and candidate sources.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub schema: DomainSchema,
    pub sources: Vec<SourceDocument>,
}

impl RunRequest {
    pub fn new(schema: DomainSchema, sources: Vec<SourceDocument>) -> Self {
        Self { schema, sources }
    }

    pub fn domain(&self) -> &str {
        &self.schema.domain
    }
}

/// How a run ended.
pub enum RunOutcome {
    Succeeded {
        record: KnowledgeServiceRecord,
        suite: TestSuite,
        manifest: CapabilityManifest,
        service: Arc<dyn KnowledgeService>,
    },
    Failed {
        reason: FailureReason,
    },
}

impl std::fmt::Debug for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded { record, suite, .. } => f
                .debug_struct("Succeeded")
                .field("service", &record.id)
                .field("pass_rate", &record.pass_rate)
                .field("completeness", &record.completeness)
                .field("scenarios", &suite.len())
                .finish(),
            Self::Failed { reason } => f.debug_struct("Failed").field("reason", reason).finish(),
        }
    }
}

/// Everything a caller learns from a run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub domain: String,
    pub outcome: RunOutcome,
    /// Per-cycle diagnostics, in cycle order.
    pub cycles: Vec<CycleDiagnostics>,
    /// Every state entered, in order.
    pub states: Vec<RunState>,
    /// Sources refused at sourcing.
    pub skipped: Vec<SourceCycleReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, RunOutcome::Succeeded { .. })
    }

    pub fn record(&self) -> Option<&KnowledgeServiceRecord> {
        match &self.outcome {
            RunOutcome::Succeeded { record, .. } => Some(record),
            RunOutcome::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.outcome {
            RunOutcome::Failed { reason } => Some(reason),
            RunOutcome::Succeeded { .. } => None,
        }
    }
}

/// Progress callback for run status.
pub trait RunObserver: Send + Sync {
    /// Called on every state entry.
    fn state_changed(&self, run_id: Uuid, domain: &str, state: RunState);
    /// Called when a validation cycle's diagnostics are archived.
    fn cycle_finished(&self, diagnostics: &CycleDiagnostics);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl RunObserver for SilentObserver {
    fn state_changed(&self, _run_id: Uuid, _domain: &str, _state: RunState) {}
    fn cycle_finished(&self, _diagnostics: &CycleDiagnostics) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    extractor: Extractor,
    queue: Arc<WriteQueue>,
    storage: Arc<Storage>,
    audit: AuditLog,
    generator: ScenarioGenerator,
    builder: Arc<dyn ServiceBuilder>,
    estimator: Arc<dyn CompletenessEstimator>,
    observer: Arc<dyn RunObserver>,
    config: OrchestratorConfig,
}

/// Bookkeeping for one run in flight.
struct Run {
    id: Uuid,
    domain: String,
    states: Vec<RunState>,
    cycles: Vec<CycleDiagnostics>,
    skipped: Vec<SourceCycleReport>,
}

impl Orchestrator {
    pub fn new(
        extractor: Extractor,
        queue: Arc<WriteQueue>,
        storage: Arc<Storage>,
        audit: AuditLog,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            extractor,
            queue,
            storage,
            audit,
            generator: ScenarioGenerator::default(),
            builder: Arc::new(GraphServiceBuilder),
            estimator: Arc::new(RelationCoverage),
            observer: Arc::new(SilentObserver),
            config,
        }
    }

    pub fn with_scenario_generator(mut self, generator: ScenarioGenerator) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_service_builder(mut self, builder: Arc<dyn ServiceBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_completeness_estimator(mut self, estimator: Arc<dyn CompletenessEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn enter(&self, run: &mut Run, state: RunState) {
        debug!(run = %run.id, ?state, "entering state");
        run.states.push(state);
        self.observer.state_changed(run.id, &run.domain, state);
    }

    /// Drive `request` to `Succeeded` or `Failed`.
    ///
    /// `cancel` is honoured when entering `Validating` or `Refining`; work
    /// already in flight finishes and its result is dropped.
    #[instrument(skip_all, fields(domain = %request.domain(), sources = request.sources.len()))]
    pub async fn run(&self, request: RunRequest, cancel: CancellationToken) -> Result<RunReport> {
        let mut run = Run {
            id: Uuid::now_v7(),
            domain: request.domain().to_string(),
            states: Vec::new(),
            cycles: Vec::new(),
            skipped: Vec::new(),
        };
        info!(run = %run.id, "starting orchestrator run");

        // --- Sourcing ---
        self.enter(&mut run, RunState::Sourcing);
        let start_revision = self.storage.current_revision().await?;
        let mut usable: Vec<&SourceDocument> = Vec::new();
        for source in &request.sources {
            if source.domain != run.domain {
                continue;
            }
            if source.size_bytes() > self.config.max_source_bytes {
                warn!(source = %source.id, size = source.size_bytes(), "source over size limit, skipped");
                run.skipped.push(SourceCycleReport {
                    source_id: source.id.clone(),
                    outcome: "skipped".into(),
                    triples: 0,
                    partial: false,
                    extraction_attempts: 0,
                    detail: Some(format!(
                        "{} bytes exceeds limit of {}",
                        source.size_bytes(),
                        self.config.max_source_bytes
                    )),
                });
                continue;
            }
            usable.push(source);
        }
        if usable.is_empty() {
            return self.fail(run, FailureReason::NoSources).await;
        }
        self.queue.register_schema(&request.schema);

        let mut gaps: Vec<Gap> = Vec::new();
        for cycle in 1..=self.config.max_cycles {
            let schema = if gaps.is_empty() {
                request.schema.clone()
            } else {
                request.schema.augmented(&gaps)
            };

            // --- Extracting ---
            self.enter(&mut run, RunState::Extracting);
            let mut extracted = Vec::with_capacity(usable.len());
            for source in &usable {
                let snapshot = self.storage.version_snapshot().await?;
                let package = self.extractor.extract(source, &schema, &snapshot).await;
                extracted.push((*source, package));
            }

            // --- Committing ---
            self.enter(&mut run, RunState::Committing);
            let mut sources = run.skipped.clone();
            for (source, package) in extracted {
                sources.push(self.commit_source(source, &schema, package).await?);
            }

            // --- ScenarioGen ---
            self.enter(&mut run, RunState::ScenarioGen);
            let subgraph = self.storage.subgraph(&run.domain).await?;
            let (suite, manifest) = self.generator.generate(&subgraph);

            // --- Validating ---
            self.enter(&mut run, RunState::Validating);
            if cancel.is_cancelled() {
                info!(run = %run.id, cycle, "cancelled before validation");
                return self.fail(run, FailureReason::Cancelled).await;
            }
            let service_id = ServiceId::new();
            let service = self.builder.build(service_id, &subgraph);
            let result = run_suite(service.as_ref(), &suite).await;
            let pass_rate = result.pass_rate();
            let completeness = self.estimator.estimate(&request.schema, &subgraph);
            let gate_met = self.config.gate_met(pass_rate, completeness);

            let next_gaps: Vec<Gap> = result
                .gaps()
                .into_iter()
                .chain(uncovered_gaps(&request.schema, &subgraph))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();

            let diagnostics = CycleDiagnostics {
                run_id: run.id,
                domain: run.domain.clone(),
                cycle,
                focus: schema.focus.clone(),
                sources,
                scenario_count: suite.len(),
                predicate_coverage: predicate_coverage(&suite, &subgraph),
                pass_rate,
                completeness,
                gate_met,
                gaps: next_gaps.clone(),
                finished_at: Utc::now(),
            };
            info!(
                run = %run.id,
                cycle,
                pass_rate,
                completeness,
                gate_met,
                scenarios = suite.len(),
                gaps = next_gaps.len(),
                "validation cycle finished"
            );
            self.observer.cycle_finished(&diagnostics);
            self.audit
                .record(AuditEvent::CycleCompleted(diagnostics.clone()))
                .await?;
            run.cycles.push(diagnostics);

            if gate_met {
                let record = KnowledgeServiceRecord {
                    id: service_id,
                    role_id: run.domain.clone(),
                    revisions: RevisionRange {
                        from: start_revision,
                        to: subgraph.revision,
                    },
                    test_suite_id: suite.id.clone(),
                    pass_rate,
                    completeness,
                    semantic_version: format!(
                        "1.{}.0",
                        self.storage.count_service_records(&run.domain).await?
                    ),
                    lineage: usable
                        .iter()
                        .map(|s| SourceLineage {
                            source_id: s.id.clone(),
                            content_hash: s.content_hash.clone(),
                        })
                        .collect(),
                    status: ServiceStatus::Candidate,
                    created_at: Utc::now(),
                };
                return self.succeed(run, record, suite, manifest, service).await;
            }

            if cycle == self.config.max_cycles {
                break;
            }

            // --- Refining ---
            self.enter(&mut run, RunState::Refining);
            if cancel.is_cancelled() {
                info!(run = %run.id, cycle, "cancelled while refining");
                return self.fail(run, FailureReason::Cancelled).await;
            }
            gaps = next_gaps;
        }

        self.fail(run, FailureReason::CycleCeiling).await
    }

    /// Enqueue one extracted package, re-extracting on conflict until the
    /// retry budget runs out.
    async fn commit_source(
        &self,
        source: &SourceDocument,
        schema: &DomainSchema,
        extraction: std::result::Result<KnowledgePackage, ExtractionFailure>,
    ) -> Result<SourceCycleReport> {
        let mut attempts = 1;
        let mut package = match extraction {
            Ok(package) => package,
            Err(failure) => return Ok(extraction_failed(source, attempts, &failure)),
        };

        let mut retries = 0;
        loop {
            let result = self.queue.enqueue(&package).await?;
            if result.is_conflict() && retries < self.config.conflict_retry_budget {
                retries += 1;
                attempts += 1;
                debug!(source = %source.id, retries, "conflict, re-extracting against a fresh snapshot");
                let snapshot = self.storage.version_snapshot().await?;
                package = match self.extractor.extract(source, schema, &snapshot).await {
                    Ok(package) => package,
                    Err(failure) => return Ok(extraction_failed(source, attempts, &failure)),
                };
                continue;
            }
            if result.is_conflict() {
                warn!(source = %source.id, retries, "conflict retry budget exhausted");
            }
            return Ok(commit_report(source, &package, &result, attempts, retries));
        }
    }

    async fn succeed(
        &self,
        mut run: Run,
        record: KnowledgeServiceRecord,
        suite: TestSuite,
        manifest: CapabilityManifest,
        service: Arc<dyn KnowledgeService>,
    ) -> Result<RunReport> {
        self.storage.insert_service_record(&record).await?;
        self.audit
            .record(AuditEvent::ServiceRecorded(record.clone()))
            .await?;
        self.audit
            .record(AuditEvent::RunSucceeded {
                run_id: run.id,
                domain: run.domain.clone(),
                service_id: record.id,
                cycles: run.cycles.len() as u32,
            })
            .await?;
        self.enter(&mut run, RunState::Succeeded);
        info!(
            run = %run.id,
            service = %record.id,
            version = %record.semantic_version,
            "run succeeded"
        );

        Ok(RunReport {
            run_id: run.id,
            domain: run.domain,
            outcome: RunOutcome::Succeeded {
                record,
                suite,
                manifest,
                service,
            },
            cycles: run.cycles,
            states: run.states,
            skipped: run.skipped,
        })
    }

    async fn fail(&self, mut run: Run, reason: FailureReason) -> Result<RunReport> {
        self.audit
            .record(AuditEvent::RunFailed {
                run_id: run.id,
                domain: run.domain.clone(),
                reason: reason.clone(),
                cycles: run.cycles.len() as u32,
            })
            .await?;
        self.enter(&mut run, RunState::Failed);
        warn!(run = %run.id, ?reason, cycles = run.cycles.len(), "run failed");

        Ok(RunReport {
            run_id: run.id,
            domain: run.domain,
            outcome: RunOutcome::Failed { reason },
            cycles: run.cycles,
            states: run.states,
            skipped: run.skipped,
        })
    }
}

fn extraction_failed(
    source: &SourceDocument,
    attempts: u32,
    failure: &ExtractionFailure,
) -> SourceCycleReport {
    warn!(source = %source.id, error = %failure, "extraction failed");
    SourceCycleReport {
        source_id: source.id.clone(),
        outcome: "extraction_failed".into(),
        triples: 0,
        partial: false,
        extraction_attempts: attempts,
        detail: Some(failure.to_string()),
    }
}

fn commit_report(
    source: &SourceDocument,
    package: &KnowledgePackage,
    result: &CommitResult,
    attempts: u32,
    retries: u32,
) -> SourceCycleReport {
    let detail = match result {
        CommitResult::Success { .. } if package.failed_units.is_empty() => None,
        CommitResult::Success { .. } => Some(format!(
            "{} of {} units failed",
            package.failed_units.len(),
            package.anchors.len()
        )),
        CommitResult::SchemaRejected {
            diagnostics,
            attempts,
            dead_lettered,
            ..
        } => Some(format!(
            "{} triples rejected (rejection {attempts}{})",
            diagnostics.len(),
            if *dead_lettered { ", dead-lettered" } else { "" }
        )),
        CommitResult::Conflict { conflicts, .. } => Some(format!(
            "escalated after {retries} re-extractions: {}",
            conflicts
                .iter()
                .map(|c| format!("{} expected {} found {}", c.entity, c.expected, c.actual))
                .collect::<Vec<_>>()
                .join("; ")
        )),
    };
    SourceCycleReport {
        source_id: source.id.clone(),
        outcome: result.label().into(),
        triples: match result {
            CommitResult::Success {
                triples_applied, ..
            } => *triples_applied,
            _ => 0,
        },
        partial: package.status == PackageStatus::Partial,
        extraction_attempts: attempts,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{eng_schema_of, harness, source};
    use knowledgeforge_shared::{GapKind, RelationType, Subgraph};
    use std::sync::Mutex;

    /// Completeness fixed per test; the suite decides the pass rate.
    struct FixedCompleteness(f64);

    impl CompletenessEstimator for FixedCompleteness {
        fn estimate(&self, _schema: &DomainSchema, _subgraph: &Subgraph) -> f64 {
            self.0
        }
    }

    /// Serves from the graph but forgets every `forgotten` object, failing
    /// a chosen share of recalls.
    struct ForgetfulBuilder {
        forgotten: Vec<&'static str>,
    }

    impl ServiceBuilder for ForgetfulBuilder {
        fn build(&self, id: ServiceId, subgraph: &Subgraph) -> Arc<dyn KnowledgeService> {
            let mut pruned = subgraph.clone();
            pruned
                .triples
                .retain(|t| !self.forgotten.contains(&t.object.name.as_str()));
            GraphServiceBuilder.build(id, &pruned)
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<RunState>>);

    impl RunObserver for Recorder {
        fn state_changed(&self, _run_id: Uuid, _domain: &str, state: RunState) {
            self.0.lock().unwrap().push(state);
        }
        fn cycle_finished(&self, _diagnostics: &CycleDiagnostics) {}
    }

    const DOC: &str = "Alice works on Apollo.\n\nBob works on Zephyr.\n\nApollo is part of Artemis.";

    #[tokio::test]
    async fn succeeds_on_first_cycle_when_gate_met() {
        let h = harness().await;
        let recorder = Arc::new(Recorder::default());
        let orchestrator = h.orchestrator().with_observer(recorder.clone());
        let schema = eng_schema_of(&["worksOn", "partOf"]);

        let report = orchestrator
            .run(
                RunRequest::new(schema, vec![source("S1", DOC)]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.succeeded(), "{report:?}");
        assert_eq!(report.cycles.len(), 1);
        assert_eq!(
            report.states,
            vec![
                RunState::Sourcing,
                RunState::Extracting,
                RunState::Committing,
                RunState::ScenarioGen,
                RunState::Validating,
                RunState::Succeeded,
            ]
        );
        assert_eq!(*recorder.0.lock().unwrap(), report.states);

        let record = report.record().unwrap();
        assert_eq!(record.semantic_version, "1.0.0");
        assert_eq!(record.revisions, RevisionRange { from: 0, to: 1 });
        assert_eq!(record.lineage.len(), 1);
        let stored = h.storage.get_service_record(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServiceStatus::Candidate);
        assert_eq!(h.storage.count_audit_events("run_succeeded").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn gate_needs_both_pass_rate_and_completeness() {
        let cases = [(0.92, true), (0.80, false)];
        for (completeness, expect_success) in cases {
            let h = harness().await;
            let orchestrator = h
                .orchestrator()
                .with_completeness_estimator(Arc::new(FixedCompleteness(completeness)));
            let report = orchestrator
                .run(
                    RunRequest::new(eng_schema_of(&["worksOn", "partOf"]), vec![source("S1", DOC)]),
                    CancellationToken::new(),
                )
                .await
                .unwrap();
            assert_eq!(report.succeeded(), expect_success, "completeness {completeness}");
        }
    }

    #[tokio::test]
    async fn failing_pass_rate_runs_to_the_ceiling() {
        let h = harness().await;
        let orchestrator = h
            .orchestrator()
            .with_service_builder(Arc::new(ForgetfulBuilder {
                forgotten: vec!["Zephyr"],
            }))
            .with_completeness_estimator(Arc::new(FixedCompleteness(0.92)));

        let report = orchestrator
            .run(
                RunRequest::new(eng_schema_of(&["worksOn", "partOf"]), vec![source("S1", DOC)]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.failure(), Some(&FailureReason::CycleCeiling));
        let cycles: Vec<u32> = report.cycles.iter().map(|c| c.cycle).collect();
        assert_eq!(cycles, vec![1, 2, 3, 4, 5]);
        assert!(report.cycles.iter().all(|c| c.pass_rate < 0.95 && !c.gate_met));
        assert_eq!(report.states.last(), Some(&RunState::Failed));
        assert_eq!(
            report.states.iter().filter(|s| **s == RunState::Refining).count(),
            4
        );
        // Later cycles focus extraction on the failed predicate.
        assert!(
            report.cycles[1]
                .focus
                .iter()
                .any(|g| g.predicate == "worksOn" && g.kind == GapKind::FailedRecall)
        );
        assert_eq!(h.storage.count_service_records("eng").await.unwrap(), 0);
        assert_eq!(h.storage.count_audit_events("cycle_completed").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn uncovered_relations_become_gaps() {
        let h = harness().await;
        let schema = DomainSchema::new(
            "eng",
            vec![
                RelationType::new("worksOn", "Person", "Project"),
                RelationType::new("partOf", "Project", "Program"),
                RelationType::new("precedes", "Program", "Program"),
            ],
        );
        let report = h
            .orchestrator()
            .run(RunRequest::new(schema, vec![source("S1", DOC)]), CancellationToken::new())
            .await
            .unwrap();

        // Two of three relations committed: completeness stays below 90%.
        assert!(!report.succeeded());
        let first = &report.cycles[0];
        assert!((first.completeness - 2.0 / 3.0).abs() < 1e-9);
        assert!(first.gaps.contains(&Gap {
            predicate: "precedes".into(),
            kind: GapKind::Uncovered,
        }));
    }

    #[tokio::test]
    async fn no_usable_sources_fails_immediately() {
        let h = harness().await;
        let report = h
            .orchestrator()
            .run(
                RunRequest::new(
                    eng_schema_of(&["worksOn"]),
                    vec![SourceDocument::new("F1", "finance", "Alice works on Apollo.")],
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.failure(), Some(&FailureReason::NoSources));
        assert!(report.cycles.is_empty());
        assert_eq!(report.states, vec![RunState::Sourcing, RunState::Failed]);
    }

    #[tokio::test]
    async fn oversize_sources_are_reported_as_skipped() {
        let h = harness().await;
        let mut orchestrator = h.orchestrator();
        orchestrator.config.max_source_bytes = 128;
        let big = "Alice works on Apollo.\n\n".repeat(10);
        let report = orchestrator
            .run(
                RunRequest::new(
                    eng_schema_of(&["worksOn", "partOf"]),
                    vec![source("BIG", &big), source("S1", DOC)],
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].outcome, "skipped");
        assert_eq!(report.cycles[0].sources[0].source_id.0, "BIG");
    }

    #[tokio::test]
    async fn cancellation_is_observed_at_validation() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h
            .orchestrator()
            .run(
                RunRequest::new(eng_schema_of(&["worksOn", "partOf"]), vec![source("S1", DOC)]),
                cancel,
            )
            .await
            .unwrap();
        assert_eq!(report.failure(), Some(&FailureReason::Cancelled));
        assert!(report.cycles.is_empty());
        assert_eq!(report.states.last(), Some(&RunState::Failed));
        // Commits that finished before the check stay committed.
        assert_eq!(h.storage.triple_count("eng").await.unwrap(), 3);
    }

    /// Cancels the run once the first cycle is archived.
    struct CancelAfterCycle(CancellationToken);

    impl RunObserver for CancelAfterCycle {
        fn state_changed(&self, _run_id: Uuid, _domain: &str, _state: RunState) {}
        fn cycle_finished(&self, _diagnostics: &CycleDiagnostics) {
            self.0.cancel();
        }
    }

    #[tokio::test]
    async fn cancellation_is_observed_while_refining() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        let orchestrator = h
            .orchestrator()
            .with_service_builder(Arc::new(ForgetfulBuilder {
                forgotten: vec!["Zephyr"],
            }))
            .with_observer(Arc::new(CancelAfterCycle(cancel.clone())));

        let report = orchestrator
            .run(
                RunRequest::new(eng_schema_of(&["worksOn", "partOf"]), vec![source("S1", DOC)]),
                cancel,
            )
            .await
            .unwrap();

        assert_eq!(report.failure(), Some(&FailureReason::Cancelled));
        assert_eq!(report.cycles.len(), 1);
        assert!(!report.cycles[0].gate_met);
        assert_eq!(
            &report.states[report.states.len() - 2..],
            &[RunState::Refining, RunState::Failed]
        );
        assert_eq!(h.storage.count_audit_events("cycle_completed").await.unwrap(), 1);
        assert_eq!(h.storage.count_service_records("eng").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unreachable_reasoning_is_reported_per_source() {
        let h = harness().await;
        let report = h
            .orchestrator()
            .run(
                RunRequest::new(
                    eng_schema_of(&["worksOn"]),
                    vec![source("S1", "FAIL everywhere.")],
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.failure(), Some(&FailureReason::CycleCeiling));
        let first = &report.cycles[0].sources[0];
        assert_eq!(first.outcome, "extraction_failed");
        assert!(first.detail.as_deref().unwrap().contains("reasoning unavailable"));
    }
}
