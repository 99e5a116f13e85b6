//! Persisted records: commit results, dead letters, knowledge service records,
//! promotion decisions, and the audit events that announce them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{Gap, TripleDiagnostic};
use crate::types::{EntityKey, SourceId, VersionToken};

// ---------------------------------------------------------------------------
// Commits
// ---------------------------------------------------------------------------

/// A subject whose token moved since the package was extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConflict {
    pub entity: EntityKey,
    /// Token the package was extracted against.
    pub expected: VersionToken,
    /// Token currently in the store.
    pub actual: VersionToken,
}

/// Outcome of enqueueing one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommitResult {
    /// All triples applied; every subject's token bumped.
    Success {
        package_hash: String,
        revision: u64,
        versions: BTreeMap<EntityKey, VersionToken>,
        triples_applied: usize,
    },
    /// Nothing applied; at least one triple failed validation.
    SchemaRejected {
        package_hash: String,
        diagnostics: Vec<TripleDiagnostic>,
        attempts: u32,
        dead_lettered: bool,
    },
    /// Nothing applied; re-extract against the current tokens.
    Conflict {
        package_hash: String,
        conflicts: Vec<EntityConflict>,
    },
}

impl CommitResult {
    pub fn package_hash(&self) -> &str {
        match self {
            Self::Success { package_hash, .. }
            | Self::SchemaRejected { package_hash, .. }
            | Self::Conflict { package_hash, .. } => package_hash,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Short label for logs and diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::SchemaRejected { .. } => "schema_rejected",
            Self::Conflict { .. } => "conflict",
        }
    }
}

/// A package that kept failing schema validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub package_hash: String,
    pub source_id: SourceId,
    pub domain: String,
    pub attempts: u32,
    pub diagnostics: Vec<TripleDiagnostic>,
    pub dead_lettered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Knowledge service records
// ---------------------------------------------------------------------------

/// Identifier of a knowledge service (candidate or baseline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub Uuid);

impl ServiceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ServiceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle of a knowledge service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Candidate,
    Promoted,
    Retired,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Promoted => "promoted",
            Self::Retired => "retired",
        }
    }

    /// Whether `self → next` is an allowed transition.
    pub fn can_transition_to(&self, next: ServiceStatus) -> bool {
        matches!(
            (self, next),
            (Self::Candidate, Self::Promoted)
                | (Self::Candidate, Self::Retired)
                | (Self::Promoted, Self::Retired)
        )
    }
}

impl std::str::FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "candidate" => Ok(Self::Candidate),
            "promoted" => Ok(Self::Promoted),
            "retired" => Ok(Self::Retired),
            other => Err(format!("unknown service status: {other}")),
        }
    }
}

/// Store revisions a service was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRange {
    pub from: u64,
    pub to: u64,
}

/// One source document that fed a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLineage {
    pub source_id: SourceId,
    pub content_hash: String,
}

/// Created when an orchestrator run succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeServiceRecord {
    pub id: ServiceId,
    /// Domain / role this service fills.
    pub role_id: String,
    pub revisions: RevisionRange,
    pub test_suite_id: String,
    pub pass_rate: f64,
    pub completeness: f64,
    pub semantic_version: String,
    pub lineage: Vec<SourceLineage>,
    pub status: ServiceStatus,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Promotion
// ---------------------------------------------------------------------------

/// Share of production traffic routed to a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStage {
    /// 0%: baseline serves everything.
    Off,
    /// 10%.
    Canary,
    /// 50%.
    Half,
    /// 100%.
    Full,
}

impl RolloutStage {
    pub fn percent(&self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Canary => 10,
            Self::Half => 50,
            Self::Full => 100,
        }
    }

    /// The stage after this one, if any.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Off => Some(Self::Canary),
            Self::Canary => Some(Self::Half),
            Self::Half => Some(Self::Full),
            Self::Full => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Canary => "canary",
            Self::Half => "half",
            Self::Full => "full",
        }
    }
}

/// What a single evaluation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Advance one stage (or, at 100%, finalize the promotion).
    Promote,
    /// Keep the current split until the observation window elapses.
    Hold,
    /// Revert to 0% and retire the candidate.
    Rollback,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Promote => "promote",
            Self::Hold => "hold",
            Self::Rollback => "rollback",
        }
    }
}

/// Result of one A/B evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionDecision {
    pub id: Uuid,
    pub candidate_id: ServiceId,
    pub baseline_id: ServiceId,
    /// Candidate quality over baseline quality, in [0, 1].
    pub parity: f64,
    /// Stage in effect after this decision.
    pub stage: RolloutStage,
    pub decision: Decision,
    /// Whether this decision finalized the rollout (promoted or retired).
    pub terminal: bool,
    pub tasks_evaluated: usize,
    pub evaluator_id: String,
    pub decided_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Orchestrator diagnostics
// ---------------------------------------------------------------------------

/// Orchestrator run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Sourcing,
    Extracting,
    Committing,
    ScenarioGen,
    Validating,
    Refining,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// What happened to one source within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCycleReport {
    pub source_id: SourceId,
    /// `success`, `schema_rejected`, `conflict`, or `extraction_failed`.
    pub outcome: String,
    pub triples: usize,
    pub partial: bool,
    pub extraction_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Diagnostics archived for every validation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleDiagnostics {
    pub run_id: Uuid,
    pub domain: String,
    pub cycle: u32,
    /// Gaps this cycle was asked to close.
    pub focus: Vec<Gap>,
    pub sources: Vec<SourceCycleReport>,
    pub scenario_count: usize,
    pub predicate_coverage: f64,
    pub pass_rate: f64,
    pub completeness: f64,
    pub gate_met: bool,
    /// Gaps handed to the next cycle.
    pub gaps: Vec<Gap>,
    pub finished_at: DateTime<Utc>,
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No usable sources for the domain.
    NoSources,
    /// Cycle ceiling reached without meeting the gate.
    CycleCeiling,
    /// Cancellation observed at a cycle boundary.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Events on the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    CycleCompleted(CycleDiagnostics),
    RunSucceeded {
        run_id: Uuid,
        domain: String,
        service_id: ServiceId,
        cycles: u32,
    },
    RunFailed {
        run_id: Uuid,
        domain: String,
        reason: FailureReason,
        cycles: u32,
    },
    ServiceRecorded(KnowledgeServiceRecord),
    ServiceStatusChanged {
        service_id: ServiceId,
        from: ServiceStatus,
        to: ServiceStatus,
    },
    PackageDeadLettered {
        package_hash: String,
        source_id: SourceId,
        attempts: u32,
    },
    PromotionDecided(PromotionDecision),
}

impl AuditEvent {
    /// Stable kind label stored alongside the payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CycleCompleted(_) => "cycle_completed",
            Self::RunSucceeded { .. } => "run_succeeded",
            Self::RunFailed { .. } => "run_failed",
            Self::ServiceRecorded(_) => "service_recorded",
            Self::ServiceStatusChanged { .. } => "service_status_changed",
            Self::PackageDeadLettered { .. } => "package_dead_lettered",
            Self::PromotionDecided(_) => "promotion_decided",
        }
    }
}
