//! Shared types, error model, and configuration for KnowledgeForge.
//!
//! This crate is the foundation depended on by all other KnowledgeForge crates.
//! It provides:
//! - [`KnowledgeForgeError`], the unified error type
//! - Graph and package types ([`Triple`], [`KnowledgePackage`], [`DomainSchema`])
//! - Persisted records ([`CommitResult`], [`KnowledgeServiceRecord`], [`AuditEvent`])
//! - Configuration ([`AppConfig`] and the runtime configs derived from it)

pub mod config;
pub mod error;
pub mod package;
pub mod records;
pub mod schema;
pub mod telemetry;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CallPolicy, ExtractorConfig, LogFormat, LoggingConfig, OrchestratorConfig,
    QueueConfig, RolloutPolicy, ScenarioConfig, StorageConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from, validate_api_key, validate_config,
};
pub use error::{KnowledgeForgeError, Result};
pub use package::{
    Anchor, Frame, FrameSlot, KnowledgePackage, PackageId, PackageStatus, TypedEntity,
    TypedRelation, UnitFailure,
};
pub use records::{
    AuditEvent, CommitResult, CycleDiagnostics, DeadLetter, Decision, EntityConflict,
    FailureReason, KnowledgeServiceRecord, PromotionDecision, RevisionRange, RolloutStage,
    RunState, ServiceId, ServiceStatus, SourceCycleReport, SourceLineage,
};
pub use schema::{
    DomainSchema, Gap, GapKind, RelationType, SchemaFragment, TripleDiagnostic, Violation,
};
pub use telemetry::init_tracing;
pub use types::{
    AnchorId, Answer, EntityKey, EntityRef, Provenance, Query, SourceDocument, SourceId,
    Subgraph, Triple, VersionSnapshot, VersionToken, sha256_hex,
};
