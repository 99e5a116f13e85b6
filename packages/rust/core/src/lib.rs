//! Core pipeline orchestration for KnowledgeForge.
//!
//! This crate ties the extractor, the knowledge store and the scenario
//! generator together into end-to-end workflows:
//! - [`write_queue::WriteQueue`], the only path packages take into the store
//! - [`orchestrator::Orchestrator`], the bounded extract/validate/refine loop
//! - [`promotion::PromotionEngine`], staged rollout of validated services
//! - [`fleet::Fleet`], concurrent runs across domains
//! - [`audit::AuditLog`], persisted and broadcast pipeline events

pub mod audit;
pub mod fleet;
pub mod orchestrator;
pub mod promotion;
pub mod service;
pub mod validation;
pub mod write_queue;

pub use audit::AuditLog;
pub use fleet::{Deployment, Fleet, FleetRun};
pub use orchestrator::{
    Orchestrator, RunObserver, RunOutcome, RunReport, RunRequest, SilentObserver,
};
pub use promotion::{
    EvalTask, PromotionEngine, QualityRubric, ReferenceMatch, Split, TrafficRouter, parity,
    tasks_from_suite,
};
pub use service::{GraphKnowledgeService, KnowledgeService};
pub use validation::{
    CompletenessEstimator, GraphServiceBuilder, RelationCoverage, ServiceBuilder, run_suite,
};
pub use write_queue::WriteQueue;
