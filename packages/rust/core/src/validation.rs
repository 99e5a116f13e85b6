//! Validation seams: how a candidate service is built from a subgraph, how
//! complete a domain is, and how a suite is run against a service.

use std::sync::Arc;

use tracing::debug;

use knowledgeforge_scenarios::{SuiteResult, TestSuite};
use knowledgeforge_shared::{DomainSchema, Gap, GapKind, ServiceId, Subgraph};

use crate::service::{GraphKnowledgeService, KnowledgeService};

/// Builds the service a validation cycle tests.
pub trait ServiceBuilder: Send + Sync {
    fn build(&self, id: ServiceId, subgraph: &Subgraph) -> Arc<dyn KnowledgeService>;
}

/// Serves straight from the committed subgraph.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphServiceBuilder;

impl ServiceBuilder for GraphServiceBuilder {
    fn build(&self, id: ServiceId, subgraph: &Subgraph) -> Arc<dyn KnowledgeService> {
        Arc::new(GraphKnowledgeService::new(id, subgraph.clone()))
    }
}

/// Estimates how much of the schema a subgraph covers, in [0, 1].
pub trait CompletenessEstimator: Send + Sync {
    fn estimate(&self, schema: &DomainSchema, subgraph: &Subgraph) -> f64;
}

/// Fraction of schema relation types with at least one committed triple.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelationCoverage;

impl CompletenessEstimator for RelationCoverage {
    fn estimate(&self, schema: &DomainSchema, subgraph: &Subgraph) -> f64 {
        if schema.relations.is_empty() {
            return 0.0;
        }
        let present = subgraph.predicates();
        let covered = schema
            .relations
            .iter()
            .filter(|r| present.contains(&r.predicate))
            .count();
        covered as f64 / schema.relations.len() as f64
    }
}

/// Schema relations with nothing committed yet.
pub fn uncovered_gaps(schema: &DomainSchema, subgraph: &Subgraph) -> Vec<Gap> {
    let present = subgraph.predicates();
    schema
        .relations
        .iter()
        .filter(|r| !present.contains(&r.predicate))
        .map(|r| Gap {
            predicate: r.predicate.clone(),
            kind: GapKind::Uncovered,
        })
        .collect()
}

/// Run every scenario of `suite` against `service`, in order.
pub async fn run_suite(service: &dyn KnowledgeService, suite: &TestSuite) -> SuiteResult {
    let mut result = SuiteResult::new(suite);
    for scenario in &suite.scenarios {
        match service.answer(&scenario.query).await {
            Ok(answer) => result.record(scenario, &answer),
            Err(e) => result.record_error(scenario, e),
        }
    }
    debug!(
        suite = %suite.id,
        passed = result.passed,
        total = result.total,
        "suite run finished"
    );
    result
}
