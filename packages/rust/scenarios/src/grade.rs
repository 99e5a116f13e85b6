//! Suite results and the gaps they point at.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use knowledgeforge_shared::{Answer, Gap, GapKind};

use crate::{Scenario, ScenarioKind, TestSuite};

/// A scenario the service got wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioFailure {
    pub scenario_id: String,
    pub kind: ScenarioKind,
    pub predicates: Vec<String>,
    pub reason: String,
}

/// Tally of one suite run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub suite_id: String,
    pub total: usize,
    pub passed: usize,
    pub failures: Vec<ScenarioFailure>,
}

impl SuiteResult {
    pub fn new(suite: &TestSuite) -> Self {
        Self {
            suite_id: suite.id.clone(),
            total: 0,
            passed: 0,
            failures: Vec::new(),
        }
    }

    /// Grade `answer` against `scenario` and tally it.
    pub fn record(&mut self, scenario: &Scenario, answer: &Answer) {
        self.total += 1;
        match scenario.check(answer) {
            Ok(()) => self.passed += 1,
            Err(reason) => self.failures.push(ScenarioFailure {
                scenario_id: scenario.id.clone(),
                kind: scenario.kind,
                predicates: scenario.predicates.clone(),
                reason,
            }),
        }
    }

    /// Tally a scenario the service could not answer at all.
    pub fn record_error(&mut self, scenario: &Scenario, error: impl std::fmt::Display) {
        self.total += 1;
        self.failures.push(ScenarioFailure {
            scenario_id: scenario.id.clone(),
            kind: scenario.kind,
            predicates: scenario.predicates.clone(),
            reason: format!("service error: {error}"),
        });
    }

    /// Passed over total; an empty run passes nothing.
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }

    /// Predicates to refocus extraction on, derived from the failures.
    pub fn gaps(&self) -> Vec<Gap> {
        let mut gaps = BTreeSet::new();
        for failure in &self.failures {
            let kind = match failure.kind {
                ScenarioKind::DirectRecall => GapKind::FailedRecall,
                ScenarioKind::InferredComposition => GapKind::FailedComposition,
                ScenarioKind::NegativeBoundary => GapKind::Fabrication,
            };
            for predicate in &failure.predicates {
                gaps.insert(Gap {
                    predicate: predicate.clone(),
                    kind,
                });
            }
        }
        gaps.into_iter().collect()
    }
}
