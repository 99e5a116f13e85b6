//! Capability manifest: the operations a knowledge service exposes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use knowledgeforge_shared::{Result, Subgraph};

use crate::TestSuite;

/// Bumped when the manifest layout changes incompatibly.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// One query operation, one per observed predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// `query_<predicate>`.
    pub name: String,
    pub predicate: String,
    /// Field name to entity type, e.g. `subject: Person`.
    pub input: BTreeMap<String, String>,
    pub output: BTreeMap<String, String>,
    /// Scenarios exercising this operation.
    pub scenario_ids: Vec<String>,
}

/// Machine-readable description of a knowledge service's surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    pub schema_version: u32,
    pub domain: String,
    pub revision: u64,
    pub suite_id: String,
    pub operations: Vec<Operation>,
}

impl CapabilityManifest {
    /// Derive the manifest from a generated suite and the subgraph it covers.
    pub fn build(suite: &TestSuite, subgraph: &Subgraph) -> Self {
        let operations = subgraph
            .predicates()
            .into_iter()
            .filter_map(|predicate| {
                let sample = subgraph.triples.iter().find(|t| t.predicate == predicate)?;
                let scenario_ids = suite
                    .scenarios
                    .iter()
                    .filter(|s| s.predicates.contains(&predicate))
                    .map(|s| s.id.clone())
                    .collect();
                Some(Operation {
                    name: format!("query_{predicate}"),
                    input: BTreeMap::from([("subject".to_string(), sample.subject.entity_type.clone())]),
                    output: BTreeMap::from([
                        ("object".to_string(), sample.object.entity_type.clone()),
                        ("provenance".to_string(), "anchor[]".to_string()),
                    ]),
                    predicate,
                    scenario_ids,
                })
            })
            .collect();

        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            domain: subgraph.domain.clone(),
            revision: subgraph.revision,
            suite_id: suite.id.clone(),
            operations,
        }
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.name == name)
    }

    /// Pretty JSON for deployment tooling.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::fixtures::{three_predicates, triple};
    use crate::{ScenarioGenerator, ScenarioKind};

    #[test]
    fn one_operation_per_predicate_with_linked_scenarios() {
        let graph = three_predicates();
        let (suite, manifest) = ScenarioGenerator::default().generate(&graph);

        assert_eq!(manifest.suite_id, suite.id);
        let names: Vec<&str> = manifest.operations.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["query_partOf", "query_precedes", "query_worksOn"]);

        let works = manifest.operation("query_worksOn").unwrap();
        assert_eq!(works.input["subject"], "Person");
        assert_eq!(works.output["object"], "Project");
        for id in &works.scenario_ids {
            let scenario = suite.scenarios.iter().find(|s| &s.id == id).unwrap();
            assert!(scenario.predicates.contains(&"worksOn".to_string()));
        }
        assert!(
            works
                .scenario_ids
                .iter()
                .any(|id| id.starts_with("recall-"))
        );
    }

    #[test]
    fn single_predicate_graph_has_one_operation_family() {
        let graph = Subgraph::new(
            "eng",
            2,
            vec![
                triple(("Alice", "Person"), "worksOn", ("Apollo", "Project"), 1),
                triple(("Bob", "Person"), "worksOn", ("Zephyr", "Project"), 2),
            ],
        );
        let (suite, manifest) = ScenarioGenerator::default().generate(&graph);
        assert_eq!(manifest.operations.len(), 1);
        assert_eq!(manifest.operations[0].name, "query_worksOn");
        assert_eq!(
            manifest.operations[0].scenario_ids.len(),
            suite.len(),
            "every scenario exercises worksOn"
        );
        assert!(suite.count(ScenarioKind::DirectRecall) >= 2);
    }

    #[test]
    fn manifest_serializes_for_deployment() {
        let (_, manifest) = ScenarioGenerator::default().generate(&three_predicates());
        let json = manifest.to_json().unwrap();
        let back: CapabilityManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
        assert!(json.contains("\"schema_version\": 1"));
    }
}
