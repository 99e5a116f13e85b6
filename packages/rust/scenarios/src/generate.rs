//! Scenario synthesis from a subgraph, with the predicate-coverage loop.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, instrument};

use knowledgeforge_shared::{AnchorId, EntityKey, Query, ScenarioConfig, Subgraph, Triple};

use crate::manifest::CapabilityManifest;
use crate::{Expectation, Scenario, ScenarioKind, TestSuite};

/// Turns committed subgraphs into suites and manifests.
#[derive(Debug, Clone, Default)]
pub struct ScenarioGenerator {
    config: ScenarioConfig,
}

impl ScenarioGenerator {
    pub fn new(config: ScenarioConfig) -> Self {
        Self { config }
    }

    /// Build the suite and manifest for `subgraph`.
    ///
    /// The initial batch draws round-robin from recall, composition and
    /// negative candidates. Predicates still without a positive scenario then
    /// get a recall each, until coverage is complete or the ceiling is hit.
    #[instrument(skip_all, fields(domain = %subgraph.domain, triples = subgraph.triples.len()))]
    pub fn generate(&self, subgraph: &Subgraph) -> (TestSuite, CapabilityManifest) {
        let max = self.config.max_scenarios;
        let batch = self.config.initial_batch.min(max);

        let recalls = recall_candidates(subgraph);
        let compositions = composition_candidates(subgraph);
        let negatives = negative_candidates(subgraph, self.config.negatives_per_predicate);

        let mut queues: [VecDeque<Scenario>; 3] = [
            recalls.iter().cloned().collect(),
            compositions.into(),
            negatives.into(),
        ];
        let mut scenarios: Vec<Scenario> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        'batch: while scenarios.len() < batch {
            let mut progressed = false;
            for queue in queues.iter_mut() {
                if scenarios.len() >= batch {
                    break 'batch;
                }
                if let Some(scenario) = queue.pop_front() {
                    progressed = true;
                    if seen.insert(scenario.id.clone()) {
                        scenarios.push(scenario);
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        let initial = scenarios.len();
        let mut covered = covered(&scenarios);
        for predicate in subgraph.predicates() {
            if scenarios.len() >= max {
                break;
            }
            if covered.contains(&predicate) {
                continue;
            }
            let extra = recalls
                .iter()
                .find(|s| s.predicates == [predicate.clone()] && !seen.contains(&s.id));
            if let Some(extra) = extra {
                seen.insert(extra.id.clone());
                scenarios.push(extra.clone());
                covered.insert(predicate);
            }
        }

        let suite = TestSuite::new(&subgraph.domain, subgraph.revision, scenarios);
        let coverage = predicate_coverage(&suite, subgraph);
        debug!(
            initial,
            topped_up = suite.len() - initial,
            coverage,
            "scenario suite generated"
        );

        let manifest = CapabilityManifest::build(&suite, subgraph);
        (suite, manifest)
    }
}

/// Share of the subgraph's predicates exercised by a positive scenario.
/// An empty subgraph has no coverage.
pub fn predicate_coverage(suite: &TestSuite, subgraph: &Subgraph) -> f64 {
    let predicates = subgraph.predicates();
    if predicates.is_empty() {
        return 0.0;
    }
    let covered = suite.covered_predicates();
    let hit = predicates.iter().filter(|p| covered.contains(*p)).count();
    hit as f64 / predicates.len() as f64
}

fn covered(scenarios: &[Scenario]) -> BTreeSet<String> {
    scenarios
        .iter()
        .filter(|s| s.kind.is_positive())
        .flat_map(|s| s.predicates.iter().cloned())
        .collect()
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// Objects and anchors reached from `from` over `predicate`.
fn follow<'a>(
    subgraph: &'a Subgraph,
    from: &'a EntityKey,
    predicate: &'a str,
) -> impl Iterator<Item = &'a Triple> + 'a {
    subgraph.outgoing(from).filter(move |t| t.predicate == predicate)
}

/// One recall per distinct (subject, predicate), in subgraph order.
fn recall_candidates(subgraph: &Subgraph) -> Vec<Scenario> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for triple in &subgraph.triples {
        if !seen.insert((triple.subject.key.clone(), triple.predicate.clone())) {
            continue;
        }
        let hits: Vec<&Triple> = follow(subgraph, &triple.subject.key, &triple.predicate).collect();
        out.push(Scenario::new(
            ScenarioKind::DirectRecall,
            Query::recall(&triple.subject.name, &triple.predicate),
            Expectation::Known {
                objects: hits.iter().map(|t| t.object.key.clone()).collect(),
                provenance: hits.iter().map(|t| t.provenance.anchor.clone()).collect(),
            },
        ));
    }
    out
}

/// One composition per distinct (subject, first predicate, second predicate).
fn composition_candidates(subgraph: &Subgraph) -> Vec<Scenario> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for first in &subgraph.triples {
        for second in subgraph.outgoing(&first.object.key) {
            let path_key = (
                first.subject.key.clone(),
                first.predicate.clone(),
                second.predicate.clone(),
            );
            if !seen.insert(path_key) {
                continue;
            }

            let mut objects = BTreeSet::new();
            let mut provenance: BTreeSet<AnchorId> = BTreeSet::new();
            for hop in follow(subgraph, &first.subject.key, &first.predicate) {
                for end in follow(subgraph, &hop.object.key, &second.predicate) {
                    objects.insert(end.object.key.clone());
                    provenance.insert(hop.provenance.anchor.clone());
                    provenance.insert(end.provenance.anchor.clone());
                }
            }
            out.push(Scenario::new(
                ScenarioKind::InferredComposition,
                Query {
                    subject: first.subject.name.clone(),
                    path: vec![first.predicate.clone(), second.predicate.clone()],
                },
                Expectation::Known {
                    objects,
                    provenance,
                },
            ));
        }
    }
    out
}

/// Per predicate, entities known to the graph that lack it, topped up with
/// names the graph has never seen.
fn negative_candidates(subgraph: &Subgraph, per_predicate: usize) -> Vec<Scenario> {
    // First-seen display names.
    let mut names: BTreeMap<EntityKey, (usize, String)> = BTreeMap::new();
    for triple in &subgraph.triples {
        for entity in [&triple.subject, &triple.object] {
            let next = names.len();
            names
                .entry(entity.key.clone())
                .or_insert((next, entity.name.clone()));
        }
    }
    let mut ordered: Vec<(&EntityKey, &(usize, String))> = names.iter().collect();
    ordered.sort_by_key(|(_, (order, _))| *order);

    let mut out = Vec::new();
    for predicate in subgraph.predicates() {
        let mut picked = 0;
        for (key, (_, name)) in &ordered {
            if picked >= per_predicate {
                break;
            }
            if follow(subgraph, key, &predicate).next().is_none() {
                out.push(negative(name, &predicate));
                picked += 1;
            }
        }
        let mut n = 0;
        while picked < per_predicate {
            n += 1;
            let name = format!("unlisted {predicate} subject {n}");
            if subgraph.mentions(&EntityKey::normalize(&name)) {
                continue;
            }
            out.push(negative(&name, &predicate));
            picked += 1;
        }
    }
    out
}

fn negative(subject: &str, predicate: &str) -> Scenario {
    Scenario::new(
        ScenarioKind::NegativeBoundary,
        Query::recall(subject, predicate),
        Expectation::Unknown,
    )
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::Utc;
    use knowledgeforge_shared::{AnchorId, EntityRef, Provenance, SourceId, Subgraph, Triple};

    pub(crate) fn triple(s: (&str, &str), p: &str, o: (&str, &str), para: u32) -> Triple {
        let source = SourceId::from("S1");
        Triple {
            domain: "eng".into(),
            subject: EntityRef::new(s.0, s.1),
            predicate: p.into(),
            object: EntityRef::new(o.0, o.1),
            provenance: Provenance {
                anchor: AnchorId::new(&source, 1, para),
                source_id: source,
                extracted_at: Utc::now(),
                extractor_version: "test".into(),
                confidence: 0.9,
            },
        }
    }

    /// Alice and Bob work on Apollo, Apollo is part of Artemis, which
    /// precedes Orion.
    pub(crate) fn three_predicates() -> Subgraph {
        Subgraph::new(
            "eng",
            7,
            vec![
                triple(("Alice", "Person"), "worksOn", ("Apollo", "Project"), 1),
                triple(("Bob", "Person"), "worksOn", ("Apollo", "Project"), 1),
                triple(("Apollo", "Project"), "partOf", ("Artemis", "Program"), 2),
                triple(("Artemis", "Program"), "precedes", ("Orion", "Program"), 3),
            ],
        )
    }
}
