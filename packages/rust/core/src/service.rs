//! Knowledge services: anything that answers queries about a domain.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;

use knowledgeforge_shared::{AnchorId, Answer, EntityKey, Query, Result, ServiceId, Subgraph, Triple};

/// A deployable answerer for one role. Candidates and baselines alike.
#[async_trait]
pub trait KnowledgeService: Send + Sync {
    fn id(&self) -> ServiceId;

    async fn answer(&self, query: &Query) -> Result<Answer>;
}

/// Answers from a committed subgraph, citing the anchors of every triple on
/// a path that reaches an answer. Anything the graph does not hold is
/// [`Answer::Unknown`].
pub struct GraphKnowledgeService {
    id: ServiceId,
    subgraph: Subgraph,
}

impl GraphKnowledgeService {
    pub fn new(id: ServiceId, subgraph: Subgraph) -> Self {
        Self { id, subgraph }
    }

    pub fn subgraph(&self) -> &Subgraph {
        &self.subgraph
    }

    /// Follow `query.path` from the subject. Only triples on complete paths
    /// contribute provenance.
    pub fn resolve(&self, query: &Query) -> Answer {
        if query.path.is_empty() {
            return Answer::Unknown;
        }

        let mut frontier: HashSet<EntityKey> = HashSet::from([EntityKey::normalize(&query.subject)]);
        let mut steps: Vec<Vec<&Triple>> = Vec::with_capacity(query.path.len());
        for predicate in &query.path {
            let step: Vec<&Triple> = self
                .subgraph
                .triples
                .iter()
                .filter(|t| &t.predicate == predicate && frontier.contains(&t.subject.key))
                .collect();
            if step.is_empty() {
                return Answer::Unknown;
            }
            frontier = step.iter().map(|t| t.object.key.clone()).collect();
            steps.push(step);
        }

        // Walk back from the final hop, keeping only hops that lead somewhere.
        let mut provenance: BTreeSet<AnchorId> = BTreeSet::new();
        let mut reaching: HashSet<EntityKey> = HashSet::new();
        for (depth, step) in steps.iter().enumerate().rev() {
            let last = depth + 1 == steps.len();
            let mut next_reaching = HashSet::new();
            for triple in step {
                if last || reaching.contains(&triple.object.key) {
                    provenance.insert(triple.provenance.anchor.clone());
                    next_reaching.insert(triple.subject.key.clone());
                }
            }
            reaching = next_reaching;
        }

        let mut seen = HashSet::new();
        let objects: Vec<String> = steps
            .last()
            .map(|last| {
                last.iter()
                    .filter(|t| seen.insert(t.object.key.clone()))
                    .map(|t| t.object.name.clone())
                    .collect()
            })
            .unwrap_or_default();

        Answer::Known {
            objects,
            provenance: provenance.into_iter().collect(),
        }
    }
}

#[async_trait]
impl KnowledgeService for GraphKnowledgeService {
    fn id(&self) -> ServiceId {
        self.id
    }

    async fn answer(&self, query: &Query) -> Result<Answer> {
        Ok(self.resolve(query))
    }
}
