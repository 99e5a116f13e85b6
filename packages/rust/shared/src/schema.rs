//! Domain schemas: which entity and relation types a domain admits, and the
//! per-triple checks the write path enforces.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{Triple, sha256_hex};

/// A relation the domain admits: `subject_type --predicate--> object_type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationType {
    pub predicate: String,
    pub subject_type: String,
    pub object_type: String,
}

impl RelationType {
    pub fn new(
        predicate: impl Into<String>,
        subject_type: impl Into<String>,
        object_type: impl Into<String>,
    ) -> Self {
        Self {
            predicate: predicate.into(),
            subject_type: subject_type.into(),
            object_type: object_type.into(),
        }
    }
}

/// Why a region of the domain needs another extraction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    /// Schema relation with no committed triple.
    Uncovered,
    /// A recall scenario for this predicate failed.
    FailedRecall,
    /// A composition scenario through this predicate failed.
    FailedComposition,
    /// The service answered where it should have said "unknown".
    Fabrication,
}

/// A gap carried from one validation cycle into the next.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gap {
    pub predicate: String,
    pub kind: GapKind,
}

/// Target entity/relation types for one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSchema {
    pub domain: String,
    pub entity_types: BTreeSet<String>,
    pub relations: Vec<RelationType>,
    /// Predicates the next extraction should concentrate on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub focus: Vec<Gap>,
}

/// The slice of a schema sent along with a reasoning request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaFragment {
    pub entity_types: Vec<String>,
    pub relations: Vec<RelationType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub focus_predicates: Vec<String>,
}

impl DomainSchema {
    /// Build a schema; entity types are derived from the relation endpoints.
    pub fn new(domain: impl Into<String>, relations: Vec<RelationType>) -> Self {
        let entity_types = relations
            .iter()
            .flat_map(|r| [r.subject_type.clone(), r.object_type.clone()])
            .collect();
        Self {
            domain: domain.into(),
            entity_types,
            relations,
            focus: Vec::new(),
        }
    }

    pub fn relation(&self, predicate: &str) -> Option<&RelationType> {
        self.relations.iter().find(|r| r.predicate == predicate)
    }

    /// Whether `subject_type --predicate--> object_type` is admitted.
    pub fn admits(&self, subject_type: &str, predicate: &str, object_type: &str) -> bool {
        self.relation(predicate)
            .is_some_and(|r| r.subject_type == subject_type && r.object_type == object_type)
    }

    /// A copy of this schema focused on `gaps`. Gaps on unknown predicates are ignored.
    pub fn augmented(&self, gaps: &[Gap]) -> Self {
        let mut focus: BTreeSet<Gap> = BTreeSet::new();
        for gap in gaps {
            if self.relation(&gap.predicate).is_some() {
                focus.insert(gap.clone());
            }
        }
        Self {
            focus: focus.into_iter().collect(),
            ..self.clone()
        }
    }

    /// Distinct focus predicates, sorted.
    pub fn focus_predicates(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.focus.iter().map(|g| g.predicate.as_str()).collect();
        set.into_iter().map(String::from).collect()
    }

    pub fn fragment(&self) -> SchemaFragment {
        SchemaFragment {
            entity_types: self.entity_types.iter().cloned().collect(),
            relations: self.relations.clone(),
            focus_predicates: self.focus_predicates(),
        }
    }

    /// Stable fingerprint of the admitted types (focus excluded).
    pub fn fingerprint(&self) -> String {
        let mut relations = self.relations.clone();
        relations.sort();
        let body = relations
            .iter()
            .map(|r| format!("{}:{}>{}", r.subject_type, r.predicate, r.object_type))
            .collect::<Vec<_>>()
            .join(";");
        sha256_hex(format!("{}|{body}", self.domain).as_bytes())
    }

    /// Schema-level checks on one triple. Grounding against L0 anchors needs
    /// the owning package and is checked by the write path.
    pub fn check_triple(&self, triple: &Triple) -> Vec<Violation> {
        let mut violations = Vec::new();

        if triple.domain != self.domain {
            violations.push(Violation::DomainMismatch {
                expected: self.domain.clone(),
                found: triple.domain.clone(),
            });
        }

        match self.relation(&triple.predicate) {
            None => violations.push(Violation::UnknownPredicate(triple.predicate.clone())),
            Some(rel) => {
                if rel.subject_type != triple.subject.entity_type {
                    violations.push(Violation::SubjectType {
                        expected: rel.subject_type.clone(),
                        found: triple.subject.entity_type.clone(),
                    });
                }
                if rel.object_type != triple.object.entity_type {
                    violations.push(Violation::ObjectType {
                        expected: rel.object_type.clone(),
                        found: triple.object.entity_type.clone(),
                    });
                }
            }
        }

        if triple.subject.key.is_empty() || triple.object.key.is_empty() {
            violations.push(Violation::EmptyEntity);
        }

        let confidence = triple.provenance.confidence;
        if !(0.0..=1.0).contains(&confidence) || confidence.is_nan() {
            violations.push(Violation::ConfidenceOutOfRange(confidence));
        }

        let prov = &triple.provenance;
        if prov.source_id.0.trim().is_empty() {
            violations.push(Violation::MissingProvenance("source_id".into()));
        }
        if prov.anchor.0.trim().is_empty() {
            violations.push(Violation::MissingProvenance("anchor".into()));
        }
        if prov.extractor_version.trim().is_empty() {
            violations.push(Violation::MissingProvenance("extractor_version".into()));
        }

        violations
    }
}

/// One reason a triple was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "violation", content = "detail", rename_all = "snake_case")]
pub enum Violation {
    DomainMismatch { expected: String, found: String },
    UnknownPredicate(String),
    SubjectType { expected: String, found: String },
    ObjectType { expected: String, found: String },
    EmptyEntity,
    ConfidenceOutOfRange(f64),
    MissingProvenance(String),
    Ungrounded { anchor: String },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DomainMismatch { expected, found } => {
                write!(f, "domain {found} does not match schema domain {expected}")
            }
            Self::UnknownPredicate(p) => write!(f, "predicate {p} is not in the schema"),
            Self::SubjectType { expected, found } => {
                write!(f, "subject type {found}, schema expects {expected}")
            }
            Self::ObjectType { expected, found } => {
                write!(f, "object type {found}, schema expects {expected}")
            }
            Self::EmptyEntity => f.write_str("subject or object normalizes to an empty name"),
            Self::ConfidenceOutOfRange(c) => write!(f, "confidence {c} outside [0, 1]"),
            Self::MissingProvenance(field) => write!(f, "provenance is missing {field}"),
            Self::Ungrounded { anchor } => {
                write!(f, "anchor {anchor} does not resolve to an L0 unit")
            }
        }
    }
}

/// Diagnostics for one rejected triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleDiagnostic {
    /// Index into the package's L3 triples.
    pub index: usize,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub violations: Vec<Violation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnchorId, EntityRef, Provenance, SourceId};
    use chrono::Utc;

    fn schema() -> DomainSchema {
        DomainSchema::new(
            "eng",
            vec![
                RelationType::new("worksOn", "Person", "Project"),
                RelationType::new("partOf", "Project", "Program"),
            ],
        )
    }

    fn triple(predicate: &str, subject_type: &str) -> Triple {
        Triple {
            domain: "eng".into(),
            subject: EntityRef::new("Alice", subject_type),
            predicate: predicate.into(),
            object: EntityRef::new("Apollo", "Project"),
            provenance: Provenance {
                source_id: SourceId::from("S1"),
                anchor: AnchorId("S1#s1.p1".into()),
                extracted_at: Utc::now(),
                extractor_version: "test".into(),
                confidence: 0.9,
            },
        }
    }

    #[test]
    fn entity_types_derived_from_relations() {
        let s = schema();
        assert_eq!(s.entity_types.len(), 3);
        assert!(s.admits("Person", "worksOn", "Project"));
        assert!(!s.admits("Project", "worksOn", "Project"));
    }

    #[test]
    fn valid_triple_has_no_violations() {
        assert!(schema().check_triple(&triple("worksOn", "Person")).is_empty());
    }

    #[test]
    fn check_reports_each_violation() {
        let mut t = triple("worksOn", "Project");
        t.provenance.extractor_version = String::new();
        t.provenance.confidence = 1.5;
        let v = schema().check_triple(&t);
        assert!(v.iter().any(|x| matches!(x, Violation::SubjectType { .. })));
        assert!(v.contains(&Violation::MissingProvenance("extractor_version".into())));
        assert!(v.contains(&Violation::ConfidenceOutOfRange(1.5)));

        let unknown = schema().check_triple(&triple("mentors", "Person"));
        assert_eq!(unknown, vec![Violation::UnknownPredicate("mentors".into())]);
    }

    #[test]
    fn augmentation_keeps_known_predicates_only() {
        let s = schema().augmented(&[
            Gap {
                predicate: "partOf".into(),
                kind: GapKind::Uncovered,
            },
            Gap {
                predicate: "partOf".into(),
                kind: GapKind::Uncovered,
            },
            Gap {
                predicate: "invented".into(),
                kind: GapKind::FailedRecall,
            },
        ]);
        assert_eq!(s.focus.len(), 1);
        assert_eq!(s.fragment().focus_predicates, vec!["partOf".to_string()]);
        assert_eq!(s.fingerprint(), schema().fingerprint());
    }
}
