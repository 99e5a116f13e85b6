//! The four-layer knowledge package produced by one extraction run.
//!
//! L0 anchored text → L1 typed entities/relations → L2 frames → L3 triples.
//! A package is consumed exactly once by the write queue.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AnchorId, EntityKey, EntityRef, SourceId, Triple, VersionToken, sha256_hex};

/// Time-sortable package identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(pub Uuid);

impl PackageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for PackageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

/// L0: an anchorable unit of raw text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub id: AnchorId,
    /// 1-based section number (sections open at headings).
    pub section: u32,
    /// 1-based paragraph number within the section.
    pub paragraph: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    pub text: String,
}

/// L1: a typed entity after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedEntity {
    pub entity: EntityRef,
    pub confidence: f64,
    pub anchors: Vec<AnchorId>,
}

/// L1: a typed relation as proposed for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedRelation {
    pub subject: EntityKey,
    pub predicate: String,
    pub object: EntityKey,
    pub confidence: f64,
    pub anchor: AnchorId,
}

/// L2: one filled slot of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSlot {
    pub predicate: String,
    pub object: EntityRef,
    pub confidence: f64,
    pub anchors: Vec<AnchorId>,
}

/// L2: everything the package asserts about one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub subject: EntityRef,
    pub slots: Vec<FrameSlot>,
}

/// Whether every unit made it through inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Complete,
    /// At least one unit degraded to L0-only.
    Partial,
}

/// A unit whose inference call failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub anchor: AnchorId,
    pub error: String,
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// KnowledgePackage
// ---------------------------------------------------------------------------

/// Output of one extraction run over one source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgePackage {
    pub id: PackageId,
    pub source_id: SourceId,
    pub source_hash: String,
    pub domain: String,
    pub extractor_version: String,
    pub created_at: DateTime<Utc>,
    pub status: PackageStatus,
    pub anchors: Vec<Anchor>,
    pub entities: Vec<TypedEntity>,
    pub relations: Vec<TypedRelation>,
    pub frames: Vec<Frame>,
    pub triples: Vec<Triple>,
    /// Version token of each subject entity as of the extraction snapshot.
    pub base_versions: BTreeMap<EntityKey, VersionToken>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_units: Vec<UnitFailure>,
    /// Relation proposals dropped by schema or confidence filtering.
    #[serde(default)]
    pub discarded_proposals: usize,
    pub content_hash: String,
}

impl KnowledgePackage {
    /// Distinct subject entities written by this package, sorted.
    pub fn subjects(&self) -> BTreeSet<EntityKey> {
        self.triples.iter().map(|t| t.subject.key.clone()).collect()
    }

    pub fn anchor(&self, id: &AnchorId) -> Option<&Anchor> {
        self.anchors.iter().find(|a| &a.id == id)
    }

    /// Whether `triple` points at an L0 anchor of this package.
    pub fn is_grounded(&self, triple: &Triple) -> bool {
        triple.provenance.source_id == self.source_id && self.anchor(&triple.provenance.anchor).is_some()
    }

    /// Base token the package presents for `key`.
    pub fn base_version(&self, key: &EntityKey) -> VersionToken {
        self.base_versions.get(key).copied().unwrap_or_default()
    }

    /// Content hash over everything that determines what a commit would write.
    /// Timestamps and package ids are excluded so identical re-extractions
    /// hash identically.
    pub fn compute_content_hash(&self) -> String {
        let mut facts: Vec<String> = self
            .triples
            .iter()
            .map(|t| {
                format!(
                    "{}|{}|{}|{}|{:.4}",
                    t.canonical_key(),
                    t.subject.entity_type,
                    t.object.entity_type,
                    t.provenance.anchor,
                    t.provenance.confidence
                )
            })
            .collect();
        facts.sort();

        let bases = self
            .base_versions
            .iter()
            .map(|(k, v)| format!("{k}={}", v.0))
            .collect::<Vec<_>>()
            .join(",");

        let body = format!(
            "{}\n{}\n{}\n{}\n{}",
            self.source_hash,
            self.domain,
            self.extractor_version,
            bases,
            facts.join("\n")
        );
        sha256_hex(body.as_bytes())
    }

    /// Recompute and store the content hash.
    pub fn seal(mut self) -> Self {
        self.content_hash = self.compute_content_hash();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provenance;

    fn package() -> KnowledgePackage {
        let source_id = SourceId::from("S1");
        let anchor = AnchorId::new(&source_id, 1, 1);
        let triple = Triple {
            domain: "eng".into(),
            subject: EntityRef::new("Alice", "Person"),
            predicate: "worksOn".into(),
            object: EntityRef::new("Apollo", "Project"),
            provenance: Provenance {
                source_id: source_id.clone(),
                anchor: anchor.clone(),
                extracted_at: Utc::now(),
                extractor_version: "test".into(),
                confidence: 0.9,
            },
        };
        KnowledgePackage {
            id: PackageId::new(),
            source_id,
            source_hash: "abc".into(),
            domain: "eng".into(),
            extractor_version: "test".into(),
            created_at: Utc::now(),
            status: PackageStatus::Complete,
            anchors: vec![Anchor {
                id: anchor,
                section: 1,
                paragraph: 1,
                heading: None,
                text: "Alice works on Apollo.".into(),
            }],
            entities: vec![],
            relations: vec![],
            frames: vec![],
            triples: vec![triple],
            base_versions: BTreeMap::new(),
            failed_units: vec![],
            discarded_proposals: 0,
            content_hash: String::new(),
        }
        .seal()
    }

    #[test]
    fn hash_ignores_ids_and_timestamps() {
        let a = package();
        let mut b = package();
        b.triples[0].provenance.extracted_at = Utc::now() + chrono::Duration::seconds(5);
        assert_ne!(a.id, b.id);
        assert_eq!(a.content_hash, b.compute_content_hash());
    }

    #[test]
    fn hash_covers_base_versions() {
        let a = package();
        let mut b = package();
        b.base_versions
            .insert(EntityKey::normalize("alice"), VersionToken(1));
        assert_ne!(a.content_hash, b.compute_content_hash());
    }

    #[test]
    fn grounding_requires_known_anchor() {
        let p = package();
        assert!(p.is_grounded(&p.triples[0]));
        let mut stray = p.triples[0].clone();
        stray.provenance.anchor = AnchorId("S1#s9.p9".into());
        assert!(!p.is_grounded(&stray));
        assert_eq!(p.subjects().len(), 1);
    }
}
