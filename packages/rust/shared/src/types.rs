//! Core domain types: source documents, entities, triples, provenance and
//! version tokens.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 of `bytes` as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// SourceDocument
// ---------------------------------------------------------------------------

/// Externally assigned identifier of a source document (e.g. `S1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An immutable raw document handed to the factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Stable identifier.
    pub id: SourceId,
    /// Domain tag used for source selection (e.g. `engineering`).
    pub domain: String,
    /// Full text content.
    pub content: String,
    /// Optional pointer to where the content came from (path, URL, ticket).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// SHA-256 of `content`.
    pub content_hash: String,
}

impl SourceDocument {
    /// Build a document, hashing its content.
    pub fn new(
        id: impl Into<SourceId>,
        domain: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let content_hash = sha256_hex(content.as_bytes());
        Self {
            id: id.into(),
            domain: domain.into(),
            content,
            reference: None,
            content_hash,
        }
    }

    /// Attach an external reference.
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Content size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.content.len()
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Leading articles ignored during entity resolution.
const ARTICLES: [&str; 3] = ["the ", "a ", "an "];

/// Normalized entity name; the unit of entity resolution and of locking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    /// Normalize a surface name: lower-case, punctuation to spaces, collapsed
    /// whitespace, one leading article removed.
    pub fn normalize(name: &str) -> Self {
        let lowered: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .to_lowercase();
        let mut collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
        for article in ARTICLES {
            if collapsed.len() > article.len() && collapsed.starts_with(article) {
                collapsed = collapsed[article.len()..].to_string();
                break;
            }
        }
        Self(collapsed)
    }

    /// Wrap an already-normalized key (as read back from storage).
    pub fn from_normalized(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed reference to a resolved entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    /// Resolution key.
    pub key: EntityKey,
    /// Display name (first surface form seen).
    pub name: String,
    /// Schema entity type (e.g. `Person`).
    pub entity_type: String,
}

impl EntityRef {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: EntityKey::normalize(&name),
            name,
            entity_type: entity_type.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Anchors, provenance, triples
// ---------------------------------------------------------------------------

/// Identifier of an L0 text unit: `<source-id>#s<section>.p<paragraph>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchorId(pub String);

impl AnchorId {
    pub fn new(source: &SourceId, section: u32, paragraph: u32) -> Self {
        Self(format!("{source}#s{section}.p{paragraph}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AnchorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a triple came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: SourceId,
    /// The L0 anchor the triple is grounded in.
    pub anchor: AnchorId,
    pub extracted_at: DateTime<Utc>,
    pub extractor_version: String,
    pub confidence: f64,
}

/// A knowledge-graph triple with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    pub domain: String,
    pub subject: EntityRef,
    pub predicate: String,
    pub object: EntityRef,
    pub provenance: Provenance,
}

impl Triple {
    pub fn confidence(&self) -> f64 {
        self.provenance.confidence
    }

    /// Identity of the fact regardless of when it was extracted.
    pub fn canonical_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.domain,
            self.subject.key,
            self.predicate,
            self.object.key,
            self.provenance.source_id
        )
    }
}

// ---------------------------------------------------------------------------
// Version tokens
// ---------------------------------------------------------------------------

/// Per-entity optimistic concurrency token. `0` means never written.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VersionToken(pub u64);

impl VersionToken {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Entity version tokens as seen at one store revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionSnapshot {
    /// Store-wide revision the snapshot was taken at.
    pub revision: u64,
    versions: BTreeMap<EntityKey, VersionToken>,
}

impl VersionSnapshot {
    pub fn new(revision: u64, versions: BTreeMap<EntityKey, VersionToken>) -> Self {
        Self { revision, versions }
    }

    /// Token for `key`; entities never written are at `v0`.
    pub fn token_for(&self, key: &EntityKey) -> VersionToken {
        self.versions.get(key).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Subgraph
// ---------------------------------------------------------------------------

/// The committed triples of one domain as of a store revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subgraph {
    pub domain: String,
    pub revision: u64,
    pub triples: Vec<Triple>,
}

impl Subgraph {
    pub fn new(domain: impl Into<String>, revision: u64, triples: Vec<Triple>) -> Self {
        Self {
            domain: domain.into(),
            revision,
            triples,
        }
    }

    /// Distinct predicates present.
    pub fn predicates(&self) -> BTreeSet<String> {
        self.triples.iter().map(|t| t.predicate.clone()).collect()
    }

    /// Triples whose subject is `key`.
    pub fn outgoing<'a>(&'a self, key: &'a EntityKey) -> impl Iterator<Item = &'a Triple> + 'a {
        self.triples.iter().filter(move |t| &t.subject.key == key)
    }

    /// Whether any triple mentions `key` as subject or object.
    pub fn mentions(&self, key: &EntityKey) -> bool {
        self.triples
            .iter()
            .any(|t| &t.subject.key == key || &t.object.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Queries against a knowledge service
// ---------------------------------------------------------------------------

/// A question posed to a knowledge service: start at `subject`, follow `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub subject: String,
    pub path: Vec<String>,
}

impl Query {
    pub fn recall(subject: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            path: vec![predicate.into()],
        }
    }
}

/// A knowledge service's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Answer {
    /// The service knows the answer and cites the anchors backing it.
    Known {
        objects: Vec<String>,
        provenance: Vec<AnchorId>,
    },
    /// The service explicitly declines to answer.
    Unknown,
}

impl Answer {
    /// Object names normalized for comparison.
    pub fn object_keys(&self) -> BTreeSet<EntityKey> {
        match self {
            Self::Known { objects, .. } => objects.iter().map(|o| EntityKey::normalize(o)).collect(),
            Self::Unknown => BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_key_normalization() {
        assert_eq!(EntityKey::normalize("  The Apollo   Program "), EntityKey::normalize("apollo program"));
        assert_eq!(EntityKey::normalize("Ada Lovelace").as_str(), "ada lovelace");
        assert_eq!(EntityKey::normalize("Q3-Launch!").as_str(), "q3 launch");
        // A bare article is a name, not a prefix.
        assert_eq!(EntityKey::normalize("The").as_str(), "the");
    }

    #[test]
    fn normalize_folds_non_ascii_case() {
        assert_eq!(EntityKey::normalize("Émile Zola"), EntityKey::normalize("émile zola"));
        assert_eq!(EntityKey::normalize("ÉMILE ZOLA").as_str(), "émile zola");
        assert_eq!(EntityKey::normalize("Øresund Bridge").as_str(), "øresund bridge");
    }

    #[test]
    fn source_document_hashes_content() {
        let a = SourceDocument::new("S1", "eng", "hello");
        let b = SourceDocument::new("S2", "eng", "hello");
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.content_hash.len(), 64);
        assert_eq!(a.size_bytes(), 5);
    }

    #[test]
    fn anchor_id_format() {
        let anchor = AnchorId::new(&SourceId::from("S1"), 2, 3);
        assert_eq!(anchor.as_str(), "S1#s2.p3");
    }

    #[test]
    fn snapshot_defaults_to_v0() {
        let mut versions = BTreeMap::new();
        versions.insert(EntityKey::normalize("alice"), VersionToken(4));
        let snap = VersionSnapshot::new(9, versions);
        assert_eq!(snap.token_for(&EntityKey::normalize("Alice")), VersionToken(4));
        assert_eq!(snap.token_for(&EntityKey::normalize("bob")), VersionToken(0));
        assert_eq!(VersionToken(4).next(), VersionToken(5));
    }

    #[test]
    fn answer_serialization_is_tagged() {
        let json = serde_json::to_string(&Answer::Unknown).expect("serialize");
        assert_eq!(json, r#"{"kind":"unknown"}"#);
        let known = Answer::Known {
            objects: vec!["The Apollo".into()],
            provenance: vec![AnchorId("S1#s1.p1".into())],
        };
        assert!(known.object_keys().contains(&EntityKey::normalize("apollo")));
    }
}
