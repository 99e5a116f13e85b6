//! Proposal filtering, entity resolution, frame building and lowering.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use knowledgeforge_reasoning::ReasoningResponse;
use knowledgeforge_shared::{
    AnchorId, DomainSchema, EntityKey, EntityRef, Frame, FrameSlot, Provenance, SourceId,
    Triple, TypedEntity, TypedRelation,
};

/// An entity merged across units.
#[derive(Debug, Clone)]
struct Resolved {
    name: String,
    entity_type: String,
    type_confidence: f64,
    confidence: f64,
    anchors: Vec<AnchorId>,
}

impl Resolved {
    fn observe(&mut self, entity_type: &str, confidence: f64, anchor: &AnchorId) {
        if confidence > self.type_confidence {
            self.entity_type = entity_type.to_string();
            self.type_confidence = confidence;
        }
        self.confidence = self.confidence.max(confidence);
        if !self.anchors.contains(anchor) {
            self.anchors.push(anchor.clone());
        }
    }

    fn to_ref(&self, key: &EntityKey) -> EntityRef {
        EntityRef {
            key: key.clone(),
            name: self.name.clone(),
            entity_type: self.entity_type.clone(),
        }
    }
}

/// Accumulates L1 proposals from every unit, in anchor order.
pub(crate) struct Resolver<'a> {
    schema: &'a DomainSchema,
    min_confidence: f64,
    entities: BTreeMap<EntityKey, Resolved>,
    /// First-seen order, so L1 output follows the document.
    order: Vec<EntityKey>,
    relations: Vec<TypedRelation>,
    pub(crate) discarded: usize,
}

fn usable(confidence: f64, min: f64) -> bool {
    confidence.is_finite() && (0.0..=1.0).contains(&confidence) && confidence >= min
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(schema: &'a DomainSchema, min_confidence: f64) -> Self {
        Self {
            schema,
            min_confidence,
            entities: BTreeMap::new(),
            order: Vec::new(),
            relations: Vec::new(),
            discarded: 0,
        }
    }

    fn observe(&mut self, name: &str, entity_type: &str, confidence: f64, anchor: &AnchorId) {
        let key = EntityKey::normalize(name);
        if key.is_empty() {
            return;
        }
        match self.entities.get_mut(&key) {
            Some(existing) => existing.observe(entity_type, confidence, anchor),
            None => {
                self.order.push(key.clone());
                self.entities.insert(
                    key,
                    Resolved {
                        name: name.trim().to_string(),
                        entity_type: entity_type.to_string(),
                        type_confidence: confidence,
                        confidence,
                        anchors: vec![anchor.clone()],
                    },
                );
            }
        }
    }

    /// Fold one unit's response in. Off-schema and low-confidence relation
    /// proposals are discarded and counted.
    pub(crate) fn absorb(&mut self, anchor: &AnchorId, response: &ReasoningResponse) {
        let schema = self.schema;
        // Entity types as the unit itself typed them.
        let mut unit_types: BTreeMap<EntityKey, &str> = BTreeMap::new();
        for entity in &response.entities {
            if !schema.entity_types.contains(&entity.entity_type)
                || !usable(entity.confidence, self.min_confidence)
            {
                continue;
            }
            unit_types
                .entry(EntityKey::normalize(&entity.name))
                .or_insert(entity.entity_type.as_str());
            self.observe(&entity.name, &entity.entity_type, entity.confidence, anchor);
        }

        for relation in &response.relations {
            let Some(rel_type) = schema.relation(&relation.predicate) else {
                self.discarded += 1;
                continue;
            };
            let subject = EntityKey::normalize(&relation.subject);
            let object = EntityKey::normalize(&relation.object);
            let contradicts = |key: &EntityKey, expected: &str| {
                unit_types.get(key).is_some_and(|t| *t != expected)
            };
            if subject.is_empty()
                || object.is_empty()
                || !usable(relation.confidence, self.min_confidence)
                || contradicts(&subject, &rel_type.subject_type)
                || contradicts(&object, &rel_type.object_type)
            {
                self.discarded += 1;
                continue;
            }

            let (subject_type, object_type) =
                (rel_type.subject_type.clone(), rel_type.object_type.clone());
            self.observe(&relation.subject, &subject_type, relation.confidence, anchor);
            self.observe(&relation.object, &object_type, relation.confidence, anchor);
            self.relations.push(TypedRelation {
                subject,
                predicate: relation.predicate.clone(),
                object,
                confidence: relation.confidence,
                anchor: anchor.clone(),
            });
        }
    }

    pub(crate) fn typed_entities(&self) -> Vec<TypedEntity> {
        self.order
            .iter()
            .filter_map(|key| {
                self.entities.get(key).map(|e| TypedEntity {
                    entity: e.to_ref(key),
                    confidence: e.confidence,
                    anchors: e.anchors.clone(),
                })
            })
            .collect()
    }

    pub(crate) fn relations(&self) -> &[TypedRelation] {
        &self.relations
    }

    /// L2: one frame per subject, one slot per (predicate, object).
    ///
    /// Relations whose resolved endpoint types no longer match the schema
    /// (an entity typed differently by another unit) are dropped here and
    /// counted as discarded.
    pub(crate) fn frames(&mut self) -> Vec<Frame> {
        let mut grouped: BTreeMap<EntityKey, BTreeMap<(String, EntityKey), FrameSlot>> =
            BTreeMap::new();
        let mut dropped = 0;

        for relation in &self.relations {
            let (Some(subject), Some(object)) = (
                self.entities.get(&relation.subject),
                self.entities.get(&relation.object),
            ) else {
                dropped += 1;
                continue;
            };
            if !self
                .schema
                .admits(&subject.entity_type, &relation.predicate, &object.entity_type)
            {
                dropped += 1;
                continue;
            }

            let slots = grouped.entry(relation.subject.clone()).or_default();
            let slot = slots
                .entry((relation.predicate.clone(), relation.object.clone()))
                .or_insert_with(|| FrameSlot {
                    predicate: relation.predicate.clone(),
                    object: object.to_ref(&relation.object),
                    confidence: relation.confidence,
                    anchors: Vec::new(),
                });
            slot.confidence = slot.confidence.max(relation.confidence);
            if !slot.anchors.contains(&relation.anchor) {
                slot.anchors.push(relation.anchor.clone());
            }
        }
        self.discarded += dropped;

        grouped
            .into_iter()
            .filter_map(|(key, slots)| {
                self.entities.get(&key).map(|subject| Frame {
                    subject: subject.to_ref(&key),
                    slots: slots.into_values().collect(),
                })
            })
            .collect()
    }
}

/// L3: lower frames to triples. Each triple points at the first anchor that
/// supports its slot.
pub(crate) fn lower(
    frames: &[Frame],
    domain: &str,
    source_id: &SourceId,
    extractor_version: &str,
    extracted_at: DateTime<Utc>,
) -> Vec<Triple> {
    frames
        .iter()
        .flat_map(|frame| {
            frame.slots.iter().filter_map(move |slot| {
                let anchor = slot.anchors.first()?.clone();
                Some(Triple {
                    domain: domain.to_string(),
                    subject: frame.subject.clone(),
                    predicate: slot.predicate.clone(),
                    object: slot.object.clone(),
                    provenance: Provenance {
                        source_id: source_id.clone(),
                        anchor,
                        extracted_at,
                        extractor_version: extractor_version.to_string(),
                        confidence: slot.confidence,
                    },
                })
            })
        })
        .collect()
}
