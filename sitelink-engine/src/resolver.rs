// Conflict Resolver / Field-Fill Engine
//
// Decides, for a matched pair, which record's entity receives fields and
// which fields move. Every field follows the same rule:
//
// 1. target unset            -> copy from source
// 2. source tier strictly higher -> overwrite
// 3. otherwise               -> keep target (reported as a conflict if the
//                               values disagree)
//
// Location precision is not tier-governed: it only ever rises.

use crate::types::{Attribute, CanonicalRecord, Entity, GeoPoint, LocationPrecision, RecordKey, Sourced};
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

/// Which side of a matched pair receives fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `a` is the target, `b` the source
    IntoA,
    /// `b` is the target, `a` the source
    IntoB,
}

/// Disagreement that left the target value in place
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictReport {
    pub field: String,
    pub kept_source: RecordKey,
    pub kept_value: String,
    pub rejected_source: RecordKey,
    pub rejected_value: String,
    /// Normalized Levenshtein for text, 1 - relative difference for numbers
    pub similarity: Option<f64>,
}

/// Fields a merge changes on the target entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdateSet {
    pub attributes: Vec<(Attribute, Sourced<String>)>,
    pub capacity: Option<Sourced<f64>>,
    pub location: Option<Sourced<GeoPoint>>,
    pub location_precision: Option<LocationPrecision>,
    pub conflicts: Vec<ConflictReport>,
}

impl FieldUpdateSet {
    /// Number of fields the update writes
    pub fn len(&self) -> usize {
        self.attributes.len()
            + usize::from(self.capacity.is_some())
            + usize::from(self.location.is_some())
            + usize::from(self.location_precision.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of comparing one field
enum FieldDecision<T> {
    Take(Sourced<T>),
    Keep,
    Conflict,
}

fn decide<T: Clone + PartialEq>(target: Option<&Sourced<T>>, source: Option<&Sourced<T>>) -> FieldDecision<T> {
    let Some(incoming) = source else {
        return FieldDecision::Keep;
    };
    match target {
        None => FieldDecision::Take(incoming.clone()),
        Some(current) if incoming.tier.outranks(current.tier) => {
            if current.value == incoming.value && current.source == incoming.source {
                FieldDecision::Keep
            } else {
                FieldDecision::Take(incoming.clone())
            }
        }
        Some(current) if current.value != incoming.value => FieldDecision::Conflict,
        Some(_) => FieldDecision::Keep,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FieldFillEngine;

impl FieldFillEngine {
    pub fn new() -> Self {
        Self
    }

    /// Pick the target of a matched pair.
    ///
    /// Higher tier wins; then having coordinates; then the more recent
    /// `reported_at`; then the smaller record key.
    pub fn orient(&self, a: &CanonicalRecord, b: &CanonicalRecord) -> Direction {
        let preference = b
            .tier
            .cmp(&a.tier)
            .then_with(|| a.location.is_some().cmp(&b.location.is_some()))
            .then_with(|| a.reported_at.cmp(&b.reported_at))
            .then_with(|| b.key.cmp(&a.key));
        match preference {
            Ordering::Less => Direction::IntoB,
            Ordering::Greater | Ordering::Equal => Direction::IntoA,
        }
    }

    /// Compute the updates `source` contributes to `target`
    pub fn resolve(&self, target: &Entity, source: &Entity) -> FieldUpdateSet {
        let mut updates = FieldUpdateSet::default();

        for attribute in Attribute::ALL {
            let current = target.attributes.get(&attribute);
            let incoming = source.attributes.get(&attribute);
            match decide(current, incoming) {
                FieldDecision::Take(value) => updates.attributes.push((attribute, value)),
                FieldDecision::Keep => {}
                FieldDecision::Conflict => {
                    if let (Some(kept), Some(rejected)) = (current, incoming) {
                        updates.conflicts.push(ConflictReport {
                            field: attribute.to_string(),
                            kept_source: kept.source.clone(),
                            kept_value: kept.value.clone(),
                            rejected_source: rejected.source.clone(),
                            rejected_value: rejected.value.clone(),
                            similarity: Some(strsim::normalized_levenshtein(
                                &kept.value.to_lowercase(),
                                &rejected.value.to_lowercase(),
                            )),
                        });
                    }
                }
            }
        }

        match decide(target.capacity.as_ref(), source.capacity.as_ref()) {
            FieldDecision::Take(value) => updates.capacity = Some(value),
            FieldDecision::Keep => {}
            FieldDecision::Conflict => {
                if let (Some(kept), Some(rejected)) = (&target.capacity, &source.capacity) {
                    let larger = kept.value.max(rejected.value);
                    let similarity = if larger > 0.0 {
                        1.0 - (kept.value - rejected.value).abs() / larger
                    } else {
                        1.0
                    };
                    updates.conflicts.push(ConflictReport {
                        field: "capacity_mw".to_string(),
                        kept_source: kept.source.clone(),
                        kept_value: kept.value.to_string(),
                        rejected_source: rejected.source.clone(),
                        rejected_value: rejected.value.to_string(),
                        similarity: Some(similarity),
                    });
                }
            }
        }

        match decide(target.location.as_ref(), source.location.as_ref()) {
            FieldDecision::Take(value) => updates.location = Some(value),
            FieldDecision::Keep => {}
            FieldDecision::Conflict => {
                if let (Some(kept), Some(rejected)) = (&target.location, &source.location) {
                    updates.conflicts.push(ConflictReport {
                        field: "location".to_string(),
                        kept_source: kept.source.clone(),
                        kept_value: format!("{},{}", kept.value.lat, kept.value.lon),
                        rejected_source: rejected.source.clone(),
                        rejected_value: format!("{},{}", rejected.value.lat, rejected.value.lon),
                        similarity: None,
                    });
                }
            }
        }

        if source.location_precision > target.location_precision {
            updates.location_precision = source.location_precision;
        }

        if !updates.conflicts.is_empty() {
            debug!(
                target = %target.entity_id,
                source = %source.entity_id,
                conflicts = updates.conflicts.len(),
                "Conflicting fields kept on target"
            );
        }

        updates
    }

    /// Write an update set into `target`. Returns the conflicts it carried.
    pub fn apply(&self, target: &mut Entity, updates: FieldUpdateSet) -> Vec<ConflictReport> {
        for (attribute, value) in updates.attributes {
            target.attributes.insert(attribute, value);
        }
        if let Some(capacity) = updates.capacity {
            target.capacity = Some(capacity);
        }
        if let Some(location) = updates.location {
            target.location = Some(location);
        }
        if let Some(precision) = updates.location_precision {
            target.location_precision = target.location_precision.max(Some(precision));
        }
        updates.conflicts
    }
}
