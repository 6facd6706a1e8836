//! Entity graph
//!
//! Single writer for entity state during a run. Seeded from the datastore
//! snapshot, it admits the run's records, applies match proposals in the
//! order the matcher sorted them, and hands back the rows that changed.
//!
//! Each record key maps to exactly one live entity at any time. When a match
//! bridges two entities, the target entity (chosen by the field-fill engine's
//! orientation) absorbs the other: members move, fields resolve, and the
//! absorbed entity is either dropped (never persisted) or kept as a
//! `merged_into` tombstone.

use crate::applier::patch::{candidate_row, entity_row, PatchSet};
use crate::crossref::{CrossrefEntry, CrossrefLedger, EdgeOutcome, EdgeRejection};
use crate::matcher::{MatchPhase, MatchProposal, PairKey};
use crate::resolver::{ConflictReport, Direction, FieldFillEngine};
use crate::store::{CandidateRow, StoreSnapshot};
use crate::types::{CanonicalRecord, Entity, ProducerTier, RecordKey};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

/// What applying one proposal did
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Two entities became one
    Merged { target: Uuid, absorbed: Uuid, fields: usize },
    /// Both records already shared an entity; only the edge was added
    Linked,
    /// Edge already recorded
    Duplicate,
    /// Pair was merged by an earlier phase of this run
    AlreadyMerged,
    Rejected(EdgeRejection),
    /// A proposal referenced a record that was never admitted
    UnknownRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStats {
    pub records_admitted: usize,
    pub entities_created: usize,
    pub entities_refreshed: usize,
    pub merges: usize,
    pub entities_absorbed: usize,
    pub links: usize,
    pub duplicates: usize,
    pub already_merged: usize,
    pub rejected_self: usize,
    pub rejected_capacity: usize,
    pub crossref_evictions: usize,
    pub fields_updated: usize,
    pub conflicts: usize,
}

#[derive(Debug)]
pub struct EntityGraph {
    resolver: FieldFillEngine,
    ledger: CrossrefLedger,
    entities: HashMap<Uuid, Entity>,
    assignments: HashMap<RecordKey, Uuid>,
    tiers: HashMap<RecordKey, ProducerTier>,
    merged_pairs: HashSet<PairKey>,
    dirty_entities: BTreeSet<Uuid>,
    dirty_records: BTreeSet<RecordKey>,
    conflicts: Vec<ConflictReport>,
    stats: GraphStats,
}

impl EntityGraph {
    pub fn new(crossref_cap: usize) -> Self {
        Self {
            resolver: FieldFillEngine::new(),
            ledger: CrossrefLedger::new(crossref_cap),
            entities: HashMap::new(),
            assignments: HashMap::new(),
            tiers: HashMap::new(),
            merged_pairs: HashSet::new(),
            dirty_entities: BTreeSet::new(),
            dirty_records: BTreeSet::new(),
            conflicts: Vec::new(),
            stats: GraphStats::default(),
        }
    }

    /// Restore persisted entities, assignments and crossref edges
    pub fn seed(&mut self, snapshot: StoreSnapshot) {
        for mut entity in snapshot.entities {
            entity.persisted = true;
            entity.members.clear();
            self.entities.insert(entity.entity_id, entity);
        }

        for candidate in snapshot.candidates {
            let key = candidate.key.clone();
            let Some(live) = self.live_id(candidate.entity_id) else {
                warn!(
                    record = %key,
                    entity_id = %candidate.entity_id,
                    "Candidate assigned to unknown entity; will be re-admitted"
                );
                continue;
            };
            if live != candidate.entity_id {
                // Assignment written before a merge tombstone was followed up
                self.dirty_records.insert(key.clone());
            }
            if let Some(entity) = self.entities.get_mut(&live) {
                entity.members.insert(key.clone());
            }
            self.assignments.insert(key.clone(), live);
            self.tiers.insert(key.clone(), candidate.tier);
            self.ledger.load(&key, candidate.crossrefs);
        }

        let evicted = self.ledger.enforce_cap();
        self.stats.crossref_evictions += evicted.len();

        debug!(
            entities = self.entities.len(),
            assignments = self.assignments.len(),
            "Entity graph seeded"
        );
    }

    /// Follow `merged_into` to the live entity
    fn live_id(&self, mut id: Uuid) -> Option<Uuid> {
        for _ in 0..=self.entities.len() {
            let entity = self.entities.get(&id)?;
            match entity.merged_into {
                Some(next) => id = next,
                None => return Some(id),
            }
        }
        warn!(entity_id = %id, "merged_into chain does not terminate");
        None
    }

    /// Register a record for this run.
    ///
    /// A record without an assignment gets a new entity. An assigned record
    /// re-applies its fields to its entity under the usual fill rules, so an
    /// unchanged record leaves its entity untouched.
    pub fn admit(&mut self, record: &CanonicalRecord) {
        self.stats.records_admitted += 1;
        let key = &record.key;

        if self.tiers.insert(key.clone(), record.tier) != Some(record.tier) {
            self.dirty_records.insert(key.clone());
        }

        let assigned = self
            .assignments
            .get(key)
            .copied()
            .or_else(|| {
                // Entity written but candidate row lost: reattach by id
                let id = Entity::id_for(key);
                self.entities.contains_key(&id).then_some(id)
            })
            .and_then(|id| self.live_id(id));

        let Some(entity_id) = assigned else {
            let entity = Entity::from_record(record);
            let entity_id = entity.entity_id;
            debug!(record = %key, entity_id = %entity_id, "New entity");
            self.entities.insert(entity_id, entity);
            self.assignments.insert(key.clone(), entity_id);
            self.dirty_entities.insert(entity_id);
            self.dirty_records.insert(key.clone());
            self.stats.entities_created += 1;
            return;
        };

        if self.assignments.insert(key.clone(), entity_id) != Some(entity_id) {
            self.dirty_records.insert(key.clone());
        }

        let fresh = Entity::from_record(record);
        if let Some(entity) = self.entities.get_mut(&entity_id) {
            entity.members.insert(key.clone());
            let updates = self.resolver.resolve(entity, &fresh);
            if !updates.is_empty() {
                self.stats.fields_updated += updates.len();
                self.stats.entities_refreshed += 1;
                self.resolver.apply(entity, updates);
                self.dirty_entities.insert(entity_id);
            }
        }
    }

    /// Apply one proposal. `records` is the slice the matcher ran over.
    pub fn merge(&mut self, proposal: &MatchProposal, records: &[CanonicalRecord]) -> MergeOutcome {
        let (Some(a), Some(b)) = (records.get(proposal.a), records.get(proposal.b)) else {
            return MergeOutcome::UnknownRecord;
        };

        let pair = PairKey::new(&a.key, &b.key);
        if self.merged_pairs.contains(&pair) {
            self.stats.already_merged += 1;
            return MergeOutcome::AlreadyMerged;
        }

        let (Some(entity_a), Some(entity_b)) = (
            self.assignments.get(&a.key).copied(),
            self.assignments.get(&b.key).copied(),
        ) else {
            warn!(a = %a.key, b = %b.key, "Proposal references unadmitted record");
            return MergeOutcome::UnknownRecord;
        };

        match self.ledger.add_edge(&a.key, &b.key, proposal.score) {
            EdgeOutcome::Rejected(reason) => {
                match reason {
                    EdgeRejection::SelfLink => self.stats.rejected_self += 1,
                    EdgeRejection::CapacityFull => self.stats.rejected_capacity += 1,
                }
                debug!(a = %a.key, b = %b.key, phase = %proposal.phase, ?reason, "Proposal rejected");
                return MergeOutcome::Rejected(reason);
            }
            EdgeOutcome::Duplicate if entity_a == entity_b => {
                self.merged_pairs.insert(pair);
                self.stats.duplicates += 1;
                return MergeOutcome::Duplicate;
            }
            EdgeOutcome::Duplicate => {}
            EdgeOutcome::Added { evicted } => {
                self.stats.crossref_evictions += evicted.len();
            }
        }
        self.merged_pairs.insert(pair);

        if entity_a == entity_b {
            self.stats.links += 1;
            return MergeOutcome::Linked;
        }

        let (target_id, absorbed_id) = match self.resolver.orient(a, b) {
            Direction::IntoA => (entity_a, entity_b),
            Direction::IntoB => (entity_b, entity_a),
        };
        self.absorb(target_id, absorbed_id, proposal.phase)
    }

    fn absorb(&mut self, target_id: Uuid, absorbed_id: Uuid, phase: MatchPhase) -> MergeOutcome {
        let Some(mut absorbed) = self.entities.remove(&absorbed_id) else {
            return MergeOutcome::UnknownRecord;
        };
        let Some(target) = self.entities.get_mut(&target_id) else {
            self.entities.insert(absorbed_id, absorbed);
            return MergeOutcome::UnknownRecord;
        };

        let updates = self.resolver.resolve(target, &absorbed);
        let fields = updates.len();
        let conflicts = self.resolver.apply(target, updates);

        let members = std::mem::take(&mut absorbed.members);
        for member in &members {
            self.assignments.insert(member.clone(), target_id);
            self.dirty_records.insert(member.clone());
        }
        target.members.extend(members);

        debug!(
            target = %target_id,
            absorbed = %absorbed_id,
            phase = %phase,
            fields,
            conflicts = conflicts.len(),
            "Entities merged"
        );

        self.stats.merges += 1;
        self.stats.entities_absorbed += 1;
        self.stats.fields_updated += fields;
        self.stats.conflicts += conflicts.len();
        self.conflicts.extend(conflicts);
        self.dirty_entities.insert(target_id);

        // Tombstones that pointed at the absorbed entity now resolve through it
        if absorbed.persisted {
            absorbed.merged_into = Some(target_id);
            self.entities.insert(absorbed_id, absorbed);
            self.dirty_entities.insert(absorbed_id);
        } else {
            self.dirty_entities.remove(&absorbed_id);
        }

        MergeOutcome::Merged {
            target: target_id,
            absorbed: absorbed_id,
            fields,
        }
    }

    pub fn entity(&self, id: Uuid) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Live entity a record resolves to
    pub fn entity_of(&self, key: &RecordKey) -> Option<&Entity> {
        let id = self.assignments.get(key)?;
        self.entities.get(id)
    }

    pub fn entity_id_of(&self, key: &RecordKey) -> Option<Uuid> {
        self.assignments.get(key).copied()
    }

    /// Entities that have not been absorbed
    pub fn live_entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(|e| e.merged_into.is_none())
    }

    /// Crossref links of a record
    pub fn crossrefs(&self, key: &RecordKey) -> Vec<CrossrefEntry> {
        self.ledger.links(key)
    }

    /// Crossref ids of an entity: the links of its origin record
    pub fn crossref_ids(&self, entity_id: Uuid) -> Vec<RecordKey> {
        self.entities
            .get(&entity_id)
            .map(|entity| {
                self.ledger
                    .links(&entity.origin)
                    .into_iter()
                    .map(|entry| entry.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> &GraphStats {
        &self.stats
    }

    pub fn take_conflicts(&mut self) -> Vec<ConflictReport> {
        std::mem::take(&mut self.conflicts)
    }

    /// Rows for every entity and candidate changed since the last drain.
    ///
    /// Entities come first in the set so the applier can write them before
    /// the candidate rows that reference them.
    pub fn drain_patches(&mut self) -> PatchSet {
        let mut patches = PatchSet::default();

        for id in std::mem::take(&mut self.dirty_entities) {
            if let Some(entity) = self.entities.get(&id) {
                patches.entities.push(entity_row(entity));
            }
        }

        let mut records = std::mem::take(&mut self.dirty_records);
        records.extend(self.ledger.take_touched());
        for key in records {
            let (Some(&entity_id), Some(&tier)) = (self.assignments.get(&key), self.tiers.get(&key)) else {
                continue;
            };
            patches.candidates.push(candidate_row(&CandidateRow {
                crossrefs: self.ledger.links(&key),
                key,
                tier,
                entity_id,
            }));
        }

        patches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Attribute;

    fn record(producer: &str, id: &str, tier: u8) -> CanonicalRecord {
        CanonicalRecord::new(RecordKey::new(producer, id), ProducerTier::new(tier).unwrap())
    }

    fn proposal(a: usize, b: usize, phase: MatchPhase, score: f64) -> MatchProposal {
        MatchProposal { a, b, phase, score, distance_m: None }
    }

    fn admitted(records: &[CanonicalRecord], cap: usize) -> EntityGraph {
        let mut graph = EntityGraph::new(cap);
        for r in records {
            graph.admit(r);
        }
        graph
    }

    #[test]
    fn test_admit_creates_one_entity_per_record() {
        let records = vec![record("a", "1", 1), record("b", "1", 2)];
        let graph = admitted(&records, 20);
        assert_eq!(graph.live_entities().count(), 2);
        assert_eq!(graph.stats().entities_created, 2);
        assert_eq!(
            graph.entity_id_of(&records[0].key),
            Some(Entity::id_for(&records[0].key))
        );
    }

    #[test]
    fn test_merge_moves_members_into_higher_tier() {
        let records = vec![
            record("city", "777", 3).with_attribute(Attribute::Owner, "Acme Solar LLC"),
            record("eia", "fed_001", 1).with_capacity(5.2),
        ];
        let mut graph = admitted(&records, 20);

        let outcome = graph.merge(&proposal(0, 1, MatchPhase::Proximity, 0.9), &records);
        let fed_entity = Entity::id_for(&records[1].key);
        assert!(matches!(outcome, MergeOutcome::Merged { target, .. } if target == fed_entity));

        assert_eq!(graph.live_entities().count(), 1);
        let entity = graph.entity_of(&records[0].key).unwrap();
        assert_eq!(entity.entity_id, fed_entity);
        assert_eq!(entity.attribute(Attribute::Owner), Some("Acme Solar LLC"));
        assert_eq!(entity.capacity_mw(), Some(5.2));
        assert_eq!(entity.members.len(), 2);
        // Absorbed entity was never persisted: no tombstone left behind
        assert!(graph.entity(Entity::id_for(&records[0].key)).is_none());
    }

    #[test]
    fn test_later_phase_skips_merged_pair() {
        let records = vec![record("a", "1", 1), record("b", "1", 2)];
        let mut graph = admitted(&records, 20);
        graph.merge(&proposal(0, 1, MatchPhase::ExactKey, 1.0), &records);
        assert_eq!(
            graph.merge(&proposal(0, 1, MatchPhase::Proximity, 0.7), &records),
            MergeOutcome::AlreadyMerged
        );
    }

    #[test]
    fn test_same_entity_only_links() {
        let records = vec![record("a", "1", 1), record("b", "1", 2), record("c", "1", 3)];
        let mut graph = admitted(&records, 20);
        graph.merge(&proposal(0, 1, MatchPhase::Proximity, 0.9), &records);
        graph.merge(&proposal(0, 2, MatchPhase::Proximity, 0.9), &records);
        assert_eq!(
            graph.merge(&proposal(1, 2, MatchPhase::Proximity, 0.8), &records),
            MergeOutcome::Linked
        );
        assert_eq!(graph.stats().merges, 2);
        assert_eq!(graph.crossrefs(&records[2].key).len(), 2);

        let live = graph.entity_id_of(&records[0].key).unwrap();
        let ids = graph.crossref_ids(live);
        assert_eq!(ids, vec![records[1].key.clone(), records[2].key.clone()]);
    }

    #[test]
    fn test_cap_rejects_merge() {
        let records = vec![record("a", "1", 1), record("b", "1", 2), record("c", "1", 2)];
        let mut graph = admitted(&records, 1);
        graph.merge(&proposal(0, 1, MatchPhase::Proximity, 0.9), &records);
        assert_eq!(
            graph.merge(&proposal(0, 2, MatchPhase::Proximity, 0.5), &records),
            MergeOutcome::Rejected(EdgeRejection::CapacityFull)
        );
        assert_ne!(
            graph.entity_id_of(&records[0].key),
            graph.entity_id_of(&records[2].key)
        );
    }

    #[test]
    fn test_persisted_absorbed_entity_is_tombstoned() {
        let records = vec![record("a", "1", 2), record("b", "1", 1)];
        let mut first = admitted(&records[..1], 20);
        let patches = first.drain_patches();
        assert_eq!(patches.entities.len(), 1);

        let mut persisted = Entity::from_record(&records[0]);
        persisted.members.clear();
        let snapshot = StoreSnapshot {
            entities: vec![persisted],
            candidates: vec![CandidateRow {
                key: records[0].key.clone(),
                tier: records[0].tier,
                entity_id: Entity::id_for(&records[0].key),
                crossrefs: vec![],
            }],
        };

        let mut graph = EntityGraph::new(20);
        graph.seed(snapshot);
        for r in &records {
            graph.admit(r);
        }
        graph.merge(&proposal(0, 1, MatchPhase::Proximity, 0.9), &records);

        let old = graph.entity(Entity::id_for(&records[0].key)).unwrap();
        assert_eq!(old.merged_into, Some(Entity::id_for(&records[1].key)));
        let patches = graph.drain_patches();
        assert_eq!(patches.entities.len(), 2);
        assert_eq!(patches.candidates.len(), 2);
    }

    #[test]
    fn test_readmit_unchanged_record_is_clean() {
        let r = record("a", "1", 1).with_capacity(3.0);
        let mut graph = EntityGraph::new(20);
        graph.admit(&r);
        let patches = graph.drain_patches();
        assert_eq!(patches.len(), 2);

        graph.admit(&r);
        assert!(graph.drain_patches().is_empty());
    }
}
