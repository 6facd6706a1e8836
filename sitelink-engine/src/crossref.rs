//! Crossref ledger
//!
//! Capped, symmetric adjacency between candidate records. Each edge records
//! the belief that two candidates describe the same site, with the score of
//! the match that produced it.
//!
//! Invariants maintained by [`CrossrefLedger::add_edge`]:
//! - `b ∈ links(a)` iff `a ∈ links(b)`
//! - no record ever holds more than `cap` links
//! - a full record only admits a new link whose score strictly exceeds its
//!   weakest current link; the weakest is then evicted from both endpoints

use crate::matcher::PairKey;
use crate::types::RecordKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// One stored link, as persisted in a candidate row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossrefEntry {
    pub id: RecordKey,
    pub score: f64,
}

/// Why an edge was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeRejection {
    SelfLink,
    /// An endpoint is at capacity and the score does not beat its weakest link
    CapacityFull,
}

/// Result of [`CrossrefLedger::add_edge`]
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeOutcome {
    /// Inserted in both directions; lists edges evicted to make room
    Added { evicted: Vec<PairKey> },
    /// Edge already present; nothing changed
    Duplicate,
    Rejected(EdgeRejection),
}

#[derive(Debug, Clone)]
pub struct CrossrefLedger {
    cap: usize,
    links: HashMap<RecordKey, BTreeMap<RecordKey, f64>>,
    /// Records whose link set changed since the last `take_touched`
    touched: BTreeSet<RecordKey>,
}

impl CrossrefLedger {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            links: HashMap::new(),
            touched: BTreeSet::new(),
        }
    }

    /// Restore a record's persisted links without re-checking the cap.
    ///
    /// Stored link sets are written symmetrically, so loading every record
    /// restores both sides. Call [`enforce_cap`](Self::enforce_cap) afterwards
    /// in case the cap was lowered since they were written.
    pub fn load(&mut self, key: &RecordKey, entries: impl IntoIterator<Item = CrossrefEntry>) {
        let set = self.links.entry(key.clone()).or_default();
        for entry in entries {
            if entry.id != *key {
                set.insert(entry.id, entry.score);
            }
        }
    }

    /// Evict weakest links, from both endpoints, until every record is
    /// within the cap
    pub fn enforce_cap(&mut self) -> Vec<PairKey> {
        let mut over: Vec<RecordKey> = self
            .links
            .iter()
            .filter(|(_, set)| set.len() > self.cap)
            .map(|(key, _)| key.clone())
            .collect();
        over.sort();

        let mut evicted = Vec::new();
        for key in over {
            while self.degree(&key) > self.cap {
                let Some(victim) = self.links.get(&key).and_then(weakest_of) else {
                    break;
                };
                self.remove_edge(&key, &victim);
                evicted.push(PairKey::new(&key, &victim));
            }
        }
        evicted
    }

    pub fn contains(&self, a: &RecordKey, b: &RecordKey) -> bool {
        self.links.get(a).is_some_and(|set| set.contains_key(b))
    }

    pub fn degree(&self, key: &RecordKey) -> usize {
        self.links.get(key).map_or(0, BTreeMap::len)
    }

    /// Links of `key`, ordered by record key
    pub fn links(&self, key: &RecordKey) -> Vec<CrossrefEntry> {
        self.links
            .get(key)
            .map(|set| {
                set.iter()
                    .map(|(id, score)| CrossrefEntry {
                        id: id.clone(),
                        score: *score,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Score of the weakest link held by `key`
    pub fn weakest_score(&self, key: &RecordKey) -> Option<f64> {
        let set = self.links.get(key)?;
        let weakest = weakest_of(set)?;
        set.get(&weakest).copied()
    }

    /// Whether `add_edge(a, b, score)` would insert or find a duplicate
    pub fn can_accept(&self, a: &RecordKey, b: &RecordKey, score: f64) -> bool {
        if a == b {
            return false;
        }
        if self.contains(a, b) {
            return true;
        }
        self.has_room(a, score) && self.has_room(b, score)
    }

    fn has_room(&self, key: &RecordKey, score: f64) -> bool {
        if self.degree(key) < self.cap {
            return true;
        }
        self.weakest_score(key).is_some_and(|weakest| score > weakest)
    }

    /// Symmetric insert with cap enforcement
    pub fn add_edge(&mut self, a: &RecordKey, b: &RecordKey, score: f64) -> EdgeOutcome {
        if a == b {
            return EdgeOutcome::Rejected(EdgeRejection::SelfLink);
        }
        if self.contains(a, b) {
            return EdgeOutcome::Duplicate;
        }
        if self.cap == 0 || !self.has_room(a, score) || !self.has_room(b, score) {
            debug!(a = %a, b = %b, score, "Crossref edge refused: capacity full");
            return EdgeOutcome::Rejected(EdgeRejection::CapacityFull);
        }

        let mut evicted = Vec::new();
        for key in [a, b] {
            if self.degree(key) >= self.cap {
                if let Some(victim) = self.links.get(key).and_then(weakest_of) {
                    self.remove_edge(key, &victim);
                    evicted.push(PairKey::new(key, &victim));
                }
            }
        }

        self.links
            .entry(a.clone())
            .or_default()
            .insert(b.clone(), score);
        self.links
            .entry(b.clone())
            .or_default()
            .insert(a.clone(), score);
        self.touched.insert(a.clone());
        self.touched.insert(b.clone());

        if !evicted.is_empty() {
            debug!(a = %a, b = %b, evicted = evicted.len(), "Crossref eviction");
        }
        EdgeOutcome::Added { evicted }
    }

    fn remove_edge(&mut self, a: &RecordKey, b: &RecordKey) {
        if let Some(set) = self.links.get_mut(a) {
            set.remove(b);
        }
        if let Some(set) = self.links.get_mut(b) {
            set.remove(a);
        }
        self.touched.insert(a.clone());
        self.touched.insert(b.clone());
    }

    /// Drain the set of records whose links changed
    pub fn take_touched(&mut self) -> BTreeSet<RecordKey> {
        std::mem::take(&mut self.touched)
    }
}

/// Lowest score; among equal scores the largest key goes first
fn weakest_of(set: &BTreeMap<RecordKey, f64>) -> Option<RecordKey> {
    set.iter()
        .min_by(|(ka, sa), (kb, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| kb.cmp(ka))
        })
        .map(|(key, _)| key.clone())
}
