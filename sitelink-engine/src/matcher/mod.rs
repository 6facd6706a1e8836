//! Multi-phase candidate matcher
//!
//! Proposes pairs of records that describe the same site. Phases run in order
//! so cheap, high-confidence matches are settled before looser ones see the
//! same candidates:
//!
//! 1. **Exact key** - shared foreign registration id, unconditional
//! 2. **Proximity** - within radius, capacity or name agreement
//! 3. **Cross-tier** - narrower radius, tighter tolerance, different tiers only
//!
//! Proposal generation only reads the record slice and the spatial index, so
//! phases 2 and 3 fan out over shards of spatial cells on a bounded worker
//! pool. Proposals come back in one deterministic order regardless of which
//! worker produced them; applying them is the entity graph's job.

pub mod cross_tier;
pub mod exact_key;
pub mod proximity;
pub mod similarity;

use crate::spatial::SpatialIndex;
use crate::types::{CanonicalRecord, RecordKey};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sitelink_common::config::MatcherConfig;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Matching phase, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    ExactKey,
    Proximity,
    CrossTier,
}

impl MatchPhase {
    pub const ALL: [MatchPhase; 3] = [
        MatchPhase::ExactKey,
        MatchPhase::Proximity,
        MatchPhase::CrossTier,
    ];
}

impl fmt::Display for MatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchPhase::ExactKey => "exact_key",
            MatchPhase::Proximity => "proximity",
            MatchPhase::CrossTier => "cross_tier",
        };
        f.write_str(name)
    }
}

/// Unordered pair of record keys, stored smaller-first
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey(RecordKey, RecordKey);

impl PairKey {
    pub fn new(a: &RecordKey, b: &RecordKey) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }

    pub fn first(&self) -> &RecordKey {
        &self.0
    }

    pub fn second(&self) -> &RecordKey {
        &self.1
    }
}

/// A proposed same-site pair. `a` and `b` index the record slice the
/// matcher ran over; `records[a].key < records[b].key`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchProposal {
    pub a: usize,
    pub b: usize,
    pub phase: MatchPhase,
    /// Confidence in [0, 1]; phase 1 always scores 1.0
    pub score: f64,
    pub distance_m: Option<f64>,
}

impl MatchProposal {
    pub fn pair_key(&self, records: &[CanonicalRecord]) -> PairKey {
        PairKey::new(&records[self.a].key, &records[self.b].key)
    }
}

/// Combine distance closeness and attribute closeness into a pair score
pub(crate) fn pair_score(
    config: &MatcherConfig,
    distance_m: f64,
    radius_m: f64,
    attribute_closeness: f64,
) -> f64 {
    let distance_closeness = (1.0 - distance_m / radius_m).clamp(0.0, 1.0);
    let total_weight = config.distance_weight + config.attribute_weight;
    let score = (config.distance_weight * distance_closeness
        + config.attribute_weight * attribute_closeness.clamp(0.0, 1.0))
        / total_weight;
    score.clamp(0.0, 1.0)
}

/// Deterministic application order: phase, score (high first), the better
/// tier involved (higher tier first), then record keys.
pub fn sort_proposals(records: &[CanonicalRecord], proposals: &mut [MatchProposal]) {
    proposals.sort_by(|x, y| {
        let best_tier = |p: &MatchProposal| records[p.a].tier.min(records[p.b].tier);
        x.phase
            .cmp(&y.phase)
            .then(
                y.score
                    .partial_cmp(&x.score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(best_tier(x).cmp(&best_tier(y)))
            .then(records[x.a].key.cmp(&records[y.a].key))
            .then(records[x.b].key.cmp(&records[y.b].key))
    });
}

/// Pair evaluator for a proximity-style phase: `Some(score)` accepts
type Evaluator = dyn Fn(&CanonicalRecord, &CanonicalRecord, f64) -> Option<f64> + Send + Sync;

/// Multi-phase matcher
#[derive(Debug, Clone)]
pub struct Matcher {
    config: MatcherConfig,
    shard_cells: i32,
}

impl Matcher {
    pub fn new(config: MatcherConfig, shard_cells: i32) -> Self {
        Self {
            config,
            shard_cells: shard_cells.max(1),
        }
    }

    /// Run one phase over the records
    pub async fn propose(
        &self,
        phase: MatchPhase,
        records: Arc<Vec<CanonicalRecord>>,
        index: Arc<SpatialIndex>,
    ) -> Result<Vec<MatchProposal>> {
        let mut proposals = match phase {
            MatchPhase::ExactKey => exact_key::propose(&self.config, &records),
            MatchPhase::Proximity => {
                let config = self.config.clone();
                let radius_m = config.proximity.radius_m;
                let evaluate: Arc<Evaluator> =
                    Arc::new(move |a: &CanonicalRecord, b: &CanonicalRecord, d: f64| {
                        proximity::evaluate(&config, a, b, d)
                    });
                self.run_sharded(phase, radius_m, evaluate, records.clone(), index)
                    .await?
            }
            MatchPhase::CrossTier => {
                let config = self.config.clone();
                let radius_m = config.cross_tier.radius_m;
                let evaluate: Arc<Evaluator> =
                    Arc::new(move |a: &CanonicalRecord, b: &CanonicalRecord, d: f64| {
                        cross_tier::evaluate(&config, a, b, d)
                    });
                self.run_sharded(phase, radius_m, evaluate, records.clone(), index)
                    .await?
            }
        };

        sort_proposals(&records, &mut proposals);
        info!(phase = %phase, proposals = proposals.len(), "Matching phase complete");
        Ok(proposals)
    }

    /// Fan proposal generation out over groups of cells.
    ///
    /// Each pair is emitted only from its smaller-key side, so shards never
    /// produce the same pair twice.
    async fn run_sharded(
        &self,
        phase: MatchPhase,
        radius_m: f64,
        evaluate: Arc<Evaluator>,
        records: Arc<Vec<CanonicalRecord>>,
        index: Arc<SpatialIndex>,
    ) -> Result<Vec<MatchProposal>> {
        let mut shards: HashMap<(i32, i32), Vec<usize>> = HashMap::new();
        for (cell, ids) in index.cells() {
            let shard = (
                cell.0.div_euclid(self.shard_cells),
                cell.1.div_euclid(self.shard_cells),
            );
            shards.entry(shard).or_default().extend(ids.iter().copied());
        }
        let mut shards: Vec<_> = shards.into_iter().collect();
        shards.sort_by_key(|(shard, _)| *shard);

        debug!(phase = %phase, shards = shards.len(), "Dispatching proximity shards");

        let results: Vec<Result<Vec<MatchProposal>>> = stream::iter(shards)
            .map(|(shard, ids)| {
                let records = records.clone();
                let index = index.clone();
                let evaluate = evaluate.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        scan_shard(phase, radius_m, &ids, &records, &index, evaluate.as_ref())
                    })
                    .await
                    .with_context(|| format!("Proximity shard {:?} worker failed", shard))
                }
            })
            .buffer_unordered(self.config.workers)
            .collect()
            .await;

        let mut proposals = Vec::new();
        for result in results {
            proposals.extend(result?);
        }
        Ok(proposals)
    }
}

fn scan_shard(
    phase: MatchPhase,
    radius_m: f64,
    ids: &[usize],
    records: &[CanonicalRecord],
    index: &SpatialIndex,
    evaluate: &Evaluator,
) -> Vec<MatchProposal> {
    let mut proposals = Vec::new();
    for &id in ids {
        let Some(center) = index.point(id) else {
            continue;
        };
        let a = &records[id];
        for neighbor in index.query(center, radius_m) {
            let b = &records[neighbor.id];
            if a.key >= b.key {
                continue;
            }
            if let Some(score) = evaluate(a, b, neighbor.distance_m) {
                proposals.push(MatchProposal {
                    a: id,
                    b: neighbor.id,
                    phase,
                    score,
                    distance_m: Some(neighbor.distance_m),
                });
            }
        }
    }
    proposals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProducerTier;

    fn record(producer: &str, id: &str, tier: u8, lat: f64, lon: f64, capacity: f64) -> CanonicalRecord {
        CanonicalRecord::new(RecordKey::new(producer, id), ProducerTier::new(tier).unwrap())
            .with_location(lat, lon)
            .with_capacity(capacity)
    }

    #[test]
    fn test_pair_key_is_unordered() {
        let a = RecordKey::new("x", "1");
        let b = RecordKey::new("y", "1");
        assert_eq!(PairKey::new(&a, &b), PairKey::new(&b, &a));
        assert_eq!(PairKey::new(&b, &a).first(), &a);
    }

    #[test]
    fn test_pair_score_bounds() {
        let config = MatcherConfig::default();
        assert_eq!(pair_score(&config, 0.0, 2_000.0, 1.0), 1.0);
        assert_eq!(pair_score(&config, 2_000.0, 2_000.0, 0.0), 0.0);
        let mid = pair_score(&config, 1_000.0, 2_000.0, 0.5);
        assert!((mid - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_sharded_proposals_match_across_shards() {
        // Shard size of one cell forces neighbors into different shards
        let matcher = Matcher::new(MatcherConfig::default(), 1);
        let records = Arc::new(vec![
            record("city", "1", 3, 40.0, -75.0, 5.0),
            record("eia", "1", 1, 40.0008, -75.0009, 5.2),
            record("eia", "2", 1, 40.0, -74.4, 5.0), // ~50 km east
        ]);
        let index = Arc::new(SpatialIndex::build(&records, 0.05));

        let proposals = matcher
            .propose(MatchPhase::Proximity, records.clone(), index)
            .await
            .unwrap();

        assert_eq!(proposals.len(), 1);
        let pair = proposals[0].pair_key(&records);
        assert_eq!(pair.first(), &RecordKey::new("city", "1"));
        assert_eq!(pair.second(), &RecordKey::new("eia", "1"));
    }

    #[test]
    fn test_sort_prefers_score_then_tier() {
        let records = vec![
            record("a", "1", 3, 0.0, 0.0, 1.0),
            record("b", "1", 3, 0.0, 0.0, 1.0),
            record("c", "1", 1, 0.0, 0.0, 1.0),
        ];
        let mut proposals = vec![
            MatchProposal { a: 0, b: 1, phase: MatchPhase::Proximity, score: 0.8, distance_m: None },
            MatchProposal { a: 0, b: 2, phase: MatchPhase::Proximity, score: 0.8, distance_m: None },
            MatchProposal { a: 1, b: 2, phase: MatchPhase::ExactKey, score: 1.0, distance_m: None },
            MatchProposal { a: 1, b: 2, phase: MatchPhase::Proximity, score: 0.9, distance_m: None },
        ];
        sort_proposals(&records, &mut proposals);

        assert_eq!(proposals[0].phase, MatchPhase::ExactKey);
        assert_eq!(proposals[1].score, 0.9);
        // Equal scores: the pair involving the tier-1 record goes first
        assert_eq!((proposals[2].a, proposals[2].b), (0, 2));
        assert_eq!((proposals[3].a, proposals[3].b), (0, 1));
    }
}
