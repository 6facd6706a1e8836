// Phase 1: exact foreign-key matching
//
// Records sharing a registration id from a trusted namespace denote the same
// site unconditionally. Each key group is linked as a star around its anchor
// (highest tier, then smallest key) so a group of k records produces k-1
// pairs instead of k(k-1)/2 crossref edges.

use super::{MatchPhase, MatchProposal, PairKey};
use crate::types::CanonicalRecord;
use sitelink_common::config::MatcherConfig;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub fn propose(config: &MatcherConfig, records: &[CanonicalRecord]) -> Vec<MatchProposal> {
    let trusted = |namespace: &str| {
        config.exact_key_namespaces.is_empty()
            || config.exact_key_namespaces.iter().any(|n| n == namespace)
    };

    let mut groups: BTreeMap<(&str, &str), Vec<usize>> = BTreeMap::new();
    for (id, record) in records.iter().enumerate() {
        for (namespace, value) in &record.external_ids {
            if trusted(namespace) {
                groups
                    .entry((namespace.as_str(), value.as_str()))
                    .or_default()
                    .push(id);
            }
        }
    }

    let mut seen: BTreeSet<PairKey> = BTreeSet::new();
    let mut proposals = Vec::new();

    for ((namespace, value), members) in groups {
        if members.len() < 2 {
            continue;
        }
        let Some(&anchor) = members
            .iter()
            .min_by(|&&x, &&y| records[x].tier.cmp(&records[y].tier).then(records[x].key.cmp(&records[y].key)))
        else {
            continue;
        };

        debug!(namespace, value, members = members.len(), "Exact key group");

        for &other in &members {
            if other == anchor || records[other].key == records[anchor].key {
                continue;
            }
            let pair = PairKey::new(&records[anchor].key, &records[other].key);
            if !seen.insert(pair) {
                continue;
            }
            let (a, b) = if records[anchor].key < records[other].key {
                (anchor, other)
            } else {
                (other, anchor)
            };
            proposals.push(MatchProposal {
                a,
                b,
                phase: MatchPhase::ExactKey,
                score: 1.0,
                distance_m: None,
            });
        }
    }

    proposals
}
