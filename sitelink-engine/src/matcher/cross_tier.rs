// Phase 3: broad cross-tier matching
//
// Only pairs from different producer tiers, within a narrower radius. When
// both capacities are known they must agree within the tight tolerance; when
// they cannot be compared, names decide; when neither can be compared the
// pair may be accepted on proximity alone. Same-tier pairs never match here,
// which keeps municipal permits from chaining into each other.

use super::pair_score;
use super::similarity::{capacity_relative_diff, name_overlap};
use crate::types::{Attribute, CanonicalRecord};
use sitelink_common::config::MatcherConfig;

pub fn evaluate(
    config: &MatcherConfig,
    a: &CanonicalRecord,
    b: &CanonicalRecord,
    distance_m: f64,
) -> Option<f64> {
    let thresholds = &config.cross_tier;
    if a.tier == b.tier || distance_m > thresholds.radius_m {
        return None;
    }

    let closeness = match capacity_relative_diff(a.capacity_mw, b.capacity_mw) {
        Some(diff) if diff <= thresholds.capacity_tolerance => {
            1.0 - diff / thresholds.capacity_tolerance
        }
        Some(_) => return None,
        None => match name_overlap(a.attribute(Attribute::Name), b.attribute(Attribute::Name)) {
            Some(overlap) if overlap >= thresholds.name_overlap_min => overlap,
            Some(_) => return None,
            None if config.cross_tier_proximity_only => 0.0,
            None => return None,
        },
    };

    Some(pair_score(config, distance_m, thresholds.radius_m, closeness))
}
