// Name and capacity comparison helpers shared by the matching phases

use std::collections::BTreeSet;

/// Tokens that say nothing about which site a name denotes
const STOPWORDS: &[&str] = &[
    "the", "of", "and", "llc", "inc", "corp", "corporation", "co", "company", "ltd", "lp",
    "llp", "plc", "project", "facility", "site", "plant", "station", "power", "energy",
    "solar", "pv", "wind", "farm", "generating", "generation", "center", "centre",
];

/// Lowercased alphanumeric tokens with stopwords removed
pub fn name_tokens(name: &str) -> BTreeSet<String> {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Jaccard overlap of normalized name tokens.
///
/// None when either side has no name or normalizes to nothing, so callers
/// can tell "names disagree" from "names cannot be compared".
pub fn name_overlap(a: Option<&str>, b: Option<&str>) -> Option<f64> {
    let a = name_tokens(a?);
    let b = name_tokens(b?);
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let shared = a.intersection(&b).count();
    let union = a.union(&b).count();
    Some(shared as f64 / union as f64)
}

/// |a - b| / max(a, b); None when either capacity is unknown
pub fn capacity_relative_diff(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    let (a, b) = (a?, b?);
    let larger = a.max(b);
    if larger <= 0.0 {
        return Some(0.0);
    }
    Some((a - b).abs() / larger)
}
