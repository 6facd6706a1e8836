//! Run statistics
//!
//! Everything a run reports once it finishes, serialized as JSON for the
//! `--report` file.

use crate::applier::{ApplyReport, FailedRecord};
use crate::error::FailureCategory;
use crate::graph::{GraphStats, MergeOutcome};
use crate::ingest::IngestStats;
use crate::matcher::MatchPhase;
use crate::resolver::ConflictReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-phase proposal accounting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseStats {
    pub phase: MatchPhase,
    pub proposed: usize,
    pub merged: usize,
    /// Edge added between records already sharing an entity
    pub linked: usize,
    pub duplicates: usize,
    /// Pair already merged by an earlier phase
    pub skipped: usize,
    pub rejected: usize,
}

impl PhaseStats {
    pub fn new(phase: MatchPhase) -> Self {
        Self {
            phase,
            proposed: 0,
            merged: 0,
            linked: 0,
            duplicates: 0,
            skipped: 0,
            rejected: 0,
        }
    }

    pub fn record(&mut self, outcome: &MergeOutcome) {
        match outcome {
            MergeOutcome::Merged { .. } => self.merged += 1,
            MergeOutcome::Linked => self.linked += 1,
            MergeOutcome::Duplicate => self.duplicates += 1,
            MergeOutcome::AlreadyMerged => self.skipped += 1,
            MergeOutcome::Rejected(_) | MergeOutcome::UnknownRecord => self.rejected += 1,
        }
    }
}

/// Rows handed to the applier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PatchCounts {
    pub entities: usize,
    pub candidates: usize,
}

/// Applier totals; absent on a dry run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplierStats {
    pub inserted: usize,
    pub updated: usize,
    pub batches: usize,
    pub reshaped_batches: usize,
    pub failures_by_category: BTreeMap<FailureCategory, usize>,
    pub failed: Vec<FailedRecord>,
}

impl From<ApplyReport> for ApplierStats {
    fn from(report: ApplyReport) -> Self {
        Self {
            failures_by_category: report.failures_by_category(),
            inserted: report.inserted,
            updated: report.updated,
            batches: report.batches,
            reshaped_batches: report.reshaped_batches,
            failed: report.failed,
        }
    }
}

/// Post-run report
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub ingest: IngestStats,
    pub phases: Vec<PhaseStats>,
    pub graph: GraphStats,
    pub live_entities: usize,
    pub patches: PatchCounts,
    pub applier: Option<ApplierStats>,
    pub conflicts: Vec<ConflictReport>,
}

impl RunReport {
    pub fn phase(&self, phase: MatchPhase) -> Option<&PhaseStats> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Rows the applier could not write
    pub fn failed_records(&self) -> usize {
        self.applier.as_ref().map_or(0, |a| a.failed.len())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
