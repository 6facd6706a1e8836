//! Reconciliation pipeline
//!
//! One batch run, end to end:
//!
//! 1. Load the persisted snapshot and seed the entity graph
//! 2. Admit this run's records (sorted by key)
//! 3. Build the spatial index
//! 4. For each matching phase: propose (parallel), then merge (single writer)
//! 5. Drain changed rows and hand them to the patch applier
//!
//! Re-running with the same input converges: every write is fill-if-unset,
//! overwrite-if-higher-tier or raise-precision.

pub mod statistics;

use crate::applier::PatchApplier;
use crate::graph::EntityGraph;
use crate::ingest::{IngestBatch, Ingestor};
use crate::matcher::{MatchPhase, Matcher};
use crate::spatial::SpatialIndex;
use crate::store::Datastore;
use crate::utils::retry::{retry_transient, RetryPolicy};
use anyhow::{Context, Result};
use chrono::Utc;
use sitelink_common::EngineConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub use statistics::{PatchCounts, PhaseStats, RunReport};

/// Read and validate candidate files as one ingest run
pub fn ingest_files(config: &EngineConfig, paths: &[PathBuf]) -> Result<IngestBatch> {
    let mut readers = Vec::with_capacity(paths.len());
    for path in paths {
        let file = File::open(path).with_context(|| format!("Open {} failed", path.display()))?;
        readers.push(BufReader::new(file));
    }
    Ingestor::new(&config.tiers, config.default_tier)
        .ingest_jsonl_sources(readers)
        .context("Read candidate input failed")
}

pub struct Pipeline {
    config: EngineConfig,
    store: Arc<dyn Datastore>,
    dry_run: bool,
}

impl Pipeline {
    pub fn new(config: EngineConfig, store: Arc<dyn Datastore>) -> Self {
        Self {
            config,
            store,
            dry_run: false,
        }
    }

    /// Match and resolve without writing
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run(&self, batch: IngestBatch) -> Result<RunReport> {
        let started_at = Utc::now();
        let IngestBatch { records, stats: ingest } = batch;

        let policy = RetryPolicy::from_config(&self.config.applier);
        let store = self.store.as_ref();
        let snapshot = retry_transient("load snapshot", policy, move || store.load_snapshot())
            .await
            .context("Load datastore snapshot failed")?;

        let mut graph = EntityGraph::new(self.config.crossref.cap);
        graph.seed(snapshot);
        for record in &records {
            graph.admit(record);
        }

        let records = Arc::new(records);
        let index = Arc::new(SpatialIndex::build(&records, self.config.spatial.cell_km));
        info!(
            records = records.len(),
            located = index.len(),
            "Spatial index built"
        );

        let matcher = Matcher::new(self.config.matcher.clone(), self.config.spatial.shard_cells);
        let mut phases = Vec::with_capacity(MatchPhase::ALL.len());
        for phase in MatchPhase::ALL {
            let proposals = matcher
                .propose(phase, records.clone(), index.clone())
                .await
                .with_context(|| format!("Matching phase {} failed", phase))?;

            let mut stats = PhaseStats::new(phase);
            stats.proposed = proposals.len();
            for proposal in &proposals {
                let outcome = graph.merge(proposal, &records);
                stats.record(&outcome);
            }
            info!(
                phase = %phase,
                proposed = stats.proposed,
                merged = stats.merged,
                linked = stats.linked,
                rejected = stats.rejected,
                "Phase applied"
            );
            phases.push(stats);
        }

        let patches = graph.drain_patches();
        let conflicts = graph.take_conflicts();
        let patch_counts = PatchCounts {
            entities: patches.entities.len(),
            candidates: patches.candidates.len(),
        };

        let applier = if self.dry_run {
            info!(
                entities = patch_counts.entities,
                candidates = patch_counts.candidates,
                "Dry run: skipping writes"
            );
            None
        } else {
            let applier = PatchApplier::new(self.store.clone(), self.config.applier.clone());
            Some(applier.apply(&patches).await.into())
        };

        Ok(RunReport {
            started_at,
            finished_at: Utc::now(),
            dry_run: self.dry_run,
            ingest,
            phases,
            graph: graph.stats().clone(),
            live_entities: graph.live_entities().count(),
            patches: patch_counts,
            applier,
            conflicts,
        })
    }
}
