//! sitelink - batch reconciliation run
//!
//! Reads JSON-lines candidate files, links candidates that describe the same
//! site, merges their fields, and writes entities and candidate assignments
//! to the SQLite datastore. Prints (or writes) a JSON run report.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sitelink_common::EngineConfig;
use sitelink_engine::pipeline::{self, Pipeline};
use sitelink_engine::SqliteDatastore;
use tracing::{info, warn};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

/// Filter used until the configuration is loaded
const BOOTSTRAP_LEVEL: &str = "info";

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Command-line arguments for sitelink
#[derive(Parser, Debug)]
#[command(name = "sitelink")]
#[command(about = "Cross-source site reconciliation engine")]
#[command(version)]
struct Args {
    /// Configuration file (TOML); otherwise SITELINK_CONFIG, then the user
    /// config directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite datastore path
    #[arg(short, long, default_value = "sitelink.db", env = "SITELINK_DATABASE")]
    database: PathBuf,

    /// Write the JSON run report here instead of stdout
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Match and resolve without writing to the datastore
    #[arg(long)]
    dry_run: bool,

    /// Candidate files, one JSON document per line
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (filter_handle, filter_from_env) = init_logging();

    let config = EngineConfig::resolve(args.config.as_deref()).context("Failed to load configuration")?;

    // RUST_LOG wins; otherwise the configured level
    if !filter_from_env {
        apply_configured_level(&filter_handle, &config.logging.level)?;
    }

    info!(
        inputs = args.inputs.len(),
        database = %args.database.display(),
        dry_run = args.dry_run,
        producers = config.tiers.len(),
        "Starting sitelink run"
    );
    if config.tiers.is_empty() && config.default_tier.is_none() {
        warn!("No tier table configured; candidates must carry producer_tier");
    }

    let batch = pipeline::ingest_files(&config, &args.inputs)?;

    let store = SqliteDatastore::open(&args.database)
        .await
        .with_context(|| format!("Failed to open datastore {}", args.database.display()))?;

    let report = Pipeline::new(config, Arc::new(store))
        .dry_run(args.dry_run)
        .run(batch)
        .await?;

    let json = report.to_json().context("Failed to serialize run report")?;
    match &args.report {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write report {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }

    if report.failed_records() > 0 {
        warn!(failed = report.failed_records(), "Some rows were not written");
    }
    info!(live_entities = report.live_entities, "Run complete");
    Ok(())
}

/// Install the stderr subscriber. The filter comes from RUST_LOG when set
/// (returned flag true), otherwise starts at `BOOTSTRAP_LEVEL` and can be
/// replaced once the configuration is known.
fn init_logging() -> (FilterHandle, bool) {
    let env_filter = EnvFilter::try_from_default_env().ok();
    let from_env = env_filter.is_some();
    let (filter, handle) =
        reload::Layer::new(env_filter.unwrap_or_else(|| EnvFilter::new(BOOTSTRAP_LEVEL)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    (handle, from_env)
}

/// Swap in the `[logging].level` filter
fn apply_configured_level(handle: &FilterHandle, level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .with_context(|| format!("Invalid logging.level '{}'", level))?;
    handle
        .reload(filter)
        .context("Failed to apply configured log level")
}
