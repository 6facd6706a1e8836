//! Configuration loading and config file resolution
//!
//! Matching thresholds drift between producer pairings, so every threshold the
//! engine uses lives here rather than in matcher code. The producer tier table
//! is injected the same way: adding a producer never touches matching logic.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SITELINK_CONFIG";

/// File name looked up in the user config directory
pub const CONFIG_FILE_NAME: &str = "sitelink.toml";

/// Top-level engine configuration (`sitelink.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub logging: LoggingConfig,
    pub spatial: SpatialConfig,
    pub matcher: MatcherConfig,
    pub crossref: CrossrefConfig,
    pub applier: ApplierConfig,
    /// Producer name → tier rank (1 outranks 2)
    pub tiers: TierTable,
    /// Rank for producers missing from `tiers` whose records carry no tier
    pub default_tier: Option<u8>,
}

/// Logging section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Spatial index tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpatialConfig {
    /// Cell edge length in kilometres
    pub cell_km: f64,
    /// Cells per shard edge when fanning proximity work out to workers
    pub shard_cells: i32,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            cell_km: 2.5,
            shard_cells: 8,
        }
    }
}

/// Thresholds for one proximity-based matching phase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseThresholds {
    /// Search radius in metres
    pub radius_m: f64,
    /// Maximum relative capacity difference (0.35 = ±35%)
    pub capacity_tolerance: f64,
    /// Minimum token overlap (Jaccard) between normalized names
    pub name_overlap_min: f64,
}

/// Matcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatcherConfig {
    /// External id namespaces that uniquely denote one registration.
    /// Empty means every namespace a record carries is trusted.
    pub exact_key_namespaces: Vec<String>,
    pub proximity: PhaseThresholds,
    pub cross_tier: PhaseThresholds,
    /// Accept cross-tier pairs on distance alone when neither capacity nor
    /// names can be compared
    pub cross_tier_proximity_only: bool,
    /// Weight of distance closeness in the pair score
    pub distance_weight: f64,
    /// Weight of capacity (or name) closeness in the pair score
    pub attribute_weight: f64,
    /// Worker pool size for sharded proximity phases
    pub workers: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            exact_key_namespaces: Vec::new(),
            proximity: PhaseThresholds {
                radius_m: 2_000.0,
                capacity_tolerance: 0.35,
                name_overlap_min: 0.5,
            },
            cross_tier: PhaseThresholds {
                radius_m: 750.0,
                capacity_tolerance: 0.15,
                name_overlap_min: 0.5,
            },
            cross_tier_proximity_only: true,
            distance_weight: 0.6,
            attribute_weight: 0.4,
            workers: 4,
        }
    }
}

/// Crossref ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrossrefConfig {
    /// Maximum links kept per candidate
    pub cap: usize,
}

impl Default for CrossrefConfig {
    fn default() -> Self {
        Self { cap: 20 }
    }
}

/// Patch applier configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplierConfig {
    /// Rows per batch write
    pub batch_size: usize,
    /// Batches in flight at once
    pub concurrency: usize,
    /// Attempts per batch before a transient failure is reported
    pub max_attempts: u32,
    /// First backoff delay
    pub base_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            concurrency: 4,
            max_attempts: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

/// Producer → tier rank table
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct TierTable(BTreeMap<String, u8>);

impl TierTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, producer: impl Into<String>, rank: u8) -> Self {
        self.0.insert(producer.into(), rank);
        self
    }

    /// Configured rank for `producer`, if any
    pub fn rank_for(&self, producer: &str) -> Option<u8> {
        self.0.get(producer).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl EngineConfig {
    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Resolve and load configuration.
    ///
    /// Priority order:
    /// 1. Command-line argument
    /// 2. `SITELINK_CONFIG` environment variable
    /// 3. `<user config dir>/sitelink/sitelink.toml`
    /// 4. Compiled defaults
    ///
    /// An explicitly named file (1 or 2) must exist. A missing user config
    /// file falls back to defaults with a warning.
    pub fn resolve(cli_arg: Option<&Path>) -> Result<Self> {
        if let Some(path) = cli_arg {
            info!("Loading config from command line: {}", path.display());
            return Self::load(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                info!("Loading config from {}: {}", CONFIG_ENV_VAR, path);
                return Self::load(Path::new(&path));
            }
        }

        match user_config_path() {
            Some(path) if path.exists() => {
                info!("Loading config from {}", path.display());
                Self::load(&path)
            }
            Some(path) => {
                warn!(
                    "No config file at {}, using compiled defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                warn!("Could not determine config directory, using compiled defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, msg: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::Config(msg.to_string()))
            }
        }

        check(self.spatial.cell_km > 0.0, "spatial.cell_km must be positive")?;
        check(self.spatial.shard_cells >= 1, "spatial.shard_cells must be at least 1")?;

        for (name, phase) in [
            ("matcher.proximity", &self.matcher.proximity),
            ("matcher.cross_tier", &self.matcher.cross_tier),
        ] {
            check(
                phase.radius_m > 0.0 && phase.radius_m.is_finite(),
                &format!("{name}.radius_m must be positive"),
            )?;
            check(
                phase.capacity_tolerance > 0.0 && phase.capacity_tolerance <= 1.0,
                &format!("{name}.capacity_tolerance must be in (0, 1]"),
            )?;
            check(
                (0.0..=1.0).contains(&phase.name_overlap_min),
                &format!("{name}.name_overlap_min must be in [0, 1]"),
            )?;
        }

        check(
            self.matcher.distance_weight >= 0.0
                && self.matcher.attribute_weight >= 0.0
                && self.matcher.distance_weight + self.matcher.attribute_weight > 0.0,
            "matcher weights must be non-negative and not both zero",
        )?;
        check(self.matcher.workers >= 1, "matcher.workers must be at least 1")?;
        check(self.crossref.cap >= 1, "crossref.cap must be at least 1")?;
        check(self.applier.batch_size >= 1, "applier.batch_size must be at least 1")?;
        check(self.applier.concurrency >= 1, "applier.concurrency must be at least 1")?;
        check(self.applier.max_attempts >= 1, "applier.max_attempts must be at least 1")?;
        check(
            self.applier.base_backoff_ms <= self.applier.max_backoff_ms,
            "applier.base_backoff_ms must not exceed applier.max_backoff_ms",
        )?;

        if self.matcher.cross_tier.radius_m > self.matcher.proximity.radius_m {
            warn!(
                cross_tier_radius_m = self.matcher.cross_tier.radius_m,
                proximity_radius_m = self.matcher.proximity.radius_m,
                "Cross-tier radius is wider than the proximity radius"
            );
        }

        Ok(())
    }
}

/// `<user config dir>/sitelink/sitelink.toml`
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("sitelink").join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.crossref.cap, 20);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            default_tier = 4

            [crossref]
            cap = 5

            [tiers]
            eia = 1
            city_permits = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.crossref.cap, 5);
        assert_eq!(config.default_tier, Some(4));
        assert_eq!(config.tiers.rank_for("eia"), Some(1));
        assert_eq!(config.tiers.rank_for("city_permits"), Some(3));
        assert_eq!(config.tiers.rank_for("unknown"), None);
        assert_eq!(config.applier, ApplierConfig::default());
    }

    #[test]
    fn test_invalid_tolerance_rejected() {
        let result = EngineConfig::from_toml_str(
            r#"
            [matcher.proximity]
            radius_m = 2000.0
            capacity_tolerance = 1.5
            name_overlap_min = 0.5
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_cap_rejected() {
        let result = EngineConfig::from_toml_str("[crossref]\ncap = 0\n");
        assert!(result.is_err());
    }
}
