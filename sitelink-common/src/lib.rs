//! # sitelink common library
//!
//! Shared code for the sitelink reconciliation workspace:
//! - Error and result types
//! - TOML configuration (matcher thresholds, producer tier table, applier tuning)
//! - Configuration file resolution

pub mod config;
pub mod error;

pub use config::{EngineConfig, TierTable};
pub use error::{Error, Result};
