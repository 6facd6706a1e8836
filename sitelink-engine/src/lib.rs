//! sitelink-engine library interface
//!
//! Cross-source record linkage and field reconciliation for power-generation
//! sites. Exposes the pipeline stages for the `sitelink` binary and for
//! integration tests.

pub mod applier;
pub mod crossref;
pub mod error;
pub mod graph;
pub mod ingest;
pub mod matcher;
pub mod pipeline;
pub mod resolver;
pub mod spatial;
pub mod store;
pub mod types;
pub mod utils;

pub use crate::error::{FailureCategory, IngestError, StoreError, StoreResult};
pub use crate::pipeline::{Pipeline, RunReport};
pub use crate::store::{Datastore, SqliteDatastore};
pub use crate::types::{CanonicalRecord, Entity, ProducerTier, RecordKey};
