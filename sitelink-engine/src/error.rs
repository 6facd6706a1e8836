//! Error types for sitelink-engine
//!
//! Nothing in the engine is user-visible in real time: ingest problems become
//! counted skips, store problems become per-record failures in the run report.
//! These types carry enough classification for that report.

use serde::Serialize;
use thiserror::Error;

/// Why a raw candidate was dropped at the ingest boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum IngestError {
    #[error("missing source_record_id")]
    MissingKey,

    #[error("producer name missing or contains ':'")]
    InvalidProducer,

    #[error("no tier configured or supplied for producer")]
    MissingTier,

    #[error("coordinates out of range or only half present")]
    CoordinatesOutOfRange,

    #[error("non-finite or negative numeric field")]
    NonFiniteNumber,

    #[error("line is not a valid candidate document")]
    Unparseable,
}

/// Failure category reported for rows the applier could not write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Retries exhausted on timeouts, locks, connection resets
    Transient,
    /// The store refused this specific record
    Rejected,
    /// Heterogeneous key sets inside one batch (engine bug)
    BatchShape,
}

/// Datastore error
#[derive(Debug, Error)]
pub enum StoreError {
    /// Timeout, lock contention, connection reset, 5xx. Worth retrying.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// The store refused the write. `key` names the offending row when known.
    #[error("store rejected write{}: {reason}", .key.as_ref().map(|k| format!(" for {k}")).unwrap_or_default())]
    Rejected { key: Option<String>, reason: String },

    /// Rows within one batch do not share a key set
    #[error("batch key-set mismatch: {0}")]
    BatchShape(String),

    /// Unclassified database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Retrying the identical request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient(_) => true,
            StoreError::Database(err) => is_transient_sqlx(err),
            StoreError::Rejected { .. } | StoreError::BatchShape(_) => false,
        }
    }

    /// Normalize a sqlx error into transient vs rejected
    pub fn classify(err: sqlx::Error) -> Self {
        if is_transient_sqlx(&err) {
            return StoreError::Transient(err.to_string());
        }
        match err {
            sqlx::Error::Database(db_err) => StoreError::Rejected {
                key: None,
                reason: db_err.message().to_string(),
            },
            other => StoreError::Database(other),
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            message.contains("database is locked") || message.contains("database is busy")
        }
        _ => false,
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
