//! Common error types for sitelink

use thiserror::Error;

/// Common result type for sitelink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the sitelink crates
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),
}
