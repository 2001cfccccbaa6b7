//! Error types for the asset-cache crate

use std::io;
use thiserror::Error;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache operations
#[derive(Debug, Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Key is empty or contains a path separator, dot, or whitespace
    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
