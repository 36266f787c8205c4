//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored record could not be decoded.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Records could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store was used before `open` or after `close`.
    #[error("metadata store is closed")]
    Closed,

    /// The underlying database reported an error.
    #[error("backend error: {0}")]
    Backend(String),
}
