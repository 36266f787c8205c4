//! Search error types.

use shardmesh_p2p::P2pError;
use shardmesh_storage::StorageError;
use thiserror::Error;

/// Errors raised by search.
///
/// Peer failures during fan-out are not errors; they only shrink the result.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The query is unusable.
    #[error("invalid query: {0}")]
    InvalidArgument(String),

    /// No node knows the dataset.
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    /// Local storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<SearchError> for P2pError {
    fn from(e: SearchError) -> Self {
        P2pError::Handler(e.to_string())
    }
}

/// A specialized Result type for search operations.
pub type Result<T> = std::result::Result<T, SearchError>;
