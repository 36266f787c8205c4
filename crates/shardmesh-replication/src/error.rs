//! Replication error types.

use shardmesh_p2p::P2pError;
use shardmesh_storage::StorageError;
use shardmesh_types::NodeId;
use thiserror::Error;

/// Errors raised by distribution, transfer, sync and rebalancing.
///
/// Single-target operations return these directly. Multi-target operations
/// log per-target failures and fold them into their reports instead.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A dataset or shard is unknown locally.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of record.
        resource: &'static str,
        /// Its id.
        id: String,
    },

    /// A peer could not be reached or answered with garbage.
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable {
        /// The peer.
        peer: NodeId,
        /// Underlying failure.
        reason: String,
    },

    /// A shard transfer was refused or did not complete.
    #[error("transfer of {shard_id} to/from {peer} failed: {reason}")]
    TransferFailed {
        /// The shard.
        shard_id: String,
        /// The other side.
        peer: NodeId,
        /// Why.
        reason: String,
    },

    /// Local serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Local storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A peer answered with an error status.
    #[error("peer {peer} rejected request: {reason}")]
    Rejected {
        /// The peer.
        peer: NodeId,
        /// Message returned by the peer.
        reason: String,
    },
}

impl ReplicationError {
    /// Creates a not-found error for a dataset.
    #[must_use]
    pub fn dataset_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: "dataset",
            id: id.into(),
        }
    }

    /// Creates a not-found error for a shard.
    #[must_use]
    pub fn shard_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: "shard",
            id: id.into(),
        }
    }

    /// Classifies a P2P failure talking to `peer`. Transport failures and
    /// malformed answers mean the peer is unreachable; error statuses mean
    /// it refused.
    #[must_use]
    pub fn from_peer(peer: &NodeId, error: P2pError) -> Self {
        if error.is_peer_failure() {
            Self::PeerUnreachable {
                peer: peer.clone(),
                reason: error.to_string(),
            }
        } else {
            Self::Rejected {
                peer: peer.clone(),
                reason: error.to_string(),
            }
        }
    }

    /// Whether the error is about one peer rather than local state.
    #[must_use]
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            Self::PeerUnreachable { .. } | Self::TransferFailed { .. } | Self::Rejected { .. }
        )
    }
}

impl From<ReplicationError> for P2pError {
    fn from(e: ReplicationError) -> Self {
        P2pError::Handler(e.to_string())
    }
}

/// A specialized Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;
