//! Error types for shardmesh core types.

use thiserror::Error;

/// Errors raised while parsing or validating core types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    /// A node role string did not name a known role.
    #[error("unknown node role '{0}', expected coordinator, worker, hybrid or client")]
    UnknownRole(String),

    /// A peer descriptor could not be parsed.
    #[error("invalid peer descriptor '{input}': {reason}")]
    InvalidPeer {
        /// The raw descriptor.
        input: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// A node identifier was empty or malformed.
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
}

/// A specialized Result type for core type operations.
pub type Result<T> = std::result::Result<T, TypesError>;
