//! P2P error types.

use shardmesh_types::NodeId;
use thiserror::Error;

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The bytes do not form a valid message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A frame exceeds the size limit.
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge {
        /// Declared size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// The request names an action the protocol does not define.
    #[error("unknown action '{action}' for protocol '{protocol}'")]
    UnknownAction {
        /// Protocol the request was sent on.
        protocol: &'static str,
        /// The offending action.
        action: String,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur during P2P operations.
#[derive(Debug, Error)]
pub enum P2pError {
    /// Connection to the peer could not be established.
    #[error("connection to {peer} failed: {reason}")]
    Connection {
        /// Target peer.
        peer: NodeId,
        /// What went wrong.
        reason: String,
    },

    /// No address is known for the peer.
    #[error("peer not found: {0}")]
    PeerNotFound(NodeId),

    /// The peer did not answer in time.
    #[error("request to {peer} on '{protocol}' timed out")]
    Timeout {
        /// Target peer.
        peer: NodeId,
        /// Protocol name.
        protocol: String,
    },

    /// The other side closed the stream.
    #[error("stream closed")]
    StreamClosed,

    /// No handler is registered for the protocol.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// The peer answered with a non-success status.
    #[error("peer answered {status}: {message}")]
    Remote {
        /// Response status.
        status: crate::Status,
        /// Error message sent by the peer.
        message: String,
    },

    /// Wire protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A local handler failed.
    #[error("handler error: {0}")]
    Handler(String),
}

impl P2pError {
    /// Whether the error means the peer could not be used, as opposed to a
    /// local failure. Malformed responses count as peer failures.
    #[must_use]
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::PeerNotFound(_)
                | Self::Timeout { .. }
                | Self::StreamClosed
                | Self::Io(_)
                | Self::Protocol(_)
        )
    }
}

impl From<serde_json::Error> for P2pError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(ProtocolError::Serialization(e))
    }
}

/// A specialized Result type for P2P operations.
pub type Result<T> = std::result::Result<T, P2pError>;
