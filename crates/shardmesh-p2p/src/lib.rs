//! # Shardmesh P2P
//!
//! Peer networking layer for shardmesh.
//!
//! This crate defines the request/response messages of every shardmesh
//! protocol, the [`PeerTransport`] abstraction with an in-process
//! ([`MemoryNetwork`]) and a TCP ([`TcpTransport`]) implementation, the
//! [`ProtocolRouter`] that dispatches inbound streams to handlers, and node
//! identity and gossip-based [`Membership`].

#![forbid(unsafe_code)]

mod error;
pub mod frame;
mod identity;
mod memory;
mod membership;
pub mod message;
mod router;
mod tcp;
mod transport;

pub use error::{P2pError, ProtocolError, Result};
pub use identity::NodeIdentity;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use membership::{DiscoveryHandler, Membership};
pub use message::{Response, Status, WireRequest};
pub use router::{InboundStream, ProtocolHandler, ProtocolRouter};
pub use tcp::{decode_hello, TcpTransport};
pub use transport::{
    read_json, read_request, read_response, write_json, write_response, PeerClient, PeerStream,
    PeerTransport,
};

use std::time::Duration;

/// Protocol names.
pub mod protocols {
    pub const DISCOVERY: &str = "discovery";
    pub const SHARD_DISCOVERY: &str = "shard-discovery";
    pub const SHARD_TRANSFER: &str = "shard-transfer";
    pub const SHARD_SYNC: &str = "shard-sync";
    pub const METADATA_SYNC: &str = "metadata-sync";
    pub const FEDERATED_SEARCH: &str = "federated-search";
}

/// Default port for peer traffic.
pub const DEFAULT_PORT: u16 = 7400;

/// Default timeout for one outbound request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest frame accepted on the wire.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
