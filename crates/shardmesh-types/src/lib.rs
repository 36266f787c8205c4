//! Common types used throughout `shardmesh`.
//!
//! This crate provides the data model shared by every node in a shardmesh
//! cluster: dataset and shard metadata records, node identities and roles,
//! millisecond timestamps used as sync versions, and the query/result types
//! exchanged by federated search.

mod dataset;
mod error;
mod node;
mod search;
mod timestamp;

pub use dataset::{shard_id_for, DatasetMetadata, NewDataset, ShardMetadata};
pub use error::{Result, TypesError};
pub use node::{NodeId, NodeRole, PeerInfo};
pub use search::{Record, SearchHit, SearchQuery, SearchRequest};
pub use timestamp::Timestamp;
