//! # Shardmesh Node
//!
//! A node of the shardmesh peer mesh.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 Shardmesh Node                │
//! ├───────────────────────────────────────────────┤
//! │  HTTP API (axum)                              │
//! │   datasets · records · search · sync · ...    │
//! ├───────────────────────────────────────────────┤
//! │  Replication            │  Federated search   │
//! │   sharding, transfer,   │   scatter-gather,   │
//! │   sync, rebalance       │   merge             │
//! ├───────────────────────────────────────────────┤
//! │  Peer transport (TCP) + protocol router       │
//! ├───────────────────────────────────────────────┤
//! │  Metadata store · content store               │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`api`] - HTTP endpoints for clients
//! - [`config`] - Node configuration (YAML, environment, CLI)
//! - [`node`] - [`ShardNode`] assembly and background loops
//! - [`observability`] - Structured logging, metrics and request tracing

pub mod api;
pub mod config;
pub mod node;
pub mod observability;

pub use config::{ConfigError, NodeConfig, StorageBackend};
pub use node::{NodeError, Result, ShardNode};
