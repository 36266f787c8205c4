//! # Shardmesh Replication
//!
//! Shard distribution, replication and metadata convergence.
//!
//! ## Overview
//!
//! - [`DistributionEngine`]: creates datasets, splits records into shards and
//!   pushes each shard to peers chosen by consistent hashing.
//! - [`SyncProtocol`]: pairwise push+pull rounds that converge dataset and
//!   shard metadata under last-write-wins, with holder sets always unioned.
//! - [`Rebalancer`]: extends under-replicated shards toward a target.
//! - [`register_handlers`]: serves the shard-discovery, shard-transfer,
//!   shard-sync and metadata-sync protocols for a node.
//!
//! All components share one [`ShardingContext`] per node.
//!
//! ## Example
//!
//! ```rust,ignore
//! let ctx = Arc::new(ShardingContext::new(membership, store, content));
//! register_handlers(&router, &ctx);
//!
//! let engine = DistributionEngine::new(ctx.clone());
//! let dataset = engine.create_dataset(NewDataset::new("articles")).await?;
//! engine.shard_dataset(&dataset.dataset_id, &records, 1000, 3).await?;
//! ```

#![forbid(unsafe_code)]

mod context;
mod distribution;
mod error;
mod handlers;
pub mod placement;
mod rebalance;
mod sync;
mod transfer;

pub use context::{MergeOutcome, Merged, ShardingContext};
pub use distribution::{DistributionEngine, DistributionOutcome, ShardingReport};
pub use error::{ReplicationError, Result};
pub use handlers::{register_handlers, MetadataSyncHandler, ShardDiscoveryHandler, ShardSyncHandler};
pub use rebalance::{RebalanceCounts, Rebalancer};
pub use sync::{SyncProtocol, SyncReport};
pub use transfer::{pull_shard, push_shard, ShardTransferHandler};
