//! # Shardmesh Search
//!
//! Federated search over dataset shards.
//!
//! Every node answers queries against the shard payloads it holds
//! ([`LocalSearch`], served to peers by [`FederatedSearchHandler`]). The
//! [`SearchCoordinator`] resolves the holders of a dataset, fans the query
//! out to all of them and merges the ranked answers.
//!
//! Scoring inside a shard is pluggable through [`ShardSearcher`];
//! [`BruteForceSearcher`] is the default.

#![forbid(unsafe_code)]

mod coordinator;
mod error;
mod local;
mod merge;
mod searcher;

pub use coordinator::{SearchCoordinator, SearchOutcome};
pub use error::{Result, SearchError};
pub use local::{FederatedSearchHandler, LocalSearch};
pub use merge::merge_hits;
pub use searcher::{validate_query, BruteForceSearcher, ScoredRecord, ShardSearcher};
