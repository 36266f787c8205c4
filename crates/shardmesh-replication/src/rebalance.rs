//! Rebalancing toward a target replication factor.
//!
//! A holder counts toward the target only if it is this node or answered the
//! current discovery round. Holders are never removed; unreachable ones are
//! outnumbered by new reachable holders instead.

use crate::distribution::DistributionEngine;
use crate::placement::select_nodes;
use crate::{ReplicationError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Per-dataset result of a rebalance run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebalanceCounts {
    /// Under-replicated shards that reached the target.
    pub rebalanced: usize,
    /// Under-replicated shards that are still short.
    pub failed: usize,
}

/// Extends under-replicated shards this node holds.
#[derive(Debug, Clone)]
pub struct Rebalancer {
    engine: DistributionEngine,
    default_target: usize,
}

impl Rebalancer {
    /// Creates a rebalancer that aims for `default_target` holders when a
    /// call does not name a target.
    #[must_use]
    pub fn new(engine: DistributionEngine, default_target: usize) -> Self {
        Self {
            engine,
            default_target,
        }
    }

    /// Rebalances one dataset, or every local dataset when `dataset_id` is
    /// `None`.
    ///
    /// Only shards whose payload this node holds are extended. Per-shard
    /// failures are counted, never returned.
    pub async fn rebalance(
        &self,
        dataset_id: Option<&str>,
        target: Option<usize>,
    ) -> Result<BTreeMap<String, RebalanceCounts>> {
        let ctx = self.engine.context();
        let target = target.unwrap_or(self.default_target);
        if target == 0 {
            return Err(ReplicationError::InvalidArgument(
                "target replication must be positive".into(),
            ));
        }
        let scope: Vec<String> = match dataset_id {
            Some(id) => vec![ctx.dataset(id)?.dataset_id],
            None => ctx
                .store()
                .list_datasets()?
                .into_iter()
                .map(|d| d.dataset_id)
                .collect(),
        };

        let live = ctx.membership().discover_peers().await;
        let storing = ctx.membership().shard_capable(&live);
        let mut results = BTreeMap::new();
        for dataset_id in scope {
            let mut counts = RebalanceCounts::default();
            for shard in ctx.store().list_shards_for_dataset(&dataset_id)? {
                let holders = ctx.live_holders(&shard, &live);
                if holders.len() >= target {
                    continue;
                }
                if !ctx.holds_payload(&shard).await? {
                    debug!(shard_id = %shard.shard_id, "skipping shard without local payload");
                    continue;
                }

                let needed = target - holders.len();
                let mut exclude: BTreeSet<_> = shard.node_ids.clone();
                exclude.insert(ctx.local_id().clone());
                let candidates = select_nodes(&shard.shard_id, &storing, &exclude, needed);
                if candidates.is_empty() {
                    warn!(
                        shard_id = %shard.shard_id,
                        holders = holders.len(),
                        replication_target = target,
                        "no candidates to extend shard"
                    );
                    counts.failed += 1;
                    continue;
                }

                match self
                    .engine
                    .distribute_shard(&shard.shard_id, Some(candidates), target)
                    .await
                {
                    Ok(outcome) if outcome.succeeded.len() == needed => counts.rebalanced += 1,
                    Ok(outcome) => {
                        debug!(
                            shard_id = %shard.shard_id,
                            added = outcome.succeeded.len(),
                            needed,
                            "shard still under-replicated"
                        );
                        counts.failed += 1;
                    }
                    Err(e) => {
                        warn!(shard_id = %shard.shard_id, error = %e, "rebalance of shard failed");
                        counts.failed += 1;
                    }
                }
            }
            if counts != RebalanceCounts::default() {
                info!(
                    dataset_id = %dataset_id,
                    rebalanced = counts.rebalanced,
                    failed = counts.failed,
                    "rebalanced dataset"
                );
            }
            results.insert(dataset_id, counts);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{id, mesh, node};
    use crate::context::ShardingContext;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use shardmesh_p2p::MemoryNetwork;
    use shardmesh_types::{NewDataset, NodeRole};
    use std::sync::Arc;

    async fn cluster(
        network: &MemoryNetwork,
        peers: &[&str],
    ) -> (Arc<ShardingContext>, Rebalancer, String) {
        let a = node(network, "a", NodeRole::Hybrid);
        let mut all = vec![a.clone()];
        for name in peers {
            all.push(node(network, name, NodeRole::Worker));
        }
        mesh(&all.iter().collect::<Vec<_>>());

        let engine = DistributionEngine::new(a.clone());
        let ds = engine.create_dataset(NewDataset::new("d")).await.unwrap();
        engine
            .shard_dataset(&ds.dataset_id, &[json!({"i": 0})], 10, 0)
            .await
            .unwrap();
        (a, Rebalancer::new(engine, 3), ds.dataset_id)
    }

    #[tokio::test]
    async fn extends_to_exact_target() {
        let network = MemoryNetwork::new();
        let (a, rebalancer, dataset_id) = cluster(&network, &["p1", "p2", "p3", "p4"]).await;
        let shard_id = format!("{dataset_id}-shard-0");

        let counts = rebalancer.rebalance(Some(&dataset_id), Some(3)).await.unwrap();
        assert_eq!(
            counts[&dataset_id],
            RebalanceCounts {
                rebalanced: 1,
                failed: 0
            }
        );

        let holders = a.shard(&shard_id).unwrap().node_ids;
        assert_eq!(holders.len(), 3);
        let peers: BTreeSet<_> = ["p1", "p2", "p3", "p4"].iter().map(|n| id(n)).collect();
        let expected: BTreeSet<_> = select_nodes(&shard_id, &peers, &BTreeSet::from([id("a")]), 2)
            .into_iter()
            .chain([id("a")])
            .collect();
        assert_eq!(holders, expected);

        let again = rebalancer.rebalance(None, None).await.unwrap();
        assert_eq!(again[&dataset_id], RebalanceCounts::default());
    }

    #[tokio::test]
    async fn short_cluster_counts_failure() {
        let network = MemoryNetwork::new();
        let (a, rebalancer, dataset_id) = cluster(&network, &["p1"]).await;

        let counts = rebalancer.rebalance(None, Some(3)).await.unwrap();
        assert_eq!(counts[&dataset_id].failed, 1);
        assert_eq!(
            a.shard(&format!("{dataset_id}-shard-0")).unwrap().node_ids.len(),
            2
        );
    }

    #[tokio::test]
    async fn unreachable_holder_is_replaced() {
        let network = MemoryNetwork::new();
        let (a, rebalancer, dataset_id) = cluster(&network, &["p1", "p2", "p3"]).await;
        let shard_id = format!("{dataset_id}-shard-0");

        rebalancer.rebalance(None, Some(2)).await.unwrap();
        let first = a.shard(&shard_id).unwrap().node_ids;
        let extra = first.iter().find(|n| n.as_str() != "a").unwrap().clone();
        network.set_reachable(&extra, false);

        let counts = rebalancer.rebalance(None, Some(2)).await.unwrap();
        assert_eq!(counts[&dataset_id].rebalanced, 1);
        let after = a.shard(&shard_id).unwrap().node_ids;
        assert_eq!(after.len(), 3);
        assert!(after.contains(&extra));
    }

    #[tokio::test]
    async fn client_peers_are_never_targets() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let c = node(&network, "c", NodeRole::Client);
        let p1 = node(&network, "p1", NodeRole::Worker);
        mesh(&[&a, &c, &p1]);

        let engine = DistributionEngine::new(a.clone());
        let rebalancer = Rebalancer::new(engine.clone(), 2);
        for n in 0..20 {
            let ds = engine
                .create_dataset(NewDataset::new(format!("d{n}")))
                .await
                .unwrap();
            engine
                .shard_dataset(&ds.dataset_id, &[json!({"i": n})], 10, 0)
                .await
                .unwrap();

            let counts = rebalancer.rebalance(Some(&ds.dataset_id), None).await.unwrap();
            assert_eq!(counts[&ds.dataset_id].rebalanced, 1);
            let holders = a.shard(&format!("{}-shard-0", ds.dataset_id)).unwrap().node_ids;
            assert_eq!(holders, BTreeSet::from([id("a"), id("p1")]));
        }
        assert!(c.store().list_shards().unwrap().is_empty());
    }

    #[tokio::test]
    async fn preconditions_fail_before_fan_out() {
        let network = MemoryNetwork::new();
        let (_a, rebalancer, dataset_id) = cluster(&network, &["p1"]).await;
        assert!(matches!(
            rebalancer.rebalance(Some("missing"), None).await,
            Err(ReplicationError::NotFound { .. })
        ));
        assert!(matches!(
            rebalancer.rebalance(Some(&dataset_id), Some(0)).await,
            Err(ReplicationError::InvalidArgument(_))
        ));
    }
}
