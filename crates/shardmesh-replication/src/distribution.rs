//! Dataset creation, sharding and shard distribution.

use crate::context::ShardingContext;
use crate::placement::select_nodes;
use crate::transfer::push_shard;
use crate::{ReplicationError, Result};
use serde::Serialize;
use shardmesh_types::{DatasetMetadata, NewDataset, NodeId, Record, ShardMetadata};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Outcome of [`DistributionEngine::shard_dataset`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardingReport {
    /// The dataset after its new shards were added.
    pub dataset: DatasetMetadata,
    /// The created shards, in index order, as stored after distribution.
    pub shards: Vec<ShardMetadata>,
    /// Peers that accepted each shard.
    pub distribution: BTreeMap<String, BTreeSet<NodeId>>,
    /// Transfers that failed across all shards.
    pub failed_transfers: usize,
}

/// Per-target results of one distribution call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistributionOutcome {
    /// Peers that now hold the shard.
    pub succeeded: BTreeSet<NodeId>,
    /// Peers the transfer failed for.
    pub failed: BTreeSet<NodeId>,
}

/// Creates datasets, splits records into shards and replicates shards to
/// peers chosen by consistent hashing.
#[derive(Debug, Clone)]
pub struct DistributionEngine {
    ctx: Arc<ShardingContext>,
}

impl DistributionEngine {
    #[must_use]
    pub fn new(ctx: Arc<ShardingContext>) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ShardingContext> {
        &self.ctx
    }

    /// Creates an empty dataset coordinated by this node.
    pub async fn create_dataset(&self, params: NewDataset) -> Result<DatasetMetadata> {
        self.ctx.ensure_can_coordinate()?;
        if params.name.trim().is_empty() {
            return Err(ReplicationError::InvalidArgument(
                "dataset name must not be empty".into(),
            ));
        }

        let dataset_id = uuid::Uuid::new_v4().to_string();
        let dataset = DatasetMetadata::new(dataset_id.clone(), params, self.ctx.local_id().clone());
        {
            let _guard = self.ctx.locks().dataset(&dataset_id).await;
            self.ctx.store().put_dataset(&dataset)?;
        }
        info!(dataset_id = %dataset_id, name = %dataset.name, "created dataset");
        Ok(dataset)
    }

    /// Splits `records` into consecutive shards of at most `shard_size`
    /// records, stores them locally and distributes each to
    /// `replication_factor` peers.
    ///
    /// New shards continue the dataset's index sequence. Distribution
    /// failures are logged and reflected in the report, never returned.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn shard_dataset(
        &self,
        dataset_id: &str,
        records: &[Record],
        shard_size: usize,
        replication_factor: usize,
    ) -> Result<ShardingReport> {
        self.ctx.ensure_can_coordinate()?;
        if shard_size == 0 {
            return Err(ReplicationError::InvalidArgument(
                "shard size must be positive".into(),
            ));
        }
        // Held until the new shard ids are in the dataset record, so
        // concurrent calls never allocate the same index.
        let dataset_guard = self.ctx.locks().dataset(dataset_id).await;
        self.ctx.reconcile_dataset_locked(dataset_id)?;
        let existing = self.ctx.dataset(dataset_id)?;
        let first_index = u32::try_from(existing.shard_ids.len()).map_err(|_| {
            ReplicationError::InvalidArgument("dataset has too many shards".into())
        })?;
        let chunk_count = u32::try_from(records.len().div_ceil(shard_size))
            .map_err(|_| ReplicationError::InvalidArgument("too many shards".into()))?;
        let total_shards = first_index
            .checked_add(chunk_count)
            .ok_or_else(|| ReplicationError::InvalidArgument("too many shards".into()))?;

        let mut created = Vec::with_capacity(chunk_count as usize);
        for (offset, chunk) in (0u32..).zip(records.chunks(shard_size)) {
            let payload = self.ctx.encoder().encode(chunk)?;
            let content_id = self.ctx.content().put(payload).await?;
            let shard = ShardMetadata::new(
                dataset_id,
                first_index + offset,
                total_shards,
                chunk.len() as u64,
                content_id,
                self.ctx.local_id().clone(),
            );
            {
                let _guard = self.ctx.locks().shard(&shard.shard_id).await;
                self.ctx.store().put_shard(&shard)?;
            }
            debug!(shard_id = %shard.shard_id, records = chunk.len(), "stored shard");
            created.push(shard.shard_id);
        }
        self.ctx.reconcile_dataset_locked(dataset_id)?;
        drop(dataset_guard);

        let mut distribution = BTreeMap::new();
        let mut failed_transfers = 0;
        for shard_id in &created {
            let outcome = self
                .distribute_shard(shard_id, None, replication_factor)
                .await?;
            failed_transfers += outcome.failed.len();
            distribution.insert(shard_id.clone(), outcome.succeeded);
        }

        let shards = created
            .iter()
            .map(|id| self.ctx.shard(id))
            .collect::<Result<Vec<_>>>()?;
        let dataset = self.ctx.dataset(dataset_id)?;
        info!(
            dataset_id = %dataset_id,
            shards = shards.len(),
            total_records = dataset.total_records,
            "sharded dataset"
        );
        Ok(ShardingReport {
            dataset,
            shards,
            distribution,
            failed_transfers,
        })
    }

    /// Replicates a local shard to `targets`, or to `replication_factor`
    /// peers chosen by consistent hashing over the current discovery snapshot
    /// when `targets` is `None`.
    ///
    /// One task per target; failures are logged and land in
    /// [`DistributionOutcome::failed`]. Nothing is retried.
    pub async fn distribute_shard(
        &self,
        shard_id: &str,
        targets: Option<Vec<NodeId>>,
        replication_factor: usize,
    ) -> Result<DistributionOutcome> {
        let shard = self.ctx.shard(shard_id)?;
        let exclude = BTreeSet::from([self.ctx.local_id().clone()]);
        let targets = match targets {
            Some(explicit) => {
                let unique: BTreeSet<NodeId> = explicit.into_iter().collect();
                unique.difference(&exclude).cloned().collect()
            }
            None => {
                let membership = self.ctx.membership();
                let peers = membership.shard_capable(&membership.discover_peers().await);
                select_nodes(&shard.shard_id, &peers, &exclude, replication_factor)
            }
        };
        if targets.is_empty() {
            debug!(shard_id = %shard_id, "no distribution targets");
            return Ok(DistributionOutcome::default());
        }

        let mut tasks = JoinSet::new();
        for peer in targets {
            let ctx = self.ctx.clone();
            let shard_id = shard_id.to_string();
            tasks.spawn(async move {
                let result = push_shard(&ctx, &peer, &shard_id).await;
                (peer, result)
            });
        }

        let mut outcome = DistributionOutcome::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((peer, Ok(_))) => {
                    outcome.succeeded.insert(peer);
                }
                Ok((peer, Err(e))) => {
                    warn!(shard_id = %shard_id, peer = %peer, error = %e, "shard transfer failed");
                    outcome.failed.insert(peer);
                }
                Err(e) => warn!(shard_id = %shard_id, error = %e, "transfer task panicked"),
            }
        }
        info!(
            shard_id = %shard_id,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "distributed shard"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{id, mesh, node};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use shardmesh_p2p::MemoryNetwork;
    use shardmesh_types::{shard_id_for, NodeRole};

    fn records(n: usize) -> Vec<Record> {
        (0..n).map(|i| json!({"i": i, "text": format!("r{i}")})).collect()
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let network = MemoryNetwork::new();
        let engine = DistributionEngine::new(node(&network, "a", NodeRole::Coordinator));
        let err = engine.create_dataset(NewDataset::new("  ")).await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn workers_cannot_create_datasets() {
        let network = MemoryNetwork::new();
        let engine = DistributionEngine::new(node(&network, "w", NodeRole::Worker));
        assert!(engine.create_dataset(NewDataset::new("d")).await.is_err());
    }

    #[tokio::test]
    async fn shards_consecutive_groups() {
        let network = MemoryNetwork::new();
        let engine = DistributionEngine::new(node(&network, "a", NodeRole::Hybrid));
        let ds = engine.create_dataset(NewDataset::new("ds1")).await.unwrap();

        let report = engine
            .shard_dataset(&ds.dataset_id, &records(2500), 1000, 3)
            .await
            .unwrap();
        let sizes: Vec<u64> = report.shards.iter().map(|s| s.record_count).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(report.dataset.total_records, 2500);
        assert_eq!(report.dataset.shard_ids.len(), 3);
        assert!(report.shards.iter().all(|s| s.total_shards_at_creation == 3));
        assert!(report.distribution.values().all(BTreeSet::is_empty));
    }

    #[tokio::test]
    async fn appended_shards_continue_indexes() {
        let network = MemoryNetwork::new();
        let engine = DistributionEngine::new(node(&network, "a", NodeRole::Hybrid));
        let ds = engine.create_dataset(NewDataset::new("d")).await.unwrap();

        engine.shard_dataset(&ds.dataset_id, &records(3), 2, 1).await.unwrap();
        let report = engine
            .shard_dataset(&ds.dataset_id, &records(1), 2, 1)
            .await
            .unwrap();
        assert_eq!(report.shards[0].shard_index, 2);
        assert_eq!(report.dataset.total_records, 4);
        assert_eq!(
            report.dataset.shard_ids,
            vec![
                shard_id_for(&ds.dataset_id, 0),
                shard_id_for(&ds.dataset_id, 1),
                shard_id_for(&ds.dataset_id, 2),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ingests_get_distinct_shards() {
        for _ in 0..20 {
            let network = MemoryNetwork::new();
            let engine = DistributionEngine::new(node(&network, "a", NodeRole::Hybrid));
            let ds = engine.create_dataset(NewDataset::new("d")).await.unwrap();

            let first = {
                let engine = engine.clone();
                let dataset_id = ds.dataset_id.clone();
                tokio::spawn(async move { engine.shard_dataset(&dataset_id, &records(10), 10, 1).await })
            };
            let second = {
                let engine = engine.clone();
                let dataset_id = ds.dataset_id.clone();
                tokio::spawn(async move { engine.shard_dataset(&dataset_id, &records(7), 10, 1).await })
            };
            first.await.unwrap().unwrap();
            second.await.unwrap().unwrap();

            let dataset = engine.context().dataset(&ds.dataset_id).unwrap();
            assert_eq!(dataset.shard_ids.len(), 2);
            assert_eq!(dataset.total_records, 17);
            let mut counts: Vec<u64> = dataset
                .shard_ids
                .iter()
                .map(|s| engine.context().shard(s).unwrap().record_count)
                .collect();
            counts.sort_unstable();
            assert_eq!(counts, vec![7, 10]);
        }
    }

    #[tokio::test]
    async fn unknown_dataset_and_zero_size_fail_early() {
        let network = MemoryNetwork::new();
        let engine = DistributionEngine::new(node(&network, "a", NodeRole::Hybrid));
        assert!(matches!(
            engine.shard_dataset("missing", &records(1), 10, 1).await,
            Err(ReplicationError::NotFound { .. })
        ));
        let ds = engine.create_dataset(NewDataset::new("d")).await.unwrap();
        assert!(matches!(
            engine.shard_dataset(&ds.dataset_id, &records(1), 0, 1).await,
            Err(ReplicationError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn placement_skips_non_storing_peers() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let client = node(&network, "c", NodeRole::Client);
        let coordinator = node(&network, "k", NodeRole::Coordinator);
        let w = node(&network, "w", NodeRole::Worker);
        mesh(&[&a, &client, &coordinator, &w]);

        let engine = DistributionEngine::new(a.clone());
        let ds = engine.create_dataset(NewDataset::new("d")).await.unwrap();
        let report = engine
            .shard_dataset(&ds.dataset_id, &records(30), 10, 3)
            .await
            .unwrap();
        assert_eq!(report.failed_transfers, 0);
        for chosen in report.distribution.values() {
            assert_eq!(chosen, &BTreeSet::from([id("w")]));
        }
    }

    #[tokio::test]
    async fn distribution_is_deterministic_and_skips_failures() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let peers: Vec<_> = ["p1", "p2", "p3", "p4"]
            .iter()
            .map(|n| node(&network, n, NodeRole::Worker))
            .collect();
        let all: Vec<&Arc<ShardingContext>> = std::iter::once(&a).chain(peers.iter()).collect();
        mesh(&all);

        let engine = DistributionEngine::new(a.clone());
        let ds = engine.create_dataset(NewDataset::new("d")).await.unwrap();
        let report = engine
            .shard_dataset(&ds.dataset_id, &records(10), 10, 2)
            .await
            .unwrap();
        let shard_id = &report.shards[0].shard_id;
        let chosen = &report.distribution[shard_id];
        assert_eq!(chosen.len(), 2);

        let again = engine.distribute_shard(shard_id, None, 2).await.unwrap();
        assert_eq!(&again.succeeded, chosen);

        let victim = chosen.iter().next().unwrap().clone();
        network.set_reachable(&victim, false);
        let explicit = engine
            .distribute_shard(shard_id, Some(vec![victim.clone(), id("a")]), 0)
            .await
            .unwrap();
        assert!(explicit.succeeded.is_empty());
        assert_eq!(explicit.failed, BTreeSet::from([victim]));
    }
}
