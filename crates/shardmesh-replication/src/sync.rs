//! Pairwise metadata synchronization.
//!
//! One round against one peer: fetch the peer's dataset and shard versions,
//! pull everything the peer has newer (datasets first, then shards), then
//! push everything this node has newer than the versions the peer reported.
//! Pull always finishes before push starts.

use crate::context::ShardingContext;
use crate::transfer::pull_shard;
use crate::{ReplicationError, Result};
use serde::Serialize;
use shardmesh_p2p::message::{
    DatasetData, DatasetTimestampsData, MetadataSyncRequest, ShardDiscoveryRequest,
    ShardInfoData, ShardSyncRequest, ShardTimestampsData, SyncDatasetData, SyncShardData,
};
use shardmesh_p2p::Status;
use shardmesh_types::{NodeId, Timestamp};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What one sync round against one peer changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub peer: NodeId,
    /// Datasets updated locally from the peer.
    pub datasets_pulled: usize,
    /// Shards updated locally from the peer.
    pub shards_pulled: usize,
    /// Datasets the peer accepted from this node.
    pub datasets_pushed: usize,
    /// Shards the peer accepted from this node.
    pub shards_pushed: usize,
    /// Records that could not be exchanged this round.
    pub failures: Vec<String>,
}

impl SyncReport {
    fn new(peer: NodeId) -> Self {
        Self {
            peer,
            datasets_pulled: 0,
            shards_pulled: 0,
            datasets_pushed: 0,
            shards_pushed: 0,
            failures: Vec::new(),
        }
    }

    /// Whether the round changed nothing on either side.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.datasets_pulled == 0
            && self.shards_pulled == 0
            && self.datasets_pushed == 0
            && self.shards_pushed == 0
            && self.failures.is_empty()
    }
}

fn is_newer(version: Timestamp, other: Option<&Timestamp>) -> bool {
    other.map_or(true, |o| version > *o)
}

/// Drives sync rounds for one node.
#[derive(Debug, Clone)]
pub struct SyncProtocol {
    ctx: Arc<ShardingContext>,
}

impl SyncProtocol {
    #[must_use]
    pub fn new(ctx: Arc<ShardingContext>) -> Self {
        Self { ctx }
    }

    /// Runs one push+pull round against `peer`.
    ///
    /// Fails only if the peer's version lists cannot be fetched. Failures on
    /// individual records are logged and listed in the report.
    pub async fn sync_with_peer(&self, peer: &NodeId) -> Result<SyncReport> {
        let client = self.ctx.client();
        let peer_datasets: DatasetTimestampsData = client
            .call(peer, &MetadataSyncRequest::ListDatasetsWithTimestamps {})
            .await
            .map_err(|e| ReplicationError::from_peer(peer, e))?;
        let peer_shards: ShardTimestampsData = client
            .call(
                peer,
                &ShardSyncRequest::ListShardsWithTimestamps { dataset_id: None },
            )
            .await
            .map_err(|e| ReplicationError::from_peer(peer, e))?;

        let mut report = SyncReport::new(peer.clone());
        self.pull(peer, &peer_datasets.datasets, &peer_shards.shards, &mut report)
            .await?;
        self.push(peer, &peer_datasets.datasets, &peer_shards.shards, &mut report)
            .await?;

        if report.is_unchanged() {
            debug!(peer = %peer, "sync round unchanged");
        } else {
            info!(
                peer = %peer,
                datasets_pulled = report.datasets_pulled,
                shards_pulled = report.shards_pulled,
                datasets_pushed = report.datasets_pushed,
                shards_pushed = report.shards_pushed,
                failures = report.failures.len(),
                "sync round finished"
            );
        }
        Ok(report)
    }

    async fn pull(
        &self,
        peer: &NodeId,
        peer_datasets: &BTreeMap<String, Timestamp>,
        peer_shards: &BTreeMap<String, Timestamp>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let client = self.ctx.client();
        let local_datasets = self.ctx.dataset_timestamps()?;
        for (dataset_id, version) in peer_datasets {
            if !is_newer(*version, local_datasets.get(dataset_id)) {
                continue;
            }
            let request = MetadataSyncRequest::GetDataset {
                dataset_id: dataset_id.clone(),
            };
            match client.call::<_, DatasetData>(peer, &request).await {
                Ok(data) => {
                    if self.ctx.apply_dataset(data.metadata).await?.outcome.is_applied() {
                        report.datasets_pulled += 1;
                    }
                }
                Err(e) => {
                    warn!(peer = %peer, dataset_id = %dataset_id, error = %e, "dataset pull failed");
                    report.failures.push(dataset_id.clone());
                }
            }
        }

        let local_shards = self.ctx.shard_timestamps(None)?;
        for (shard_id, version) in peer_shards {
            if !is_newer(*version, local_shards.get(shard_id)) {
                continue;
            }
            match self.pull_one(peer, shard_id).await {
                Ok(true) => report.shards_pulled += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(peer = %peer, shard_id = %shard_id, error = %e, "shard pull failed");
                    report.failures.push(shard_id.clone());
                }
            }
        }
        Ok(())
    }

    /// Pulls one shard: with its payload when this node stores shards and
    /// lacks it, otherwise metadata only.
    async fn pull_one(&self, peer: &NodeId, shard_id: &str) -> Result<bool> {
        let needs_payload = self.ctx.role().stores_shards()
            && match self.ctx.find_shard(shard_id)? {
                Some(local) => !self.ctx.holds_payload(&local).await?,
                None => true,
            };
        if needs_payload {
            match pull_shard(&self.ctx, peer, shard_id).await {
                Ok(_) => return Ok(true),
                Err(e) => {
                    // Metadata still converges without the payload.
                    warn!(peer = %peer, shard_id = %shard_id, error = %e, "payload pull failed");
                }
            }
        }

        let request = ShardDiscoveryRequest::GetShardInfo {
            shard_id: shard_id.to_string(),
        };
        let info: ShardInfoData = self
            .ctx
            .client()
            .call(peer, &request)
            .await
            .map_err(|e| ReplicationError::from_peer(peer, e))?;
        if info.shard.shard_id != shard_id {
            return Err(ReplicationError::Rejected {
                peer: peer.clone(),
                reason: format!("asked for {shard_id}, got {}", info.shard.shard_id),
            });
        }
        Ok(self.ctx.apply_shard(info.shard).await?.outcome.is_applied())
    }

    async fn push(
        &self,
        peer: &NodeId,
        peer_datasets: &BTreeMap<String, Timestamp>,
        peer_shards: &BTreeMap<String, Timestamp>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let client = self.ctx.client();
        let mut wanted: BTreeSet<String> = BTreeSet::new();

        for dataset in self.ctx.store().list_datasets()? {
            if !is_newer(dataset.modified_time, peer_datasets.get(&dataset.dataset_id)) {
                continue;
            }
            let dataset_id = dataset.dataset_id.clone();
            let request = MetadataSyncRequest::SyncDataset {
                dataset_id: dataset_id.clone(),
                metadata: dataset,
            };
            let result = match client.request(peer, &request).await {
                Ok(response) => {
                    let status = response.status;
                    response
                        .into_data::<SyncDatasetData>()
                        .map(|data| (status, data))
                }
                Err(e) => Err(e),
            };
            match result {
                Ok((status, data)) => {
                    if status == Status::Success {
                        report.datasets_pushed += 1;
                    }
                    wanted.extend(data.new_shard_ids);
                }
                Err(e) => {
                    warn!(peer = %peer, dataset_id = %dataset_id, error = %e, "dataset push failed");
                    report.failures.push(dataset_id);
                }
            }
        }

        for shard in self.ctx.store().list_shards()? {
            let newer = is_newer(shard.modified_time, peer_shards.get(&shard.shard_id));
            if !newer && !wanted.contains(&shard.shard_id) {
                continue;
            }
            let shard_id = shard.shard_id.clone();
            let request = ShardSyncRequest::SyncShard {
                shard_id: shard_id.clone(),
                metadata: shard,
            };
            let result = match client.request(peer, &request).await {
                Ok(response) => {
                    let status = response.status;
                    response.into_data::<SyncShardData>().map(|data| (status, data))
                }
                Err(e) => Err(e),
            };
            match result {
                Ok((status, data)) => {
                    if status == Status::Success {
                        report.shards_pushed += 1;
                    }
                    // The peer's merged record may carry holders this node
                    // has not seen.
                    if data.shard.shard_id == shard_id {
                        self.ctx.apply_shard(data.shard).await?;
                    }
                }
                Err(e) => {
                    warn!(peer = %peer, shard_id = %shard_id, error = %e, "shard push failed");
                    report.failures.push(shard_id);
                }
            }
        }
        Ok(())
    }

    /// Runs one round against each peer concurrently. Per-peer failures are
    /// logged and returned in the map, never propagated.
    pub async fn sync_with_peers(
        &self,
        peers: impl IntoIterator<Item = NodeId>,
    ) -> BTreeMap<NodeId, Result<SyncReport>> {
        let mut tasks = JoinSet::new();
        for peer in peers {
            if &peer == self.ctx.local_id() {
                continue;
            }
            let this = self.clone();
            tasks.spawn(async move {
                let result = this.sync_with_peer(&peer).await;
                (peer, result)
            });
        }

        let mut reports = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((peer, result)) => {
                    if let Err(e) = &result {
                        warn!(peer = %peer, error = %e, "sync round failed");
                    }
                    reports.insert(peer, result);
                }
                Err(e) => warn!(error = %e, "sync task panicked"),
            }
        }
        reports
    }

    /// Discovers peers and syncs with every one of them.
    pub async fn sync_round(&self) -> BTreeMap<NodeId, Result<SyncReport>> {
        let peers = self.ctx.membership().discover_peers().await;
        self.sync_with_peers(peers).await
    }
}
