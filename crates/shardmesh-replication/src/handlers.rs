//! Inbound handlers for shard discovery and metadata sync.

use crate::context::ShardingContext;
use crate::transfer::ShardTransferHandler;
use async_trait::async_trait;
use shardmesh_p2p::message::{
    DatasetData, DatasetTimestampsData, MetadataSyncRequest, ShardDiscoveryRequest,
    ShardInfoData, ShardSyncRequest, ShardTimestampsData, ShardsData, SyncDatasetData,
    SyncShardData, TimestampData,
};
use shardmesh_p2p::{
    protocols, read_request, write_response, DiscoveryHandler, PeerStream, ProtocolHandler,
    ProtocolRouter, Response,
};
use shardmesh_types::NodeId;
use std::sync::Arc;
use tracing::debug;

/// Registers the discovery, shard-discovery, shard-transfer, shard-sync and
/// metadata-sync handlers for `ctx` on `router`.
pub fn register_handlers(router: &ProtocolRouter, ctx: &Arc<ShardingContext>) {
    router.register_handler(
        protocols::DISCOVERY,
        Arc::new(DiscoveryHandler::new(ctx.membership().clone())),
    );
    router.register_handler(
        protocols::SHARD_DISCOVERY,
        Arc::new(ShardDiscoveryHandler::new(ctx.clone())),
    );
    router.register_handler(
        protocols::SHARD_TRANSFER,
        Arc::new(ShardTransferHandler::new(ctx.clone())),
    );
    router.register_handler(
        protocols::SHARD_SYNC,
        Arc::new(ShardSyncHandler::new(ctx.clone())),
    );
    router.register_handler(
        protocols::METADATA_SYNC,
        Arc::new(MetadataSyncHandler::new(ctx.clone())),
    );
}

/// Serves `list_shards` and `get_shard_info`.
#[derive(Debug)]
pub struct ShardDiscoveryHandler {
    ctx: Arc<ShardingContext>,
}

impl ShardDiscoveryHandler {
    #[must_use]
    pub fn new(ctx: Arc<ShardingContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ProtocolHandler for ShardDiscoveryHandler {
    async fn handle(&self, _peer: &NodeId, stream: &mut dyn PeerStream) -> shardmesh_p2p::Result<()> {
        let response = match read_request(stream).await? {
            ShardDiscoveryRequest::ListShards { dataset_id } => {
                let shards = match dataset_id {
                    Some(id) => self.ctx.store().list_shards_for_dataset(&id),
                    None => self.ctx.store().list_shards(),
                }
                .map_err(crate::ReplicationError::from)?;
                Response::success(ShardsData { shards })?
            }
            ShardDiscoveryRequest::GetShardInfo { shard_id } => {
                match self.ctx.find_shard(&shard_id)? {
                    Some(shard) => Response::success(ShardInfoData { shard })?,
                    None => Response::not_found(format!("shard {shard_id}")),
                }
            }
        };
        write_response(stream, &response).await
    }
}

/// Serves the shard-sync protocol.
#[derive(Debug)]
pub struct ShardSyncHandler {
    ctx: Arc<ShardingContext>,
}

impl ShardSyncHandler {
    #[must_use]
    pub fn new(ctx: Arc<ShardingContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ProtocolHandler for ShardSyncHandler {
    async fn handle(&self, peer: &NodeId, stream: &mut dyn PeerStream) -> shardmesh_p2p::Result<()> {
        let response = match read_request(stream).await? {
            ShardSyncRequest::SyncShard { shard_id, metadata } => {
                if metadata.shard_id != shard_id {
                    Response::error("shard_id does not match metadata")
                } else {
                    let merged = self.ctx.apply_shard(metadata).await?;
                    debug!(shard_id = %shard_id, from = %peer, outcome = ?merged.outcome, "shard sync");
                    let data = SyncShardData {
                        shard: merged.record,
                    };
                    if merged.outcome.is_applied() {
                        Response::success(data)?
                    } else {
                        Response::unchanged_with(data)?
                    }
                }
            }
            ShardSyncRequest::GetShardTimestamp { shard_id } => {
                match self.ctx.find_shard(&shard_id)? {
                    Some(shard) => Response::success(TimestampData {
                        modified_time: shard.modified_time,
                    })?,
                    None => Response::not_found(format!("shard {shard_id}")),
                }
            }
            ShardSyncRequest::ListShardsWithTimestamps { dataset_id } => {
                let shards = self.ctx.shard_timestamps(dataset_id.as_deref())?;
                Response::success(ShardTimestampsData { shards })?
            }
        };
        write_response(stream, &response).await
    }
}

/// Serves the metadata-sync protocol.
#[derive(Debug)]
pub struct MetadataSyncHandler {
    ctx: Arc<ShardingContext>,
}

impl MetadataSyncHandler {
    #[must_use]
    pub fn new(ctx: Arc<ShardingContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ProtocolHandler for MetadataSyncHandler {
    async fn handle(&self, peer: &NodeId, stream: &mut dyn PeerStream) -> shardmesh_p2p::Result<()> {
        let ctx = &self.ctx;
        let response = match read_request(stream).await? {
            MetadataSyncRequest::SyncDataset {
                dataset_id,
                metadata,
            } => {
                if metadata.dataset_id != dataset_id {
                    Response::error("dataset_id does not match metadata")
                } else {
                    let merged = ctx.apply_dataset(metadata).await?;
                    debug!(dataset_id = %dataset_id, from = %peer, outcome = ?merged.outcome, "dataset sync");
                    let mut new_shard_ids = Vec::new();
                    for shard_id in &merged.record.shard_ids {
                        if ctx.find_shard(shard_id)?.is_none() {
                            new_shard_ids.push(shard_id.clone());
                        }
                    }
                    let data = SyncDatasetData { new_shard_ids };
                    if merged.outcome.is_applied() {
                        Response::success(data)?
                    } else {
                        Response::unchanged_with(data)?
                    }
                }
            }
            MetadataSyncRequest::GetDatasetTimestamp { dataset_id } => {
                match ctx.find_dataset(&dataset_id)? {
                    Some(dataset) => Response::success(TimestampData {
                        modified_time: dataset.modified_time,
                    })?,
                    None => Response::not_found(format!("dataset {dataset_id}")),
                }
            }
            MetadataSyncRequest::ListDatasetsWithTimestamps {} => {
                let datasets = ctx.dataset_timestamps()?;
                Response::success(DatasetTimestampsData { datasets })?
            }
            MetadataSyncRequest::GetDataset { dataset_id } => {
                match ctx.find_dataset(&dataset_id)? {
                    Some(metadata) => {
                        let shards = ctx.shard_timestamps(Some(&dataset_id))?;
                        Response::success(DatasetData { metadata, shards })?
                    }
                    None => Response::not_found(format!("dataset {dataset_id}")),
                }
            }
        };
        write_response(stream, &response).await
    }
}

#[cfg(test)]
mod tests {
    use crate::context::testing::{id, node};
    use pretty_assertions::assert_eq;
    use shardmesh_p2p::message::{
        MetadataSyncRequest, ShardDiscoveryRequest, ShardSyncRequest, ShardsData,
        SyncDatasetData, SyncShardData, TimestampData,
    };
    use shardmesh_p2p::{MemoryNetwork, P2pError, Status};
    use shardmesh_types::{DatasetMetadata, NewDataset, NodeRole, ShardMetadata, Timestamp};

    #[tokio::test]
    async fn sync_dataset_reports_missing_shards() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let b = node(&network, "b", NodeRole::Hybrid);

        let mut ds = DatasetMetadata::new("ds", NewDataset::new("d"), id("a"));
        ds.add_shard_id("ds-shard-0");
        ds.add_shard_id("ds-shard-1");
        b.apply_shard(ShardMetadata::new("ds", 0, 2, 3, "c0", id("b")))
            .await
            .unwrap();

        let request = MetadataSyncRequest::SyncDataset {
            dataset_id: "ds".into(),
            metadata: ds.clone(),
        };
        let response = a.client().request(&id("b"), &request).await.unwrap();
        assert_eq!(response.status, Status::Success);
        let data: SyncDatasetData = response.into_data().unwrap();
        assert_eq!(data.new_shard_ids, vec!["ds-shard-1"]);
    }

    #[tokio::test]
    async fn repeated_sync_is_unchanged() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let _b = node(&network, "b", NodeRole::Hybrid);

        let shard = ShardMetadata::new("ds", 0, 1, 3, "c0", id("a"));
        let request = ShardSyncRequest::SyncShard {
            shard_id: shard.shard_id.clone(),
            metadata: shard,
        };
        let first = a.client().request(&id("b"), &request).await.unwrap();
        assert_eq!(first.status, Status::Success);
        let second = a.client().request(&id("b"), &request).await.unwrap();
        assert_eq!(second.status, Status::Unchanged);
        let data: SyncShardData = second.into_data().unwrap();
        assert!(data.shard.node_ids.contains(&id("a")));
    }

    #[tokio::test]
    async fn mismatched_ids_are_rejected() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let b = node(&network, "b", NodeRole::Hybrid);

        let request = ShardSyncRequest::SyncShard {
            shard_id: "other".into(),
            metadata: ShardMetadata::new("ds", 0, 1, 3, "c0", id("a")),
        };
        let response = a.client().request(&id("b"), &request).await.unwrap();
        assert_eq!(response.status, Status::Error);
        assert!(b.find_shard("ds-shard-0").unwrap().is_none());
    }

    #[tokio::test]
    async fn lookups_report_not_found() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let _b = node(&network, "b", NodeRole::Hybrid);

        let err = a
            .client()
            .call::<_, TimestampData>(
                &id("b"),
                &MetadataSyncRequest::GetDatasetTimestamp {
                    dataset_id: "nope".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            P2pError::Remote {
                status: Status::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn list_shards_filters_by_dataset() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let b = node(&network, "b", NodeRole::Hybrid);
        for (ds, idx) in [("x", 0), ("x", 1), ("y", 0)] {
            let mut shard = ShardMetadata::new(ds, idx, 2, 1, "c", id("b"));
            shard.modified_time = Timestamp::from_millis(5);
            b.apply_shard(shard).await.unwrap();
        }

        let data: ShardsData = a
            .client()
            .call(
                &id("b"),
                &ShardDiscoveryRequest::ListShards {
                    dataset_id: Some("x".into()),
                },
            )
            .await
            .unwrap();
        let ids: Vec<_> = data.shards.iter().map(|s| s.shard_id.as_str()).collect();
        assert_eq!(ids, vec!["x-shard-0", "x-shard-1"]);
    }
}
