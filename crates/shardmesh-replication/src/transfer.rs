//! The shard-transfer protocol.
//!
//! Push (`accept_shard`): the sender offers `(shard_id, dataset_id,
//! content_id)`. The receiver answers [`AcceptShardData`]; when it accepts,
//! the sender sends a [`ShardPush`] frame and then the raw payload frame, and
//! the receiver answers with its merged record.
//!
//! Pull (`transfer_shard`): the responder answers [`TransferData`] and then
//! sends the raw payload frame.
//!
//! A receiver only lists itself as a holder after the payload is stored and
//! its content id matches.

use crate::context::ShardingContext;
use crate::{ReplicationError, Result};
use async_trait::async_trait;
use shardmesh_p2p::message::{AcceptShardData, ShardPush, ShardTransferRequest, TransferData};
use shardmesh_p2p::{
    protocols, read_json, read_request, read_response, write_json, write_response, P2pError,
    ProtocolHandler, PeerStream, Response, WireRequest,
};
use shardmesh_types::{NodeId, ShardMetadata};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn transfer_error(shard_id: &str, peer: &NodeId, error: P2pError) -> ReplicationError {
    match error {
        P2pError::Remote { .. } => ReplicationError::TransferFailed {
            shard_id: shard_id.to_string(),
            peer: peer.clone(),
            reason: error.to_string(),
        },
        other => ReplicationError::from_peer(peer, other),
    }
}

/// Pushes a local shard to `peer`. Returns the shard record after the peer
/// is recorded as a holder.
///
/// A peer that already holds the shard declines the offer; that still counts
/// as a success.
pub async fn push_shard(
    ctx: &ShardingContext,
    peer: &NodeId,
    shard_id: &str,
) -> Result<ShardMetadata> {
    let shard = ctx.shard(shard_id)?;
    let payload = ctx
        .content()
        .get(&shard.content_id)
        .await?
        .ok_or_else(|| ReplicationError::NotFound {
            resource: "payload",
            id: shard.content_id.clone(),
        })?;
    let dataset = ctx.find_dataset(&shard.dataset_id)?;

    let client = ctx.client();
    let offer = ShardTransferRequest::AcceptShard {
        shard_id: shard.shard_id.clone(),
        dataset_id: shard.dataset_id.clone(),
        content_id: shard.content_id.clone(),
    };
    let answer = client
        .bounded(peer, protocols::SHARD_TRANSFER, async {
            let mut stream = client.open(peer, protocols::SHARD_TRANSFER).await?;
            stream.send(offer.encode()?).await?;
            let handshake: AcceptShardData = read_response(stream.as_mut()).await?.into_data()?;
            if !handshake.accepted {
                let _ = stream.close().await;
                return Ok(None);
            }

            let push = ShardPush {
                shard: shard.clone(),
                dataset: if handshake.need_dataset { dataset } else { None },
            };
            write_json(stream.as_mut(), &push).await?;
            stream.send(payload).await?;
            let done: TransferData = read_response(stream.as_mut()).await?.into_data()?;
            let _ = stream.close().await;
            Ok(Some(done))
        })
        .await
        .map_err(|e| transfer_error(shard_id, peer, e))?;

    let record = match answer {
        Some(done) => {
            if !done.shard.node_ids.contains(peer) {
                return Err(ReplicationError::TransferFailed {
                    shard_id: shard_id.to_string(),
                    peer: peer.clone(),
                    reason: "receiver did not record itself as holder".into(),
                });
            }
            ctx.apply_shard(done.shard).await?.record
        }
        None => {
            debug!(shard_id = %shard_id, peer = %peer, "peer already holds shard");
            ctx.record_holder(shard_id, peer).await?;
            ctx.shard(shard_id)?
        }
    };
    info!(shard_id = %shard_id, peer = %peer, holders = record.node_ids.len(), "pushed shard");
    Ok(record)
}

/// Pulls a shard and its payload from `peer` and records this node as a
/// holder.
pub async fn pull_shard(
    ctx: &ShardingContext,
    peer: &NodeId,
    shard_id: &str,
) -> Result<ShardMetadata> {
    if !ctx.role().stores_shards() {
        return Err(ReplicationError::InvalidArgument(format!(
            "role {} does not store shards",
            ctx.role()
        )));
    }

    let client = ctx.client();
    let request = ShardTransferRequest::TransferShard {
        shard_id: shard_id.to_string(),
    };
    let (data, payload) = client
        .bounded(peer, protocols::SHARD_TRANSFER, async {
            let mut stream = client.open(peer, protocols::SHARD_TRANSFER).await?;
            stream.send(request.encode()?).await?;
            let data: TransferData = read_response(stream.as_mut()).await?.into_data()?;
            let payload = stream.receive().await?;
            let _ = stream.close().await;
            Ok((data, payload))
        })
        .await
        .map_err(|e| transfer_error(shard_id, peer, e))?;

    let failed = |reason: &str| ReplicationError::TransferFailed {
        shard_id: shard_id.to_string(),
        peer: peer.clone(),
        reason: reason.to_string(),
    };
    if data.shard.shard_id != shard_id {
        return Err(failed("peer sent a different shard"));
    }
    let content_id = ctx.content().put(payload).await?;
    if content_id != data.shard.content_id {
        return Err(failed("payload does not match content id"));
    }

    if let Some(dataset) = data.dataset {
        ctx.apply_dataset(dataset).await?;
    }
    let record = ctx.adopt_shard(data.shard).await?.record;
    info!(shard_id = %shard_id, peer = %peer, "pulled shard");
    Ok(record)
}

/// Serves the shard-transfer protocol.
#[derive(Debug)]
pub struct ShardTransferHandler {
    ctx: Arc<ShardingContext>,
}

impl ShardTransferHandler {
    #[must_use]
    pub fn new(ctx: Arc<ShardingContext>) -> Self {
        Self { ctx }
    }

    async fn accept(
        &self,
        peer: &NodeId,
        stream: &mut dyn PeerStream,
        shard_id: String,
        dataset_id: String,
        content_id: String,
    ) -> shardmesh_p2p::Result<()> {
        let ctx = &self.ctx;
        if !ctx.role().stores_shards() {
            let refusal = format!("role {} does not store shards", ctx.role());
            return write_response(stream, &Response::error(refusal)).await;
        }

        if let Some(existing) = ctx.find_shard(&shard_id)? {
            if existing.content_id == content_id && ctx.holds_payload(&existing).await? {
                let declined = AcceptShardData {
                    accepted: false,
                    need_dataset: false,
                };
                return write_response(stream, &Response::success(declined)?).await;
            }
        }

        let need_dataset = ctx.find_dataset(&dataset_id)?.is_none();
        let accepted = AcceptShardData {
            accepted: true,
            need_dataset,
        };
        write_response(stream, &Response::success(accepted)?).await?;

        let push: ShardPush = read_json(stream).await?;
        let payload = stream.receive().await?;
        if push.shard.shard_id != shard_id || push.shard.content_id != content_id {
            return write_response(stream, &Response::error("pushed shard does not match offer"))
                .await;
        }
        let stored = ctx
            .content()
            .put(payload)
            .await
            .map_err(ReplicationError::from)?;
        if stored != content_id {
            warn!(shard_id = %shard_id, peer = %peer, "rejected payload with wrong content id");
            return write_response(stream, &Response::error("payload does not match content id"))
                .await;
        }

        if let Some(dataset) = push.dataset {
            ctx.apply_dataset(dataset).await?;
        }
        let merged = ctx.adopt_shard(push.shard).await?;
        info!(shard_id = %shard_id, from = %peer, "accepted shard");
        let done = TransferData {
            shard: merged.record,
            dataset: None,
        };
        write_response(stream, &Response::success(done)?).await
    }

    async fn serve(&self, stream: &mut dyn PeerStream, shard_id: String) -> shardmesh_p2p::Result<()> {
        let ctx = &self.ctx;
        let Some(shard) = ctx.find_shard(&shard_id)? else {
            return write_response(stream, &Response::not_found(format!("shard {shard_id}"))).await;
        };
        let payload = ctx
            .content()
            .get(&shard.content_id)
            .await
            .map_err(ReplicationError::from)?;
        let Some(payload) = payload else {
            return write_response(
                stream,
                &Response::not_found(format!("payload of shard {shard_id}")),
            )
            .await;
        };

        let data = TransferData {
            dataset: ctx.find_dataset(&shard.dataset_id)?,
            shard,
        };
        write_response(stream, &Response::success(data)?).await?;
        stream.send(payload).await
    }
}

#[async_trait]
impl ProtocolHandler for ShardTransferHandler {
    async fn handle(&self, peer: &NodeId, stream: &mut dyn PeerStream) -> shardmesh_p2p::Result<()> {
        match read_request(stream).await? {
            ShardTransferRequest::AcceptShard {
                shard_id,
                dataset_id,
                content_id,
            } => {
                self.accept(peer, stream, shard_id, dataset_id, content_id)
                    .await
            }
            ShardTransferRequest::TransferShard { shard_id } => self.serve(stream, shard_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{id, mesh, node};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use shardmesh_p2p::MemoryNetwork;
    use shardmesh_types::{DatasetMetadata, NewDataset, NodeRole};
    use std::collections::BTreeSet;

    async fn seed(ctx: &ShardingContext) -> ShardMetadata {
        let mut ds = DatasetMetadata::new("ds", NewDataset::new("d"), ctx.local_id().clone());
        ds.add_shard_id("ds-shard-0");
        ctx.store().put_dataset(&ds).unwrap();
        let content_id = ctx
            .content()
            .put(Bytes::from_static(b"{\"text\":\"hello\"}\n"))
            .await
            .unwrap();
        let shard = ShardMetadata::new("ds", 0, 1, 1, content_id, ctx.local_id().clone());
        ctx.apply_shard(shard).await.unwrap().record
    }

    #[tokio::test]
    async fn push_replicates_payload_and_dataset() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let b = node(&network, "b", NodeRole::Worker);
        mesh(&[&a, &b]);
        let shard = seed(&a).await;

        let record = push_shard(&a, &id("b"), "ds-shard-0").await.unwrap();
        assert_eq!(record.node_ids, BTreeSet::from([id("a"), id("b")]));

        let on_b = b.shard("ds-shard-0").unwrap();
        assert_eq!(on_b.node_ids, record.node_ids);
        assert!(b.content().contains(&shard.content_id).await.unwrap());
        assert_eq!(b.dataset("ds").unwrap().total_records, 1);
    }

    #[tokio::test]
    async fn second_push_is_declined_but_succeeds() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let _b = node(&network, "b", NodeRole::Worker);
        seed(&a).await;

        push_shard(&a, &id("b"), "ds-shard-0").await.unwrap();
        let again = push_shard(&a, &id("b"), "ds-shard-0").await.unwrap();
        assert!(again.node_ids.contains(&id("b")));
    }

    #[tokio::test]
    async fn client_role_rejects_offers() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let c = node(&network, "c", NodeRole::Client);
        seed(&a).await;

        let err = push_shard(&a, &id("c"), "ds-shard-0").await.unwrap_err();
        assert!(matches!(err, ReplicationError::TransferFailed { .. }));
        assert!(c.find_shard("ds-shard-0").unwrap().is_none());
        assert_eq!(a.shard("ds-shard-0").unwrap().node_ids.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_peer_is_reported() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let _b = node(&network, "b", NodeRole::Worker);
        seed(&a).await;
        network.set_reachable(&id("b"), false);

        let err = push_shard(&a, &id("b"), "ds-shard-0").await.unwrap_err();
        assert!(matches!(err, ReplicationError::PeerUnreachable { .. }));
    }

    #[tokio::test]
    async fn pull_fetches_payload() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", NodeRole::Hybrid);
        let b = node(&network, "b", NodeRole::Worker);
        let shard = seed(&a).await;

        let record = pull_shard(&b, &id("a"), "ds-shard-0").await.unwrap();
        assert_eq!(record.node_ids, BTreeSet::from([id("a"), id("b")]));
        assert!(b.content().contains(&shard.content_id).await.unwrap());
        assert_eq!(b.dataset("ds").unwrap().name, "d");
    }

    #[tokio::test]
    async fn pull_of_unknown_shard_fails() {
        let network = MemoryNetwork::new();
        let _a = node(&network, "a", NodeRole::Hybrid);
        let b = node(&network, "b", NodeRole::Worker);

        let err = pull_shard(&b, &id("a"), "nope").await.unwrap_err();
        assert!(matches!(err, ReplicationError::TransferFailed { .. }));
    }
}
