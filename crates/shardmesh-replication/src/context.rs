//! Shared node state for the replication components.
//!
//! Every engine and handler on a node works through one [`ShardingContext`].
//! All metadata merges happen here, under per-record locks, so concurrent
//! inbound streams and outbound rounds never lose each other's writes.

use crate::{ReplicationError, Result};
use shardmesh_p2p::{Membership, PeerClient};
use shardmesh_storage::{
    ContentStore, JsonLinesEncoder, MetadataStore, RecordEncoder, RecordLocks,
};
use shardmesh_types::{DatasetMetadata, NodeId, NodeRole, ShardMetadata, Timestamp};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Whether a merge changed the local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The local record was created or replaced.
    Applied,
    /// The local record already covered the incoming one.
    Unchanged,
}

impl MergeOutcome {
    /// Whether the local record changed.
    #[must_use]
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Result of merging a record, with the record as stored afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged<T> {
    pub outcome: MergeOutcome,
    pub record: T,
}

/// Stores, collaborators and membership of one node.
pub struct ShardingContext {
    membership: Arc<Membership>,
    store: Arc<dyn MetadataStore>,
    content: Arc<dyn ContentStore>,
    encoder: Arc<dyn RecordEncoder>,
    locks: RecordLocks,
}

impl ShardingContext {
    /// Creates a context using the JSON-lines record encoder.
    pub fn new(
        membership: Arc<Membership>,
        store: Arc<dyn MetadataStore>,
        content: Arc<dyn ContentStore>,
    ) -> Self {
        Self {
            membership,
            store,
            content,
            encoder: Arc::new(JsonLinesEncoder),
            locks: RecordLocks::new(),
        }
    }

    /// Replaces the record encoder.
    #[must_use]
    pub fn with_encoder(mut self, encoder: Arc<dyn RecordEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        self.membership.local_id()
    }

    #[must_use]
    pub fn role(&self) -> NodeRole {
        self.membership.role()
    }

    #[must_use]
    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    #[must_use]
    pub fn client(&self) -> &PeerClient {
        self.membership.client()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    #[must_use]
    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    #[must_use]
    pub fn encoder(&self) -> &Arc<dyn RecordEncoder> {
        &self.encoder
    }

    #[must_use]
    pub fn locks(&self) -> &RecordLocks {
        &self.locks
    }

    /// Fails unless this node may create and distribute datasets.
    pub fn ensure_can_coordinate(&self) -> Result<()> {
        if self.role().can_coordinate() {
            Ok(())
        } else {
            Err(ReplicationError::InvalidArgument(format!(
                "role {} cannot create or distribute datasets",
                self.role()
            )))
        }
    }

    /// Loads a dataset record if it is known locally.
    pub fn find_dataset(&self, dataset_id: &str) -> Result<Option<DatasetMetadata>> {
        Ok(self.store.get_dataset(dataset_id)?)
    }

    /// Loads a shard record if it is known locally.
    pub fn find_shard(&self, shard_id: &str) -> Result<Option<ShardMetadata>> {
        Ok(self.store.get_shard(shard_id)?)
    }

    /// Loads a dataset record or fails with `NotFound`.
    pub fn dataset(&self, dataset_id: &str) -> Result<DatasetMetadata> {
        self.store
            .get_dataset(dataset_id)?
            .ok_or_else(|| ReplicationError::dataset_not_found(dataset_id))
    }

    /// Loads a shard record or fails with `NotFound`.
    pub fn shard(&self, shard_id: &str) -> Result<ShardMetadata> {
        self.store
            .get_shard(shard_id)?
            .ok_or_else(|| ReplicationError::shard_not_found(shard_id))
    }

    /// Whether this node lists itself as a holder and has the payload.
    pub async fn holds_payload(&self, shard: &ShardMetadata) -> Result<bool> {
        Ok(shard.node_ids.contains(self.local_id())
            && self.content.contains(&shard.content_id).await?)
    }

    /// Version of every local dataset.
    pub fn dataset_timestamps(&self) -> Result<BTreeMap<String, Timestamp>> {
        Ok(self
            .store
            .list_datasets()?
            .into_iter()
            .map(|d| (d.dataset_id, d.modified_time))
            .collect())
    }

    /// Version of every local shard, optionally limited to one dataset.
    pub fn shard_timestamps(&self, dataset_id: Option<&str>) -> Result<BTreeMap<String, Timestamp>> {
        let shards = match dataset_id {
            Some(id) => self.store.list_shards_for_dataset(id)?,
            None => self.store.list_shards()?,
        };
        Ok(shards
            .into_iter()
            .map(|s| (s.shard_id, s.modified_time))
            .collect())
    }

    /// Merges a dataset record from a peer under last-write-wins, then
    /// reconciles its shard list and totals against local shards.
    pub async fn apply_dataset(&self, incoming: DatasetMetadata) -> Result<Merged<DatasetMetadata>> {
        let dataset_id = incoming.dataset_id.clone();
        let outcome = {
            let _guard = self.locks.dataset(&dataset_id).await;
            match self.store.get_dataset(&dataset_id)? {
                Some(local) if !incoming.supersedes(&local) => MergeOutcome::Unchanged,
                _ => {
                    self.store.put_dataset(&incoming)?;
                    debug!(dataset_id = %dataset_id, version = %incoming.modified_time, "applied dataset");
                    MergeOutcome::Applied
                }
            }
        };
        let reconciled = self.reconcile_dataset(&dataset_id).await?;
        Ok(Merged {
            outcome: if reconciled { MergeOutcome::Applied } else { outcome },
            record: self.dataset(&dataset_id)?,
        })
    }

    /// Lists every local shard of the dataset in its `shard_ids` and
    /// recomputes `total_records` once all listed shards are known locally.
    ///
    /// Returns `true` if the dataset record changed. A missing dataset is not
    /// an error: shards may arrive before their dataset.
    pub async fn reconcile_dataset(&self, dataset_id: &str) -> Result<bool> {
        let _guard = self.locks.dataset(dataset_id).await;
        self.reconcile_dataset_locked(dataset_id)
    }

    /// [`Self::reconcile_dataset`] for callers already holding the dataset
    /// lock.
    pub(crate) fn reconcile_dataset_locked(&self, dataset_id: &str) -> Result<bool> {
        let Some(mut dataset) = self.store.get_dataset(dataset_id)? else {
            return Ok(false);
        };
        let shards = self.store.list_shards_for_dataset(dataset_id)?;

        let mut changed = false;
        for shard in &shards {
            changed |= dataset.add_shard_id(&shard.shard_id);
        }

        let counts: BTreeMap<&str, u64> = shards
            .iter()
            .map(|s| (s.shard_id.as_str(), s.record_count))
            .collect();
        if dataset.shard_ids.iter().all(|id| counts.contains_key(id.as_str())) {
            let total: u64 = counts.values().sum();
            if total != dataset.total_records {
                dataset.total_records = total;
                changed = true;
            }
        }

        if changed {
            dataset.touch();
            self.store.put_dataset(&dataset)?;
            debug!(
                dataset_id = %dataset_id,
                shards = dataset.shard_ids.len(),
                total_records = dataset.total_records,
                "reconciled dataset"
            );
        }
        Ok(changed)
    }

    /// Merges a shard record: the newer record wins, and the holder sets of
    /// both sides are always unioned. A merged record that gained holders
    /// over the winner gets a fresh version so the union propagates.
    pub async fn apply_shard(&self, incoming: ShardMetadata) -> Result<Merged<ShardMetadata>> {
        let shard_id = incoming.shard_id.clone();
        let dataset_id = incoming.dataset_id.clone();
        let merged = {
            let _guard = self.locks.shard(&shard_id).await;
            match self.store.get_shard(&shard_id)? {
                None => {
                    self.store.put_shard(&incoming)?;
                    Merged {
                        outcome: MergeOutcome::Applied,
                        record: incoming,
                    }
                }
                Some(local) => {
                    let (mut winner, loser, local_won) = if incoming.supersedes(&local) {
                        (incoming, local, false)
                    } else {
                        (local, incoming, true)
                    };
                    let grew = winner.merge_holders(&loser.node_ids);
                    if grew {
                        winner.touch();
                    }
                    if local_won && !grew {
                        Merged {
                            outcome: MergeOutcome::Unchanged,
                            record: winner,
                        }
                    } else {
                        self.store.put_shard(&winner)?;
                        Merged {
                            outcome: MergeOutcome::Applied,
                            record: winner,
                        }
                    }
                }
            }
        };
        if merged.outcome.is_applied() {
            debug!(
                shard_id = %shard_id,
                holders = merged.record.node_ids.len(),
                version = %merged.record.modified_time,
                "applied shard"
            );
            self.reconcile_dataset(&dataset_id).await?;
        }
        Ok(merged)
    }

    /// Adds `node` to the shard's holders. Returns `true` if it was new.
    pub async fn record_holder(&self, shard_id: &str, node: &NodeId) -> Result<bool> {
        let _guard = self.locks.shard(shard_id).await;
        let mut shard = self.shard(shard_id)?;
        if !shard.add_holder(node.clone()) {
            return Ok(false);
        }
        shard.touch();
        self.store.put_shard(&shard)?;
        debug!(shard_id = %shard_id, holder = %node, "recorded holder");
        Ok(true)
    }

    /// Records this node as a holder of a shard it just stored.
    pub async fn adopt_shard(&self, mut shard: ShardMetadata) -> Result<Merged<ShardMetadata>> {
        if shard.add_holder(self.local_id().clone()) {
            shard.touch();
        }
        self.apply_shard(shard).await
    }

    /// Holders of a shard that are this node or in `live`.
    #[must_use]
    pub fn live_holders(&self, shard: &ShardMetadata, live: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        shard
            .node_ids
            .iter()
            .filter(|n| *n == self.local_id() || live.contains(*n))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for ShardingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardingContext")
            .field("node_id", self.local_id())
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}
