//! In-memory metadata store.

use crate::traits::{sort_by_index, Lifecycle};
use crate::{MetadataStore, Result, StoreStats};
use parking_lot::RwLock;
use shardmesh_types::{DatasetMetadata, ShardMetadata};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metadata store that keeps everything in memory.
///
/// Contents survive `close`/`open` cycles of the same instance but not the
/// process. Used for tests and client-role nodes.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    datasets: RwLock<HashMap<String, DatasetMetadata>>,
    shards: RwLock<HashMap<String, ShardMetadata>>,
    lifecycle: Lifecycle,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryMetadataStore {
    /// Creates a new, closed, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read_op(&self) -> Result<()> {
        self.lifecycle.ensure_open()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_op(&self) -> Result<()> {
        self.lifecycle.ensure_open()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn open(&self) -> Result<()> {
        self.lifecycle.set_open(true);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.lifecycle.set_open(false);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    fn put_dataset(&self, dataset: &DatasetMetadata) -> Result<()> {
        self.write_op()?;
        self.datasets
            .write()
            .insert(dataset.dataset_id.clone(), dataset.clone());
        Ok(())
    }

    fn get_dataset(&self, dataset_id: &str) -> Result<Option<DatasetMetadata>> {
        self.read_op()?;
        Ok(self.datasets.read().get(dataset_id).cloned())
    }

    fn list_datasets(&self) -> Result<Vec<DatasetMetadata>> {
        self.read_op()?;
        Ok(self.datasets.read().values().cloned().collect())
    }

    fn put_shard(&self, shard: &ShardMetadata) -> Result<()> {
        self.write_op()?;
        self.shards
            .write()
            .insert(shard.shard_id.clone(), shard.clone());
        Ok(())
    }

    fn get_shard(&self, shard_id: &str) -> Result<Option<ShardMetadata>> {
        self.read_op()?;
        Ok(self.shards.read().get(shard_id).cloned())
    }

    fn list_shards_for_dataset(&self, dataset_id: &str) -> Result<Vec<ShardMetadata>> {
        self.read_op()?;
        let mut shards: Vec<_> = self
            .shards
            .read()
            .values()
            .filter(|s| s.dataset_id == dataset_id)
            .cloned()
            .collect();
        sort_by_index(&mut shards);
        Ok(shards)
    }

    fn list_shards(&self) -> Result<Vec<ShardMetadata>> {
        self.read_op()?;
        Ok(self.shards.read().values().cloned().collect())
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            datasets: self.datasets.read().len() as u64,
            shards: self.shards.read().len() as u64,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::conformance;

    fn open_store() -> MemoryMetadataStore {
        let store = MemoryMetadataStore::new();
        store.open().unwrap();
        store
    }

    #[test]
    fn closed_store_rejects_access() {
        conformance::closed_store_rejects_access(&MemoryMetadataStore::new());
    }

    #[test]
    fn datasets_roundtrip() {
        conformance::datasets_roundtrip(&open_store());
    }

    #[test]
    fn shards_grouped_by_dataset() {
        conformance::shards_grouped_by_dataset(&open_store());
    }

    #[test]
    fn stats_count_operations() {
        let store = open_store();
        store.put_dataset(&conformance::dataset("ds")).unwrap();
        store.get_dataset("ds").unwrap();
        store.get_dataset("ds").unwrap();

        let stats = store.stats();
        assert_eq!(stats.datasets, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 2);
    }

    #[test]
    fn reopen_keeps_contents() {
        let store = open_store();
        store.put_dataset(&conformance::dataset("ds")).unwrap();
        store.close().unwrap();
        store.open().unwrap();
        assert!(store.get_dataset("ds").unwrap().is_some());
    }
}
