//! Metadata store traits.
//!
//! Defines the interface every metadata backend implements. Writes are
//! whole-record replacements keyed by id; merging concurrent versions is the
//! caller's job.

use crate::{Result, StorageError};
use shardmesh_types::{DatasetMetadata, ShardMetadata};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Durable storage of dataset and shard metadata.
///
/// A store starts closed. Every read or write before [`open`](Self::open) or
/// after [`close`](Self::close) fails with [`StorageError::Closed`].
pub trait MetadataStore: Send + Sync {
    /// Opens the store, loading or creating its on-disk state.
    fn open(&self) -> Result<()>;

    /// Flushes pending writes and closes the store.
    fn close(&self) -> Result<()>;

    /// Whether the store is currently open.
    fn is_open(&self) -> bool;

    /// Stores a dataset record, replacing any previous version.
    fn put_dataset(&self, dataset: &DatasetMetadata) -> Result<()>;

    /// Retrieves a dataset record by id.
    fn get_dataset(&self, dataset_id: &str) -> Result<Option<DatasetMetadata>>;

    /// Lists every dataset record.
    fn list_datasets(&self) -> Result<Vec<DatasetMetadata>>;

    /// Stores a shard record, replacing any previous version.
    fn put_shard(&self, shard: &ShardMetadata) -> Result<()>;

    /// Retrieves a shard record by id.
    fn get_shard(&self, shard_id: &str) -> Result<Option<ShardMetadata>>;

    /// Lists the shard records belonging to a dataset, ordered by shard index.
    fn list_shards_for_dataset(&self, dataset_id: &str) -> Result<Vec<ShardMetadata>>;

    /// Lists every shard record.
    fn list_shards(&self) -> Result<Vec<ShardMetadata>>;

    /// Returns store statistics.
    fn stats(&self) -> StoreStats {
        StoreStats::default()
    }
}

impl<T: MetadataStore> MetadataStore for Arc<T> {
    fn open(&self) -> Result<()> {
        (**self).open()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn put_dataset(&self, dataset: &DatasetMetadata) -> Result<()> {
        (**self).put_dataset(dataset)
    }

    fn get_dataset(&self, dataset_id: &str) -> Result<Option<DatasetMetadata>> {
        (**self).get_dataset(dataset_id)
    }

    fn list_datasets(&self) -> Result<Vec<DatasetMetadata>> {
        (**self).list_datasets()
    }

    fn put_shard(&self, shard: &ShardMetadata) -> Result<()> {
        (**self).put_shard(shard)
    }

    fn get_shard(&self, shard_id: &str) -> Result<Option<ShardMetadata>> {
        (**self).get_shard(shard_id)
    }

    fn list_shards_for_dataset(&self, dataset_id: &str) -> Result<Vec<ShardMetadata>> {
        (**self).list_shards_for_dataset(dataset_id)
    }

    fn list_shards(&self) -> Result<Vec<ShardMetadata>> {
        (**self).list_shards()
    }

    fn stats(&self) -> StoreStats {
        (**self).stats()
    }
}

/// Metadata store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of dataset records.
    pub datasets: u64,
    /// Number of shard records.
    pub shards: u64,
    /// Number of read operations.
    pub reads: u64,
    /// Number of write operations.
    pub writes: u64,
}

/// Open/closed flag shared by the backends.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    open: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StorageError::Closed)
        }
    }
}

pub(crate) fn sort_by_index(shards: &mut [ShardMetadata]) {
    shards.sort_by(|a, b| {
        a.shard_index
            .cmp(&b.shard_index)
            .then_with(|| a.shard_id.cmp(&b.shard_id))
    });
}
