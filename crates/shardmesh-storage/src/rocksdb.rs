//! RocksDB metadata store.
//!
//! Dataset and shard records live in separate column families as JSON
//! values keyed by id.

use crate::traits::sort_by_index;
use crate::{MetadataStore, Result, StorageError, StoreStats};
use parking_lot::RwLock;
use rocksdb::{BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, Options, DB};
use serde::de::DeserializeOwned;
use shardmesh_types::{DatasetMetadata, ShardMetadata};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// RocksDB storage configuration.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Path to the database directory.
    pub path: PathBuf,

    /// Write buffer size in bytes.
    pub write_buffer_size: usize,

    /// Number of background compaction threads.
    pub background_jobs: i32,

    /// Enable LZ4 compression.
    pub compression_enabled: bool,

    /// Bloom filter bits per key (0 to disable).
    pub bloom_filter_bits: i32,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/metadata"),
            write_buffer_size: 16 * 1024 * 1024, // 16 MB
            background_jobs: 2,
            compression_enabled: true,
            bloom_filter_bits: 10,
        }
    }
}

const CF_DATASETS: &str = "datasets";
const CF_SHARDS: &str = "shards";

fn backend_err(e: rocksdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Metadata store persisted in RocksDB.
///
/// The database handle exists only while the store is open.
pub struct RocksDbMetadataStore {
    config: RocksDbConfig,
    db: RwLock<Option<DB>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RocksDbMetadataStore {
    /// Creates a closed store with the given configuration.
    #[must_use]
    pub fn new(config: RocksDbConfig) -> Self {
        Self {
            config,
            db: RwLock::new(None),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Creates a closed store at `path` with default tuning.
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self::new(RocksDbConfig {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        })
    }

    fn options(&self) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(self.config.write_buffer_size);
        opts.increase_parallelism(self.config.background_jobs);
        opts.set_max_background_jobs(self.config.background_jobs);

        if self.config.compression_enabled {
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        }

        let mut block_opts = BlockBasedOptions::default();
        if self.config.bloom_filter_bits > 0 {
            block_opts.set_bloom_filter(self.config.bloom_filter_bits as f64, false);
        }
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
        db.cf_handle(name)
            .ok_or_else(|| StorageError::Corruption(format!("missing column family '{name}'")))
    }

    fn put_json<T: serde::Serialize>(&self, cf: &str, key: &str, value: &T) -> Result<()> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StorageError::Closed)?;
        let data = serde_json::to_vec(value)?;
        db.put_cf(Self::cf(db, cf)?, key.as_bytes(), data)
            .map_err(backend_err)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &str) -> Result<Option<T>> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StorageError::Closed)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        match db.get_cf(Self::cf(db, cf)?, key.as_bytes()).map_err(backend_err)? {
            Some(data) => Ok(Some(decode(key, &data)?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StorageError::Closed)?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let mut out = Vec::new();
        for item in db.iterator_cf(Self::cf(db, cf)?, rocksdb::IteratorMode::Start) {
            let (key, value) = item.map_err(backend_err)?;
            out.push(decode(&String::from_utf8_lossy(&key), &value)?);
        }
        Ok(out)
    }

    fn count(&self, cf: &str) -> u64 {
        let guard = self.db.read();
        let Some(db) = guard.as_ref() else {
            return 0;
        };
        match Self::cf(db, cf) {
            Ok(handle) => db
                .iterator_cf(handle, rocksdb::IteratorMode::Start)
                .count() as u64,
            Err(_) => 0,
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| StorageError::Corruption(format!("{key}: {e}")))
}

impl MetadataStore for RocksDbMetadataStore {
    fn open(&self) -> Result<()> {
        let mut guard = self.db.write();
        if guard.is_some() {
            return Ok(());
        }

        let opts = self.options();
        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_DATASETS, opts.clone()),
            ColumnFamilyDescriptor::new(CF_SHARDS, opts.clone()),
        ];
        let db = DB::open_cf_descriptors(&opts, &self.config.path, cfs).map_err(backend_err)?;

        tracing::info!(path = %self.config.path.display(), "opened rocksdb metadata store");
        *guard = Some(db);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.db.write();
        if let Some(db) = guard.take() {
            db.flush().map_err(backend_err)?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.db.read().is_some()
    }

    fn put_dataset(&self, dataset: &DatasetMetadata) -> Result<()> {
        self.put_json(CF_DATASETS, &dataset.dataset_id, dataset)
    }

    fn get_dataset(&self, dataset_id: &str) -> Result<Option<DatasetMetadata>> {
        self.get_json(CF_DATASETS, dataset_id)
    }

    fn list_datasets(&self) -> Result<Vec<DatasetMetadata>> {
        self.scan_json(CF_DATASETS)
    }

    fn put_shard(&self, shard: &ShardMetadata) -> Result<()> {
        self.put_json(CF_SHARDS, &shard.shard_id, shard)
    }

    fn get_shard(&self, shard_id: &str) -> Result<Option<ShardMetadata>> {
        self.get_json(CF_SHARDS, shard_id)
    }

    fn list_shards_for_dataset(&self, dataset_id: &str) -> Result<Vec<ShardMetadata>> {
        let mut shards: Vec<ShardMetadata> = self
            .scan_json::<ShardMetadata>(CF_SHARDS)?
            .into_iter()
            .filter(|s| s.dataset_id == dataset_id)
            .collect();
        sort_by_index(&mut shards);
        Ok(shards)
    }

    fn list_shards(&self) -> Result<Vec<ShardMetadata>> {
        self.scan_json(CF_SHARDS)
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            datasets: self.count(CF_DATASETS),
            shards: self.count(CF_SHARDS),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::conformance;
    use tempfile::TempDir;

    fn open_store() -> (RocksDbMetadataStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksDbMetadataStore::with_path(dir.path());
        store.open().unwrap();
        (store, dir)
    }

    #[test]
    fn closed_store_rejects_access() {
        let dir = TempDir::new().unwrap();
        conformance::closed_store_rejects_access(&RocksDbMetadataStore::with_path(dir.path()));
    }

    #[test]
    fn datasets_roundtrip() {
        let (store, _dir) = open_store();
        conformance::datasets_roundtrip(&store);
    }

    #[test]
    fn shards_grouped_by_dataset() {
        let (store, _dir) = open_store();
        conformance::shards_grouped_by_dataset(&store);
    }

    #[test]
    fn records_survive_reopen() {
        let (store, _dir) = open_store();
        store.put_shard(&conformance::shard("ds", 0, 9)).unwrap();
        store.close().unwrap();
        assert!(!store.is_open());

        store.open().unwrap();
        assert_eq!(store.get_shard("ds-shard-0").unwrap().unwrap().record_count, 9);
        assert_eq!(store.stats().shards, 1);
    }
}
