//! Durable metadata store backed by one JSON file per record.
//!
//! Layout under the store root:
//!
//! ```text
//! datasets/<hex(dataset_id)>.json
//! shards/<hex(shard_id)>.json
//! ```
//!
//! Every write goes to its own temporary file that is then renamed over the
//! record, so a crash never leaves a half-written record behind. Only the
//! rename and the cache update run under the cache lock. Records are cached
//! in memory after `open`.

use crate::traits::{sort_by_index, Lifecycle};
use crate::{MetadataStore, Result, StorageError, StoreStats};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardmesh_types::{DatasetMetadata, ShardMetadata};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const DATASETS_DIR: &str = "datasets";
const SHARDS_DIR: &str = "shards";

/// File-backed metadata store.
#[derive(Debug)]
pub struct FileMetadataStore {
    root: PathBuf,
    datasets: RwLock<HashMap<String, DatasetMetadata>>,
    shards: RwLock<HashMap<String, ShardMetadata>>,
    lifecycle: Lifecycle,
    reads: AtomicU64,
    writes: AtomicU64,
    staged: AtomicU64,
}

impl FileMetadataStore {
    /// Creates a closed store rooted at `root`. Nothing touches disk until
    /// [`open`](MetadataStore::open).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            datasets: RwLock::new(HashMap::new()),
            shards: RwLock::new(HashMap::new()),
            lifecycle: Lifecycle::default(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            staged: AtomicU64::new(0),
        }
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, dir: &str, id: &str) -> PathBuf {
        self.root.join(dir).join(format!("{}.json", hex::encode(id)))
    }

    /// Writes `record` to a fresh temporary file next to its final path and
    /// returns `(tmp, path)`.
    fn stage_record<T: Serialize>(&self, dir: &str, id: &str, record: &T) -> Result<(PathBuf, PathBuf)> {
        let path = self.record_path(dir, id);
        let seq = self.staged.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.{seq}.tmp"));
        let data = serde_json::to_vec_pretty(record)?;
        let written = fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(&data)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok((tmp, path))
    }

    fn load_dir<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<T>> {
        let dir_path = self.root.join(dir);
        fs::create_dir_all(&dir_path)?;

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir_path)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => {}
                Some("tmp") => {
                    // Leftover from an interrupted write.
                    let _ = fs::remove_file(&path);
                    continue;
                }
                _ => continue,
            }
            let data = fs::read(&path)?;
            let record = serde_json::from_slice(&data).map_err(|e| {
                StorageError::Corruption(format!("{}: {e}", path.display()))
            })?;
            records.push(record);
        }
        Ok(records)
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

impl MetadataStore for FileMetadataStore {
    fn open(&self) -> Result<()> {
        let datasets: Vec<DatasetMetadata> = self.load_dir(DATASETS_DIR)?;
        let shards: Vec<ShardMetadata> = self.load_dir(SHARDS_DIR)?;

        tracing::info!(
            root = %self.root.display(),
            datasets = datasets.len(),
            shards = shards.len(),
            "opened file metadata store"
        );

        *self.datasets.write() = datasets
            .into_iter()
            .map(|d| (d.dataset_id.clone(), d))
            .collect();
        *self.shards.write() = shards
            .into_iter()
            .map(|s| (s.shard_id.clone(), s))
            .collect();
        self.lifecycle.set_open(true);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.lifecycle.set_open(false);
        self.datasets.write().clear();
        self.shards.write().clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    fn put_dataset(&self, dataset: &DatasetMetadata) -> Result<()> {
        self.write_op()?;
        let (tmp, path) = self.stage_record(DATASETS_DIR, &dataset.dataset_id, dataset)?;
        let mut datasets = self.datasets.write();
        fs::rename(&tmp, &path)?;
        datasets.insert(dataset.dataset_id.clone(), dataset.clone());
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
        let (tmp, path) = self.stage_record(SHARDS_DIR, &shard.shard_id, shard)?;
        let mut shards = self.shards.write();
        fs::rename(&tmp, &path)?;
        shards.insert(shard.shard_id.clone(), shard.clone());
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
