//! Per-record locks.
//!
//! Store writes are whole-record replacements, so concurrent
//! read-modify-write cycles on the same record must be serialized by the
//! caller. `RecordLocks` hands out one async mutex per record key; unrelated
//! records never contend.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard returned by [`RecordLocks`]. The record is unlocked on drop.
pub type RecordGuard = OwnedMutexGuard<()>;

/// Keyed async mutexes for dataset and shard records.
#[derive(Debug, Default)]
pub struct RecordLocks {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RecordLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the dataset record `dataset_id`.
    pub async fn dataset(&self, dataset_id: &str) -> RecordGuard {
        self.lock(format!("dataset:{dataset_id}")).await
    }

    /// Locks the shard record `shard_id`.
    pub async fn shard(&self, shard_id: &str) -> RecordGuard {
        self.lock(format!("shard:{shard_id}")).await
    }

    async fn lock(&self, key: String) -> RecordGuard {
        let mutex = {
            let mut entries = self.entries.lock();
            // Entries only referenced by the table are idle.
            entries.retain(|_, m| Arc::strong_count(m) > 1);
            entries.entry(key).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Number of records currently locked or awaited.
    #[must_use]
    pub fn active(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|m| Arc::strong_count(m) > 1)
            .count()
    }
}
