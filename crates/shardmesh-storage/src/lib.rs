//! Storage for shardmesh nodes.
//!
//! This crate holds a node's view of the distributed state and the shard
//! payloads it serves:
//!
//! - [`MetadataStore`]: durable, whole-record storage of dataset and shard
//!   metadata with an explicit `open`/`close` lifecycle. Backends: in-memory,
//!   JSON files on disk, and RocksDB (feature `rocksdb-backend`).
//! - [`ContentStore`]: content-addressed shard payloads keyed by SHA-256.
//! - [`RecordEncoder`]: converts records to and from shard payload bytes.
//! - [`RecordLocks`]: per-record async locks for read-modify-write cycles.

mod content;
mod encoder;
mod error;
mod file;
mod hash;
mod locks;
mod memory;
mod traits;

#[cfg(feature = "rocksdb-backend")]
mod rocksdb;

pub use content::{ContentStore, FileContentStore, MemoryContentStore};
pub use encoder::{JsonLinesEncoder, RecordEncoder};
pub use error::StorageError;
pub use file::FileMetadataStore;
pub use hash::ContentHash;
pub use locks::{RecordGuard, RecordLocks};
pub use memory::MemoryMetadataStore;
pub use traits::{MetadataStore, StoreStats};

#[cfg(feature = "rocksdb-backend")]
pub use rocksdb::{RocksDbConfig, RocksDbMetadataStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
