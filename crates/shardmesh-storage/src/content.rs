//! Content-addressed shard payload storage.

use crate::{ContentHash, Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Stores shard payloads under the hex SHA-256 of their bytes.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Stores a payload and returns its content id.
    async fn put(&self, data: Bytes) -> Result<String>;

    /// Reads a payload by content id.
    async fn get(&self, content_id: &str) -> Result<Option<Bytes>>;

    /// Checks whether a payload exists.
    async fn contains(&self, content_id: &str) -> Result<bool>;
}

/// In-memory content store for tests.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    data: RwLock<HashMap<String, Bytes>>,
}

impl MemoryContentStore {
    /// Creates a new in-memory content store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: Bytes) -> Result<String> {
        let id = ContentHash::of(&data).content_id();
        self.data.write().insert(id.clone(), data);
        Ok(id)
    }

    async fn get(&self, content_id: &str) -> Result<Option<Bytes>> {
        Ok(self.data.read().get(content_id).cloned())
    }

    async fn contains(&self, content_id: &str) -> Result<bool> {
        Ok(self.data.read().contains_key(content_id))
    }
}

/// Content store that keeps each payload in its own file.
#[derive(Debug, Clone)]
pub struct FileContentStore {
    root: PathBuf,
}

impl FileContentStore {
    /// Creates a content store rooted at `root`, creating the directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    // Only well-formed ids map to files.
    fn path_for(&self, content_id: &str) -> Result<(ContentHash, PathBuf)> {
        let hash: ContentHash = content_id.parse()?;
        let path = self.root.join(hash.bucket()).join(hash.content_id());
        Ok((hash, path))
    }
}

#[async_trait]
impl ContentStore for FileContentStore {
    async fn put(&self, data: Bytes) -> Result<String> {
        let id = ContentHash::of(&data).content_id();
        let (_, path) = self.path_for(&id)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(id);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(id)
    }

    async fn get(&self, content_id: &str) -> Result<Option<Bytes>> {
        let Ok((hash, path)) = self.path_for(content_id) else {
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(data) if hash.matches(&data) => Ok(Some(Bytes::from(data))),
            Ok(_) => Err(StorageError::Corruption(format!(
                "payload {content_id} does not match its id"
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, content_id: &str) -> Result<bool> {
        let Ok((_, path)) = self.path_for(content_id) else {
            return Ok(false);
        };
        Ok(tokio::fs::try_exists(&path).await?)
    }
}
