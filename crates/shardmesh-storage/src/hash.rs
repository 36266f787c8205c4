//! Content ids for shard payloads.
//!
//! A shard's `content_id` is the lowercase hex SHA-256 of its encoded
//! payload, so any node can check a received payload against the metadata
//! that announced it.

use crate::{Result, StorageError};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// SHA-256 digest of a shard payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hashes a payload.
    #[must_use]
    pub fn of(payload: &[u8]) -> Self {
        Self(Sha256::digest(payload).into())
    }

    /// Whether `payload` hashes to this id.
    #[must_use]
    pub fn matches(&self, payload: &[u8]) -> bool {
        Self::of(payload) == *self
    }

    /// The `content_id` string stored in shard metadata.
    #[must_use]
    pub fn content_id(&self) -> String {
        hex::encode(self.0)
    }

    /// Two-character directory bucket used by file-backed stores.
    #[must_use]
    pub fn bucket(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl FromStr for ContentHash {
    type Err = StorageError;

    fn from_str(content_id: &str) -> Result<Self> {
        let mut digest = [0u8; 32];
        hex::decode_to_slice(content_id, &mut digest)
            .map_err(|_| StorageError::NotFound(format!("content {content_id}")))?;
        Ok(Self(digest))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.content_id();
        write!(f, "ContentHash({}..)", &id[..12])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content_id())
    }
}
