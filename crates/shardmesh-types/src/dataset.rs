//! Dataset and shard metadata records.

use crate::{NodeId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Derives the id of shard `shard_index` of `dataset_id`.
///
/// Every node computes the same id for the same pair.
#[must_use]
pub fn shard_id_for(dataset_id: &str, shard_index: u32) -> String {
    format!("{dataset_id}-shard-{shard_index}")
}

/// Parameters for creating a dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewDataset {
    /// Display name. Must not be empty.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Opaque schema hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    /// Dimensionality of the vector field, if records carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_dimensions: Option<u32>,
    /// Payload format hint.
    #[serde(default = "default_format")]
    pub format: String,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_format() -> String {
    "jsonl".to_string()
}

impl NewDataset {
    /// Creates dataset parameters with a name and default format.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: default_format(),
            ..Self::default()
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the vector dimensionality hint.
    #[must_use]
    pub fn with_vector_dimensions(mut self, dims: u32) -> Self {
        self.vector_dimensions = Some(dims);
        self
    }

    /// Sets the tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Metadata describing a dataset and the shards it is split into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Globally unique, immutable id.
    pub dataset_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Sum of `record_count` over the shards in `shard_ids`, once converged.
    pub total_records: u64,
    /// Ordered set of shard ids.
    #[serde(default)]
    pub shard_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_dimensions: Option<u32>,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Node that created the dataset. Advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_id: Option<NodeId>,
    pub created_time: Timestamp,
    /// Sync version.
    pub modified_time: Timestamp,
}

impl DatasetMetadata {
    /// Creates an empty dataset record from creation parameters.
    #[must_use]
    pub fn new(dataset_id: impl Into<String>, params: NewDataset, coordinator: NodeId) -> Self {
        let now = Timestamp::now();
        Self {
            dataset_id: dataset_id.into(),
            name: params.name,
            description: params.description,
            total_records: 0,
            shard_ids: Vec::new(),
            schema: params.schema,
            vector_dimensions: params.vector_dimensions,
            format: params.format,
            tags: params.tags,
            coordinator_id: Some(coordinator),
            created_time: now,
            modified_time: now,
        }
    }

    /// Appends a shard id if it is not already present.
    ///
    /// Returns `true` if the id was added.
    pub fn add_shard_id(&mut self, shard_id: &str) -> bool {
        if self.shard_ids.iter().any(|s| s == shard_id) {
            return false;
        }
        self.shard_ids.push(shard_id.to_string());
        true
    }

    /// Bumps `modified_time` past its current value.
    pub fn touch(&mut self) {
        self.modified_time = Timestamp::next_after(self.modified_time);
    }

    /// Whether this record should replace `other` under last-write-wins.
    #[must_use]
    pub fn supersedes(&self, other: &DatasetMetadata) -> bool {
        self.modified_time > other.modified_time
    }
}

/// Metadata describing a single shard and the nodes believed to hold it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    /// Derived from `dataset_id` and `shard_index` via [`shard_id_for`].
    pub shard_id: String,
    pub dataset_id: String,
    pub shard_index: u32,
    pub total_shards_at_creation: u32,
    pub record_count: u64,
    /// Reference produced by the content store for the shard payload.
    pub content_id: String,
    /// Holders. Grows only; advisory, never proof of possession.
    #[serde(default)]
    pub node_ids: BTreeSet<NodeId>,
    /// Sync version.
    pub modified_time: Timestamp,
}

impl ShardMetadata {
    /// Creates shard metadata held by a single node.
    #[must_use]
    pub fn new(
        dataset_id: &str,
        shard_index: u32,
        total_shards_at_creation: u32,
        record_count: u64,
        content_id: impl Into<String>,
        holder: NodeId,
    ) -> Self {
        Self {
            shard_id: shard_id_for(dataset_id, shard_index),
            dataset_id: dataset_id.to_string(),
            shard_index,
            total_shards_at_creation,
            record_count,
            content_id: content_id.into(),
            node_ids: BTreeSet::from([holder]),
            modified_time: Timestamp::now(),
        }
    }

    /// Adds a holder. Returns `true` if the set changed.
    pub fn add_holder(&mut self, node: NodeId) -> bool {
        self.node_ids.insert(node)
    }

    /// Unions `holders` into this shard's holder set. Returns `true` if the
    /// set changed.
    pub fn merge_holders<'a>(&mut self, holders: impl IntoIterator<Item = &'a NodeId>) -> bool {
        let before = self.node_ids.len();
        self.node_ids.extend(holders.into_iter().cloned());
        self.node_ids.len() != before
    }

    /// Bumps `modified_time` past its current value.
    pub fn touch(&mut self) {
        self.modified_time = Timestamp::next_after(self.modified_time);
    }

    /// Whether this record should replace `other` under last-write-wins.
    #[must_use]
    pub fn supersedes(&self, other: &ShardMetadata) -> bool {
        self.modified_time > other.modified_time
    }
}
