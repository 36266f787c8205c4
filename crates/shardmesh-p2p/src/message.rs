//! Wire messages.
//!
//! Every request is a JSON object `{"action": ..., "arguments": {...}}` and
//! every response is `{"status": ..., "message": ..., "data": {...}}`. Each
//! protocol defines its requests as one tagged enum; decoding checks the
//! action against the protocol's action list first so unknown actions are
//! reported as [`ProtocolError::UnknownAction`] rather than a generic parse
//! error.

use crate::protocols;
use crate::{P2pError, ProtocolError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shardmesh_types::{
    DatasetMetadata, NodeId, PeerInfo, SearchHit, SearchRequest, ShardMetadata, Timestamp,
};
use std::collections::BTreeMap;
use std::fmt;

/// A request enum bound to one protocol.
pub trait WireRequest: Serialize + DeserializeOwned + Send + Sync {
    /// Protocol name the request is sent on.
    const PROTOCOL: &'static str;

    /// Every action the protocol understands.
    const ACTIONS: &'static [&'static str];

    /// Action name of this request.
    fn action(&self) -> &'static str;

    /// Encodes the request.
    fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a request, rejecting unknown actions with a typed error.
    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawRequest = serde_json::from_slice(data)?;
        if !Self::ACTIONS.contains(&raw.action.as_str()) {
            return Err(ProtocolError::UnknownAction {
                protocol: Self::PROTOCOL,
                action: raw.action,
            });
        }
        let arguments = match raw.arguments {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };
        let tagged = serde_json::json!({ "action": raw.action, "arguments": arguments });
        Ok(serde_json::from_value(tagged)?)
    }
}

#[derive(Deserialize)]
struct RawRequest {
    action: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

macro_rules! wire_request {
    ($ty:ty, $protocol:expr, { $($variant:ident => $action:literal),+ $(,)? }) => {
        impl WireRequest for $ty {
            const PROTOCOL: &'static str = $protocol;
            const ACTIONS: &'static [&'static str] = &[$($action),+];

            fn action(&self) -> &'static str {
                match self {
                    $(Self::$variant { .. } => $action),+
                }
            }
        }
    };
}

/// Requests on the `discovery` protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "arguments", rename_all = "snake_case")]
pub enum DiscoveryRequest {
    GetPeers {},
}

wire_request!(DiscoveryRequest, protocols::DISCOVERY, { GetPeers => "get_peers" });

/// Requests on the `shard-discovery` protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "arguments", rename_all = "snake_case")]
pub enum ShardDiscoveryRequest {
    ListShards {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dataset_id: Option<String>,
    },
    GetShardInfo { shard_id: String },
}

wire_request!(ShardDiscoveryRequest, protocols::SHARD_DISCOVERY, {
    ListShards => "list_shards",
    GetShardInfo => "get_shard_info",
});

/// Requests on the `shard-transfer` protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "arguments", rename_all = "snake_case")]
pub enum ShardTransferRequest {
    /// Offer a shard. On acceptance the sender pushes a [`ShardPush`] frame
    /// followed by one raw payload frame.
    AcceptShard {
        shard_id: String,
        dataset_id: String,
        content_id: String,
    },
    /// Pull a shard. The response is followed by one raw payload frame.
    TransferShard { shard_id: String },
}

wire_request!(ShardTransferRequest, protocols::SHARD_TRANSFER, {
    AcceptShard => "accept_shard",
    TransferShard => "transfer_shard",
});

/// Requests on the `shard-sync` protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "arguments", rename_all = "snake_case")]
pub enum ShardSyncRequest {
    SyncShard {
        shard_id: String,
        metadata: ShardMetadata,
    },
    GetShardTimestamp { shard_id: String },
    ListShardsWithTimestamps {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dataset_id: Option<String>,
    },
}

wire_request!(ShardSyncRequest, protocols::SHARD_SYNC, {
    SyncShard => "sync_shard",
    GetShardTimestamp => "get_shard_timestamp",
    ListShardsWithTimestamps => "list_shards_with_timestamps",
});

/// Requests on the `metadata-sync` protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "arguments", rename_all = "snake_case")]
pub enum MetadataSyncRequest {
    SyncDataset {
        dataset_id: String,
        metadata: DatasetMetadata,
    },
    GetDatasetTimestamp { dataset_id: String },
    ListDatasetsWithTimestamps {},
    /// Fetch the full dataset record and its shard versions.
    GetDataset { dataset_id: String },
}

wire_request!(MetadataSyncRequest, protocols::METADATA_SYNC, {
    SyncDataset => "sync_dataset",
    GetDatasetTimestamp => "get_dataset_timestamp",
    ListDatasetsWithTimestamps => "list_datasets_with_timestamps",
    GetDataset => "get_dataset",
});

/// Requests on the `federated-search` protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "arguments", rename_all = "snake_case")]
pub enum FederatedSearchRequest {
    Search(SearchRequest),
}

wire_request!(FederatedSearchRequest, protocols::FEDERATED_SEARCH, { Search => "search" });

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
    NotFound,
    Unchanged,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::NotFound => "not_found",
            Self::Unchanged => "unchanged",
        })
    }
}

/// Response envelope shared by every protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Response {
    /// A success response carrying `data`.
    pub fn success(data: impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self {
            status: Status::Success,
            message: None,
            data: serde_json::to_value(data)?,
        })
    }

    /// A success response without data.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: Status::Success,
            message: None,
            data: serde_json::Value::Null,
        }
    }

    /// An `unchanged` response: the request was valid but changed nothing.
    #[must_use]
    pub fn unchanged() -> Self {
        Self {
            status: Status::Unchanged,
            message: None,
            data: serde_json::Value::Null,
        }
    }

    /// An `unchanged` response carrying `data`.
    pub fn unchanged_with(data: impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self {
            status: Status::Unchanged,
            message: None,
            data: serde_json::to_value(data)?,
        })
    }

    /// An error response.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            data: serde_json::Value::Null,
        }
    }

    /// A `not_found` response.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: Status::NotFound,
            message: Some(message.into()),
            data: serde_json::Value::Null,
        }
    }

    /// Encodes the response.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a response.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Whether the status is `success` or `unchanged`.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self.status, Status::Success | Status::Unchanged)
    }

    /// Deserializes `data`, failing with [`P2pError::Remote`] unless the
    /// status is `success` or `unchanged`.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, P2pError> {
        if !self.is_ok() {
            return Err(self.into_remote_error());
        }
        Ok(serde_json::from_value(self.data).map_err(ProtocolError::from)?)
    }

    /// Converts a non-success response into an error.
    #[must_use]
    pub fn into_remote_error(self) -> P2pError {
        P2pError::Remote {
            status: self.status,
            message: self.message.unwrap_or_default(),
        }
    }
}

/// `get_peers` response data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeersData {
    pub peers: Vec<NodeId>,
    /// Addresses and roles for the ids in `peers`, when known.
    #[serde(default)]
    pub peer_info: Vec<PeerInfo>,
}

/// `list_shards` response data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardsData {
    pub shards: Vec<ShardMetadata>,
}

/// `get_shard_info` response data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInfoData {
    pub shard: ShardMetadata,
}

/// `accept_shard` handshake answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptShardData {
    /// The receiver wants the payload.
    pub accepted: bool,
    /// The receiver has no record of the dataset and wants it in the push.
    pub need_dataset: bool,
}

/// Metadata frame sent after an accepted offer, before the payload frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardPush {
    pub shard: ShardMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetMetadata>,
}

/// Final answer of a completed push, and the response to `transfer_shard`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferData {
    pub shard: ShardMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetMetadata>,
}

/// Timestamp lookup response data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampData {
    pub modified_time: Timestamp,
}

/// `list_shards_with_timestamps` response data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardTimestampsData {
    pub shards: BTreeMap<String, Timestamp>,
}

/// `list_datasets_with_timestamps` response data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetTimestampsData {
    pub datasets: BTreeMap<String, Timestamp>,
}

/// `sync_dataset` response data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncDatasetData {
    /// Shards of the dataset the receiver does not hold yet.
    pub new_shard_ids: Vec<String>,
}

/// `sync_shard` response data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncShardData {
    /// The receiver's record after applying the update.
    pub shard: ShardMetadata,
}

/// `get_dataset` response data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetData {
    pub metadata: DatasetMetadata,
    /// Versions of the dataset's shards the responder knows.
    pub shards: BTreeMap<String, Timestamp>,
}

/// `search` response data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResultsData {
    pub results: Vec<SearchHit>,
}
