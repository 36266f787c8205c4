//! Node identity and role types.

use crate::{Result, TypesError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a node in the cluster.
///
/// Freshly generated ids are UUID v4 strings; any non-empty string without
/// whitespace or `@` is accepted so tests can use readable names.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id, validating its shape.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.contains('@') || id.chars().any(char::is_whitespace) {
            return Err(TypesError::InvalidNodeId(id));
        }
        Ok(Self(id))
    }

    /// Generates a fresh random node id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short prefix for log output.
    #[must_use]
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// The role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Creates datasets and drives distribution.
    Coordinator,
    /// Stores and serves shards.
    Worker,
    /// Both coordinator and worker.
    #[default]
    Hybrid,
    /// Read-only participant.
    Client,
}

impl NodeRole {
    /// Whether this role may create datasets and drive distribution.
    #[must_use]
    pub const fn can_coordinate(&self) -> bool {
        matches!(self, Self::Coordinator | Self::Hybrid)
    }

    /// Whether this role stores and serves shards.
    #[must_use]
    pub const fn stores_shards(&self) -> bool {
        matches!(self, Self::Worker | Self::Hybrid)
    }

    /// Returns the lowercase role name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Worker => "worker",
            Self::Hybrid => "hybrid",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "coordinator" => Ok(Self::Coordinator),
            "worker" => Ok(Self::Worker),
            "hybrid" => Ok(Self::Hybrid),
            "client" => Ok(Self::Client),
            _ => Err(TypesError::UnknownRole(s.to_string())),
        }
    }
}

/// What a node knows about one of its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's node id.
    pub node_id: NodeId,
    /// Dialable address, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Declared role, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<NodeRole>,
}

impl PeerInfo {
    /// Creates a peer entry with only an id.
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            address: None,
            role: None,
        }
    }

    /// Sets the dialable address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Sets the declared role.
    #[must_use]
    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = Some(role);
        self
    }
}

impl FromStr for PeerInfo {
    type Err = TypesError;

    /// Parses `node_id@host:port` or a bare `node_id`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once('@') {
            Some((id, addr)) => {
                if addr.is_empty() {
                    return Err(TypesError::InvalidPeer {
                        input: s.to_string(),
                        reason: "empty address",
                    });
                }
                Ok(Self::new(NodeId::new(id)?).with_address(addr))
            }
            None => Ok(Self::new(NodeId::new(s)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn role_capabilities() {
        assert!(NodeRole::Coordinator.can_coordinate());
        assert!(!NodeRole::Coordinator.stores_shards());
        assert!(NodeRole::Hybrid.can_coordinate());
        assert!(NodeRole::Hybrid.stores_shards());
        assert!(NodeRole::Worker.stores_shards());
        assert!(!NodeRole::Client.can_coordinate());
        assert!(!NodeRole::Client.stores_shards());
    }

    #[test]
    fn role_parsing() {
        assert_eq!("Worker".parse::<NodeRole>().unwrap(), NodeRole::Worker);
        assert_eq!(
            "leader".parse::<NodeRole>(),
            Err(TypesError::UnknownRole("leader".into()))
        );
        assert_eq!(serde_json::to_string(&NodeRole::Client).unwrap(), "\"client\"");
    }

    #[test]
    fn node_id_validation() {
        assert!(NodeId::new("").is_err());
        assert!(NodeId::new("a b").is_err());
        assert!(NodeId::new("a@b").is_err());
        assert_eq!(NodeId::new("node-a").unwrap().as_str(), "node-a");
        assert_ne!(NodeId::generate(), NodeId::generate());
    }

    #[test]
    fn short_id_truncates() {
        let id = NodeId::new("0123456789abcdef").unwrap();
        assert_eq!(id.short(), "01234567");
        assert_eq!(NodeId::new("abc").unwrap().short(), "abc");
    }

    #[test]
    fn peer_descriptor_parsing() {
        let peer: PeerInfo = "node-b@127.0.0.1:7400".parse().unwrap();
        assert_eq!(peer.node_id.as_str(), "node-b");
        assert_eq!(peer.address.as_deref(), Some("127.0.0.1:7400"));

        let bare: PeerInfo = "node-c".parse().unwrap();
        assert_eq!(bare.address, None);

        assert!("node-d@".parse::<PeerInfo>().is_err());
    }
}
