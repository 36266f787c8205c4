//! Persistent node identity.

use crate::Result;
use shardmesh_types::{NodeId, NodeRole};
use std::path::Path;

const NODE_ID_FILE: &str = "node_id";

/// Who this node is: a stable id and its declared role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub role: NodeRole,
}

impl NodeIdentity {
    /// Creates an identity from parts.
    #[must_use]
    pub fn new(node_id: NodeId, role: NodeRole) -> Self {
        Self { node_id, role }
    }

    /// Loads the node id stored in `data_dir`, generating and storing a fresh
    /// one on first start.
    pub fn load_or_create(data_dir: &Path, role: NodeRole) -> Result<Self> {
        let path = data_dir.join(NODE_ID_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let node_id = NodeId::new(contents.trim()).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                })?;
                tracing::debug!(node_id = %node_id, "loaded node identity");
                Ok(Self::new(node_id, role))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(data_dir)?;
                let node_id = NodeId::generate();
                std::fs::write(&path, format!("{node_id}\n"))?;
                tracing::info!(node_id = %node_id, path = %path.display(), "generated node identity");
                Ok(Self::new(node_id, role))
            }
            Err(e) => Err(e.into()),
        }
    }
}
