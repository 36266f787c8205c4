//! Peer membership and gossip discovery.

use crate::message::{DiscoveryRequest, PeersData, Response};
use crate::router::ProtocolHandler;
use crate::transport::{read_request, write_response, PeerClient, PeerStream};
use crate::{NodeIdentity, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use shardmesh_types::{NodeId, NodeRole, PeerInfo};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// This node's identity and its best-effort view of the cluster.
pub struct Membership {
    identity: NodeIdentity,
    local_address: Option<String>,
    peers: DashMap<NodeId, PeerInfo>,
    client: PeerClient,
}

impl Membership {
    /// Creates a membership view with no known peers.
    pub fn new(identity: NodeIdentity, client: PeerClient) -> Self {
        Self {
            identity,
            local_address: None,
            peers: DashMap::new(),
            client,
        }
    }

    /// Sets the address announced to peers.
    #[must_use]
    pub fn with_local_address(mut self, address: impl Into<String>) -> Self {
        self.local_address = Some(address.into());
        self
    }

    /// Id of this node.
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        &self.identity.node_id
    }

    /// Role of this node.
    #[must_use]
    pub fn role(&self) -> NodeRole {
        self.identity.role
    }

    /// The client used for outbound requests.
    #[must_use]
    pub fn client(&self) -> &PeerClient {
        &self.client
    }

    /// This node as peers see it.
    #[must_use]
    pub fn local_info(&self) -> PeerInfo {
        let info = PeerInfo::new(self.identity.node_id.clone()).with_role(self.identity.role);
        match &self.local_address {
            Some(addr) => info.with_address(addr.clone()),
            None => info,
        }
    }

    /// Adds or refreshes a peer. Known fields are kept when `info` lacks
    /// them. Returns `true` if the peer was new.
    pub fn add_peer(&self, info: PeerInfo) -> bool {
        if info.node_id == self.identity.node_id {
            return false;
        }
        self.client.transport().learn_address(&info);

        let mut is_new = false;
        self.peers
            .entry(info.node_id.clone())
            .and_modify(|known| {
                if info.address.is_some() {
                    known.address = info.address.clone();
                }
                if info.role.is_some() {
                    known.role = info.role;
                }
            })
            .or_insert_with(|| {
                is_new = true;
                info.clone()
            });
        if is_new {
            debug!(peer = %info.node_id, "learned new peer");
        }
        is_new
    }

    /// Records that `node_id` exists, without address or role.
    pub fn observe(&self, node_id: &NodeId) {
        if !self.peers.contains_key(node_id) {
            self.add_peer(PeerInfo::new(node_id.clone()));
        }
    }

    /// Every known peer, sorted by id.
    #[must_use]
    pub fn known_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self.peers.iter().map(|p| p.value().clone()).collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    /// Ids of every known peer.
    #[must_use]
    pub fn known_peer_ids(&self) -> BTreeSet<NodeId> {
        self.peers.iter().map(|p| p.key().clone()).collect()
    }

    /// The peers in `candidates` that may be sent shards. Peers whose role
    /// is known and does not store shards are left out; peers with an
    /// unknown role are kept.
    #[must_use]
    pub fn shard_capable(&self, candidates: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        candidates
            .iter()
            .filter(|id| {
                self.peers
                    .get(*id)
                    .and_then(|p| p.role)
                    .map_or(true, |role| role.stores_shards())
            })
            .cloned()
            .collect()
    }

    /// Number of known peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Asks every known peer for its peers and returns the union, one hop
    /// deep.
    ///
    /// Peers that fail to answer in time are left out of the result but stay
    /// known. Newly learned peers are remembered. The result is a snapshot,
    /// not a promise that any peer is reachable.
    pub async fn discover_peers(&self) -> BTreeSet<NodeId> {
        let known = self.known_peer_ids();
        let mut tasks = JoinSet::new();
        for peer in known.iter().cloned() {
            let client = self.client.clone();
            tasks.spawn(async move {
                let result: Result<PeersData> =
                    client.call(&peer, &DiscoveryRequest::GetPeers {}).await;
                (peer, result)
            });
        }

        let mut failed = BTreeSet::new();
        let mut result = known;
        while let Some(joined) = tasks.join_next().await {
            let (peer, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "discovery task panicked");
                    continue;
                }
            };
            match outcome {
                Ok(data) => {
                    for info in data.peer_info {
                        self.add_peer(info);
                    }
                    for id in data.peers {
                        self.observe(&id);
                        result.insert(id);
                    }
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "peer did not answer discovery");
                    failed.insert(peer);
                }
            }
        }

        result.remove(self.local_id());
        result.retain(|id| !failed.contains(id));
        debug!(
            discovered = result.len(),
            failed = failed.len(),
            "discovery round finished"
        );
        result
    }
}

impl std::fmt::Debug for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membership")
            .field("node_id", &self.identity.node_id)
            .field("role", &self.identity.role)
            .field("peers", &self.peers.len())
            .finish()
    }
}

/// Serves `get_peers` on the discovery protocol.
#[derive(Debug)]
pub struct DiscoveryHandler {
    membership: Arc<Membership>,
}

impl DiscoveryHandler {
    #[must_use]
    pub fn new(membership: Arc<Membership>) -> Self {
        Self { membership }
    }
}

#[async_trait]
impl ProtocolHandler for DiscoveryHandler {
    async fn handle(&self, peer: &NodeId, stream: &mut dyn PeerStream) -> Result<()> {
        let DiscoveryRequest::GetPeers {} = read_request(stream).await?;
        self.membership.observe(peer);

        let mut peer_info: Vec<PeerInfo> = self
            .membership
            .known_peers()
            .into_iter()
            .filter(|p| &p.node_id != peer)
            .collect();
        peer_info.push(self.membership.local_info());
        let data = PeersData {
            peers: peer_info.iter().map(|p| p.node_id.clone()).collect(),
            peer_info,
        };
        write_response(stream, &Response::success(data)?).await
    }
}
