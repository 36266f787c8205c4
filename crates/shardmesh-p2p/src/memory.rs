//! In-process transport.
//!
//! Several nodes can share one [`MemoryNetwork`] inside a single process.
//! Streams are pairs of bounded channels. Nodes can be made unreachable or
//! unresponsive to exercise failure handling.

use crate::router::{InboundStream, ProtocolRouter};
use crate::transport::{PeerStream, PeerTransport};
use crate::{P2pError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use shardmesh_types::NodeId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const STREAM_BUFFER: usize = 16;

/// One end of an in-process stream.
#[derive(Debug)]
pub struct MemoryStream {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
}

/// Creates a connected pair of streams.
pub(crate) fn stream_pair() -> (MemoryStream, MemoryStream) {
    let (a_tx, b_rx) = mpsc::channel(STREAM_BUFFER);
    let (b_tx, a_rx) = mpsc::channel(STREAM_BUFFER);
    (
        MemoryStream {
            tx: Some(a_tx),
            rx: a_rx,
        },
        MemoryStream {
            tx: Some(b_tx),
            rx: b_rx,
        },
    )
}

#[async_trait]
impl PeerStream for MemoryStream {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(P2pError::StreamClosed)?;
        tx.send(data).await.map_err(|_| P2pError::StreamClosed)
    }

    async fn receive(&mut self) -> Result<Bytes> {
        self.rx.recv().await.ok_or(P2pError::StreamClosed)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

#[derive(Default)]
struct NetworkState {
    routers: DashMap<NodeId, Arc<ProtocolRouter>>,
    unreachable: DashSet<NodeId>,
    hanging: DashSet<NodeId>,
}

/// A simulated network shared by in-process nodes.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a node whose inbound streams go to `router`.
    pub fn join(&self, node_id: NodeId, router: Arc<ProtocolRouter>) -> Arc<MemoryTransport> {
        self.state.routers.insert(node_id.clone(), router);
        Arc::new(MemoryTransport {
            local: node_id,
            network: self.clone(),
        })
    }

    /// Detaches a node. Streams to it fail as if it never existed.
    pub fn leave(&self, node_id: &NodeId) {
        self.state.routers.remove(node_id);
    }

    /// Cuts a node off (or reconnects it). An unreachable node can neither
    /// open nor accept streams.
    pub fn set_reachable(&self, node_id: &NodeId, reachable: bool) {
        if reachable {
            self.state.unreachable.remove(node_id);
        } else {
            self.state.unreachable.insert(node_id.clone());
        }
    }

    /// Makes a node accept streams but never answer them.
    pub fn set_hanging(&self, node_id: &NodeId, hanging: bool) {
        if hanging {
            self.state.hanging.insert(node_id.clone());
        } else {
            self.state.hanging.remove(node_id);
        }
    }

    /// Whether `node_id` is attached and reachable.
    #[must_use]
    pub fn is_reachable(&self, node_id: &NodeId) -> bool {
        self.state.routers.contains_key(node_id) && !self.state.unreachable.contains(node_id)
    }

    /// Number of attached nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.routers.len()
    }

    /// Whether no node is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.routers.is_empty()
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.state.routers.len())
            .field("unreachable", &self.state.unreachable.len())
            .finish()
    }
}

/// A node's handle on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    local: NodeId,
    network: MemoryNetwork,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_id(&self) -> &NodeId {
        &self.local
    }

    async fn open_stream(&self, peer: &NodeId, protocol: &str) -> Result<Box<dyn PeerStream>> {
        let state = &self.network.state;
        if state.unreachable.contains(&self.local) || state.unreachable.contains(peer) {
            return Err(P2pError::Connection {
                peer: peer.clone(),
                reason: "unreachable".into(),
            });
        }
        let router = state
            .routers
            .get(peer)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| P2pError::PeerNotFound(peer.clone()))?;

        let (client, server) = stream_pair();
        if state.hanging.contains(peer) {
            debug!(peer = %peer, protocol, "peer is hanging, holding stream open");
            tokio::spawn(async move {
                let _held = server;
                std::future::pending::<()>().await;
            });
        } else {
            router.spawn_dispatch(InboundStream {
                peer: self.local.clone(),
                protocol: protocol.to_string(),
                stream: Box::new(server),
            });
        }
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DiscoveryRequest, PeersData, Response};
    use crate::router::ProtocolHandler;
    use crate::transport::{read_request, write_response, PeerClient};
    use std::time::Duration;

    struct EchoPeers;

    #[async_trait]
    impl ProtocolHandler for EchoPeers {
        async fn handle(&self, peer: &NodeId, stream: &mut dyn PeerStream) -> Result<()> {
            let _: DiscoveryRequest = read_request(stream).await?;
            let data = PeersData {
                peers: vec![peer.clone()],
                peer_info: vec![],
            };
            write_response(stream, &Response::success(data)?).await
        }
    }

    fn id(name: &str) -> NodeId {
        NodeId::new(name).unwrap()
    }

    fn setup() -> (MemoryNetwork, PeerClient) {
        let network = MemoryNetwork::new();
        let router = Arc::new(ProtocolRouter::new());
        router.register_handler(crate::protocols::DISCOVERY, Arc::new(EchoPeers));
        network.join(id("b"), router);
        let a = network.join(id("a"), Arc::new(ProtocolRouter::new()));
        (network, PeerClient::new(a, Duration::from_millis(200)))
    }

    #[tokio::test]
    async fn request_reaches_peer_with_caller_identity() {
        let (_network, client) = setup();
        let data: PeersData = client
            .call(&id("b"), &DiscoveryRequest::GetPeers {})
            .await
            .unwrap();
        assert_eq!(data.peers, vec![id("a")]);
    }

    #[tokio::test]
    async fn unreachable_and_unknown_peers_fail() {
        let (network, client) = setup();

        network.set_reachable(&id("b"), false);
        let err = client
            .request(&id("b"), &DiscoveryRequest::GetPeers {})
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::Connection { .. }));
        assert!(err.is_peer_failure());

        network.set_reachable(&id("b"), true);
        assert!(client
            .request(&id("b"), &DiscoveryRequest::GetPeers {})
            .await
            .is_ok());

        let err = client
            .request(&id("zzz"), &DiscoveryRequest::GetPeers {})
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::PeerNotFound(_)));
    }

    #[tokio::test]
    async fn hanging_peer_times_out() {
        let (network, client) = setup();
        network.set_hanging(&id("b"), true);
        let err = client
            .request(&id("b"), &DiscoveryRequest::GetPeers {})
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::Timeout { .. }));
    }

    #[tokio::test]
    async fn closed_stream_reports_closed() {
        let (mut a, mut b) = stream_pair();
        a.close().await.unwrap();
        assert!(matches!(b.receive().await, Err(P2pError::StreamClosed)));
        assert!(matches!(a.send(Bytes::new()).await, Err(P2pError::StreamClosed)));
    }
}
