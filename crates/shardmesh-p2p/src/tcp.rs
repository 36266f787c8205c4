//! TCP transport.
//!
//! One TCP connection per stream. The opener sends a `Hello` frame naming
//! itself and the protocol; every later message is a `Data` frame.

use crate::frame::{Frame, FrameKind};
use crate::router::{InboundStream, ProtocolRouter};
use crate::transport::{PeerStream, PeerTransport};
use crate::{P2pError, ProtocolError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shardmesh_types::{NodeId, PeerInfo};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    from: PeerInfo,
    protocol: String,
}

/// Decodes a hello frame payload.
pub fn decode_hello(payload: &[u8]) -> std::result::Result<(PeerInfo, String), ProtocolError> {
    let hello: Hello = serde_json::from_slice(payload)?;
    Ok((hello.from, hello.protocol))
}

struct TcpPeerStream {
    stream: TcpStream,
}

#[async_trait]
impl PeerStream for TcpPeerStream {
    async fn send(&mut self, data: Bytes) -> Result<()> {
        Frame::data(data).write_to(&mut self.stream).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Bytes> {
        let frame = match Frame::read_from(&mut self.stream).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(P2pError::StreamClosed)
            }
            Err(e) => return Err(e.into()),
        };
        if frame.kind != FrameKind::Data {
            return Err(ProtocolError::Malformed("expected data frame".into()).into());
        }
        Ok(frame.payload)
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Transport over TCP connections.
#[derive(Debug)]
pub struct TcpTransport {
    local: PeerInfo,
    addresses: DashMap<NodeId, String>,
}

impl TcpTransport {
    /// Creates a transport for the local node. `local.address` is announced
    /// to peers so they can dial back.
    #[must_use]
    pub fn new(local: PeerInfo) -> Arc<Self> {
        Arc::new(Self {
            local,
            addresses: DashMap::new(),
        })
    }

    /// Known address of `peer`.
    #[must_use]
    pub fn address_of(&self, peer: &NodeId) -> Option<String> {
        self.addresses.get(peer).map(|a| a.value().clone())
    }

    /// Binds `addr` and serves inbound streams through `router` until the
    /// returned task is aborted.
    pub async fn listen(
        self: &Arc<Self>,
        addr: &str,
        router: Arc<ProtocolRouter>,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, node_id = %self.local.node_id, "peer transport listening");

        let transport = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let transport = Arc::clone(&transport);
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            if let Err(e) = transport.accept(stream, router).await {
                                debug!(remote = %remote, error = %e, "inbound connection rejected");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        Ok((local_addr, handle))
    }

    async fn accept(&self, mut stream: TcpStream, router: Arc<ProtocolRouter>) -> Result<()> {
        let frame = tokio::time::timeout(HELLO_TIMEOUT, Frame::read_from(&mut stream))
            .await
            .map_err(|_| P2pError::Handler("hello timed out".into()))??;
        if frame.kind != FrameKind::Hello {
            return Err(ProtocolError::Malformed("expected hello frame".into()).into());
        }
        let (from, protocol) = decode_hello(&frame.payload)?;
        self.learn_address(&from);

        router
            .dispatch(InboundStream {
                peer: from.node_id,
                protocol,
                stream: Box::new(TcpPeerStream { stream }),
            })
            .await;
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    fn local_id(&self) -> &NodeId {
        &self.local.node_id
    }

    async fn open_stream(&self, peer: &NodeId, protocol: &str) -> Result<Box<dyn PeerStream>> {
        let addr = self
            .address_of(peer)
            .ok_or_else(|| P2pError::PeerNotFound(peer.clone()))?;
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| P2pError::Connection {
                peer: peer.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let hello = Hello {
            from: self.local.clone(),
            protocol: protocol.to_string(),
        };
        let payload = serde_json::to_vec(&hello).map_err(ProtocolError::from)?;
        Frame {
            kind: FrameKind::Hello,
            payload: Bytes::from(payload),
        }
        .write_to(&mut stream)
        .await?;

        Ok(Box::new(TcpPeerStream { stream }))
    }

    fn learn_address(&self, peer: &PeerInfo) {
        if peer.node_id == self.local.node_id {
            return;
        }
        if let Some(addr) = &peer.address {
            self.addresses.insert(peer.node_id.clone(), addr.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DiscoveryRequest, PeersData, Response};
    use crate::router::ProtocolHandler;
    use crate::transport::{read_request, write_response, PeerClient};

    struct Whoami;

    #[async_trait]
    impl ProtocolHandler for Whoami {
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

    #[tokio::test]
    async fn request_over_tcp() {
        let server = TcpTransport::new(PeerInfo::new(id("server")));
        let router = Arc::new(ProtocolRouter::new());
        router.register_handler(crate::protocols::DISCOVERY, Arc::new(Whoami));
        let (addr, handle) = server.listen("127.0.0.1:0", router).await.unwrap();

        let client_transport =
            TcpTransport::new(PeerInfo::new(id("client")).with_address("127.0.0.1:1"));
        client_transport.learn_address(&PeerInfo::new(id("server")).with_address(addr.to_string()));
        let client = PeerClient::new(client_transport, Duration::from_secs(5));

        let data: PeersData = client
            .call(&id("server"), &DiscoveryRequest::GetPeers {})
            .await
            .unwrap();
        assert_eq!(data.peers, vec![id("client")]);

        // The server learned the client's announced address from the hello.
        assert_eq!(server.address_of(&id("client")).as_deref(), Some("127.0.0.1:1"));
        handle.abort();
    }

    #[tokio::test]
    async fn unknown_address_is_peer_not_found() {
        let transport = TcpTransport::new(PeerInfo::new(id("a")));
        let err = transport.open_stream(&id("b"), "discovery").await.err().unwrap();
        assert!(matches!(err, P2pError::PeerNotFound(_)));
    }

    #[test]
    fn hello_decoding_rejects_garbage() {
        assert!(decode_hello(b"\x00\x01").is_err());
        let (from, protocol) =
            decode_hello(br#"{"from":{"node_id":"n1"},"protocol":"discovery"}"#).unwrap();
        assert_eq!(from.node_id, id("n1"));
        assert_eq!(protocol, "discovery");
    }
}
