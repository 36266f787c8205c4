//! Peer transport abstraction.
//!
//! A transport opens bidirectional message streams to peers by node id. Each
//! stream carries discrete messages; framing is the transport's business.

use crate::message::{Response, WireRequest};
use crate::{P2pError, ProtocolError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardmesh_types::{NodeId, PeerInfo};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One open stream to a peer.
#[async_trait]
pub trait PeerStream: Send {
    /// Sends one message.
    async fn send(&mut self, data: Bytes) -> Result<()>;

    /// Receives the next message. Fails with [`P2pError::StreamClosed`] when
    /// the other side is gone.
    async fn receive(&mut self) -> Result<Bytes>;

    /// Closes the stream.
    async fn close(&mut self) -> Result<()>;
}

/// Opens streams to peers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Id of the local node.
    fn local_id(&self) -> &NodeId;

    /// Opens a stream to `peer` for `protocol`.
    async fn open_stream(&self, peer: &NodeId, protocol: &str) -> Result<Box<dyn PeerStream>>;

    /// Records a peer's address. Transports that route by id ignore it.
    fn learn_address(&self, _peer: &PeerInfo) {}
}

/// Sends a JSON message.
pub async fn write_json<T: Serialize + Sync>(stream: &mut dyn PeerStream, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value).map_err(ProtocolError::from)?;
    stream.send(Bytes::from(data)).await
}

/// Receives a JSON message.
pub async fn read_json<T: DeserializeOwned>(stream: &mut dyn PeerStream) -> Result<T> {
    let data = stream.receive().await?;
    Ok(serde_json::from_slice(&data).map_err(ProtocolError::from)?)
}

/// Receives and decodes a request for protocol `R`.
pub async fn read_request<R: WireRequest>(stream: &mut dyn PeerStream) -> Result<R> {
    let data = stream.receive().await?;
    Ok(R::decode(&data)?)
}

/// Sends a response.
pub async fn write_response(stream: &mut dyn PeerStream, response: &Response) -> Result<()> {
    stream.send(response.encode()?).await
}

/// Receives a response.
pub async fn read_response(stream: &mut dyn PeerStream) -> Result<Response> {
    let data = stream.receive().await?;
    Ok(Response::decode(&data)?)
}

/// Issues requests to peers with a mandatory timeout.
#[derive(Clone)]
pub struct PeerClient {
    transport: Arc<dyn PeerTransport>,
    timeout: Duration,
}

impl PeerClient {
    /// Creates a client over `transport` with a per-request `timeout`.
    pub fn new(transport: Arc<dyn PeerTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Id of the local node.
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        self.transport.local_id()
    }

    /// The per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    /// Runs `fut` under the request timeout, mapping expiry to
    /// [`P2pError::Timeout`].
    pub async fn bounded<T, F>(&self, peer: &NodeId, protocol: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(P2pError::Timeout {
                peer: peer.clone(),
                protocol: protocol.to_string(),
            }),
        }
    }

    /// Opens a stream for a multi-message exchange. Callers bound the
    /// exchange itself with [`bounded`](Self::bounded).
    pub async fn open(&self, peer: &NodeId, protocol: &str) -> Result<Box<dyn PeerStream>> {
        self.transport.open_stream(peer, protocol).await
    }

    /// Sends one request and waits for its response.
    pub async fn request<R: WireRequest>(&self, peer: &NodeId, request: &R) -> Result<Response> {
        self.bounded(peer, R::PROTOCOL, async {
            let mut stream = self.transport.open_stream(peer, R::PROTOCOL).await?;
            stream.send(request.encode()?).await?;
            let response = read_response(stream.as_mut()).await?;
            let _ = stream.close().await;
            Ok(response)
        })
        .await
    }

    /// Sends one request and decodes the `data` of a success response.
    pub async fn call<R: WireRequest, T: DeserializeOwned>(
        &self,
        peer: &NodeId,
        request: &R,
    ) -> Result<T> {
        self.request(peer, request).await?.into_data()
    }
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("local_id", self.local_id())
            .field("timeout", &self.timeout)
            .finish()
    }
}
