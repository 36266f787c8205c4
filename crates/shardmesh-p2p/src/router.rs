//! Protocol router.
//!
//! Maps protocol names to handlers and runs each inbound stream through the
//! handler registered for it. A failing handler never takes the node down:
//! its error is logged and sent back to the peer as an `error` response when
//! the stream still allows it.

use crate::message::Response;
use crate::transport::{write_response, PeerStream};
use crate::{P2pError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use shardmesh_types::NodeId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handles every stream opened on one protocol.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Serves one stream opened by `peer`.
    async fn handle(&self, peer: &NodeId, stream: &mut dyn PeerStream) -> Result<()>;
}

/// A stream opened by a remote peer.
pub struct InboundStream {
    pub peer: NodeId,
    pub protocol: String,
    pub stream: Box<dyn PeerStream>,
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Dispatches inbound streams by protocol name.
#[derive(Default)]
pub struct ProtocolRouter {
    handlers: RwLock<HashMap<String, Arc<dyn ProtocolHandler>>>,
}

impl ProtocolRouter {
    /// Creates a router with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `protocol`. A later registration for the same
    /// protocol replaces the earlier one, which is returned.
    pub fn register_handler(
        &self,
        protocol: impl Into<String>,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Option<Arc<dyn ProtocolHandler>> {
        let protocol = protocol.into();
        let previous = self.handlers.write().insert(protocol.clone(), handler);
        if previous.is_some() {
            debug!(protocol = %protocol, "replaced protocol handler");
        }
        previous
    }

    /// Names of all registered protocols, sorted.
    #[must_use]
    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Runs one inbound stream to completion.
    pub async fn dispatch(&self, inbound: InboundStream) {
        let InboundStream {
            peer,
            protocol,
            mut stream,
        } = inbound;

        let handler = self.handlers.read().get(&protocol).cloned();
        let result = match handler {
            Some(handler) => handler.handle(&peer, stream.as_mut()).await,
            None => Err(P2pError::UnknownProtocol(protocol.clone())),
        };

        if let Err(e) = result {
            warn!(peer = %peer, protocol = %protocol, error = %e, "protocol handler failed");
            if !matches!(e, P2pError::StreamClosed) {
                let _ = write_response(stream.as_mut(), &Response::error(e.to_string())).await;
            }
        }
        let _ = stream.close().await;
    }

    /// Spawns [`dispatch`](Self::dispatch) on its own task.
    pub fn spawn_dispatch(self: &Arc<Self>, inbound: InboundStream) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move { router.dispatch(inbound).await })
    }
}

impl std::fmt::Debug for ProtocolRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRouter")
            .field("protocols", &self.protocols())
            .finish()
    }
}
