//! Node assembly: storage, peer transport, protocol handlers and the
//! background sync and rebalance loops.

use crate::config::{ConfigError, NodeConfig, StorageBackend};
use crate::observability::MetricsState;
use parking_lot::Mutex;
use shardmesh_p2p::{
    protocols, Membership, NodeIdentity, P2pError, PeerClient, PeerTransport, ProtocolRouter,
    TcpTransport,
};
use shardmesh_replication::{
    register_handlers, DistributionEngine, RebalanceCounts, Rebalancer, ReplicationError,
    ShardingContext, ShardingReport, SyncProtocol, SyncReport,
};
use shardmesh_search::{
    BruteForceSearcher, FederatedSearchHandler, LocalSearch, SearchCoordinator, SearchError,
    SearchOutcome,
};
use shardmesh_storage::{
    ContentStore, FileContentStore, FileMetadataStore, MemoryContentStore, MemoryMetadataStore,
    MetadataStore, StorageError,
};
use shardmesh_types::{DatasetMetadata, NewDataset, NodeId, PeerInfo, Record, SearchRequest};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Errors raised while assembling or running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("p2p error: {0}")]
    P2p(#[from] P2pError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Search(#[from] SearchError),
}

/// A specialized Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

/// A running shardmesh node.
pub struct ShardNode {
    config: NodeConfig,
    ctx: Arc<ShardingContext>,
    engine: DistributionEngine,
    sync: SyncProtocol,
    rebalancer: Rebalancer,
    search: SearchCoordinator,
    router: Arc<ProtocolRouter>,
    metrics: MetricsState,
    peer_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

fn open_stores(
    config: &NodeConfig,
) -> Result<(Arc<dyn MetadataStore>, Arc<dyn ContentStore>)> {
    let (metadata, content): (Arc<dyn MetadataStore>, Arc<dyn ContentStore>) =
        match config.storage_backend {
            StorageBackend::Memory => (
                Arc::new(MemoryMetadataStore::new()),
                Arc::new(MemoryContentStore::new()),
            ),
            StorageBackend::File => (
                Arc::new(FileMetadataStore::new(config.data_dir.join("metadata"))),
                Arc::new(FileContentStore::new(config.data_dir.join("shards"))?),
            ),
            #[cfg(feature = "rocksdb")]
            StorageBackend::RocksDb => {
                let store = shardmesh_storage::RocksDbMetadataStore::new(
                    shardmesh_storage::RocksDbConfig {
                        path: config.data_dir.join("metadata.rocksdb"),
                        ..Default::default()
                    },
                );
                (
                    Arc::new(store),
                    Arc::new(FileContentStore::new(config.data_dir.join("shards"))?),
                )
            }
            #[cfg(not(feature = "rocksdb"))]
            StorageBackend::RocksDb => {
                return Err(ConfigError::Invalid(
                    "storage_backend 'rocksdb' needs the 'rocksdb' feature".into(),
                )
                .into())
            }
        };
    metadata.open()?;
    info!(backend = ?config.storage_backend, data_dir = %config.data_dir.display(), "opened stores");
    Ok((metadata, content))
}

impl ShardNode {
    /// Builds a node on an existing transport. `router` must be the one the
    /// transport dispatches inbound streams to.
    pub fn assemble(
        config: NodeConfig,
        identity: NodeIdentity,
        transport: Arc<dyn PeerTransport>,
        router: Arc<ProtocolRouter>,
    ) -> Result<Self> {
        Self::build(config, identity, transport, router, None)
    }

    fn build(
        config: NodeConfig,
        identity: NodeIdentity,
        transport: Arc<dyn PeerTransport>,
        router: Arc<ProtocolRouter>,
        local_address: Option<String>,
    ) -> Result<Self> {
        config.validate()?;
        let (store, content) = open_stores(&config)?;

        let client = PeerClient::new(transport, config.request_timeout());
        let node_id = identity.node_id.clone();
        let mut membership = Membership::new(identity, client);
        if let Some(address) = local_address {
            membership = membership.with_local_address(address);
        }
        let membership = Arc::new(membership);

        let ctx = Arc::new(ShardingContext::new(membership.clone(), store, content));
        register_handlers(&router, &ctx);

        let local = Arc::new(LocalSearch::new(
            node_id,
            ctx.store().clone(),
            ctx.content().clone(),
            ctx.encoder().clone(),
            Arc::new(BruteForceSearcher::default()),
        ));
        router.register_handler(
            protocols::FEDERATED_SEARCH,
            Arc::new(FederatedSearchHandler::new(local.clone())),
        );

        let engine = DistributionEngine::new(ctx.clone());
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            sync: SyncProtocol::new(ctx.clone()),
            rebalancer: Rebalancer::new(engine.clone(), config.default_replication_factor),
            search: SearchCoordinator::new(membership, local),
            engine,
            ctx,
            router,
            metrics: MetricsState::new(),
            peer_addr: None,
            shutdown,
            loops: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            config,
        })
    }

    /// Builds a node that serves peers over TCP on `listen_addr`, with an
    /// identity persisted in `data_dir`.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let identity = NodeIdentity::load_or_create(&config.data_dir, config.role)?;
        let local = PeerInfo::new(identity.node_id.clone())
            .with_address(config.advertised_addr())
            .with_role(config.role);

        let router = Arc::new(ProtocolRouter::new());
        let transport = TcpTransport::new(local);
        let (peer_addr, listener) = transport.listen(&config.listen_addr, router.clone()).await?;

        let advertised = config.advertised_addr().to_string();
        let mut node = match Self::build(config, identity, transport, router, Some(advertised)) {
            Ok(node) => node,
            Err(e) => {
                listener.abort();
                return Err(e);
            }
        };
        node.peer_addr = Some(peer_addr);
        *node.listener.lock() = Some(listener);
        Ok(node)
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        self.ctx.local_id()
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ShardingContext> {
        &self.ctx
    }

    #[must_use]
    pub fn router(&self) -> &Arc<ProtocolRouter> {
        &self.router
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsState {
        &self.metrics
    }

    /// Bound peer transport address, for TCP nodes.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Dials the bootstrap peers, runs one discovery round and spawns the
    /// background loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let membership = self.ctx.membership();
        for peer in self.config.bootstrap_peer_infos()? {
            membership.add_peer(peer);
        }
        let discovered = membership.discover_peers().await;
        info!(
            node_id = %self.node_id(),
            role = %self.ctx.role(),
            peers = discovered.len(),
            "node started"
        );

        let node = Arc::clone(self);
        self.spawn_loop("sync", self.config.sync_interval(), move || {
            let node = node.clone();
            async move {
                node.sync_now().await;
            }
        });
        let node = Arc::clone(self);
        self.spawn_loop("rebalance", self.config.rebalance_interval(), move || {
            let node = node.clone();
            async move {
                if let Err(e) = node.rebalance(None, None).await {
                    warn!(error = %e, "background rebalance failed");
                }
            }
        });
        Ok(())
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(task = name, "background loop stopped");
        });
        self.loops.lock().push(handle);
    }

    /// Stops the background loops and the peer listener, then closes the
    /// metadata store.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.ctx.store().close()?;
        info!(node_id = %self.node_id(), "node stopped");
        Ok(())
    }

    pub async fn create_dataset(&self, params: NewDataset) -> Result<DatasetMetadata> {
        Ok(self.engine.create_dataset(params).await?)
    }

    /// Shards `records` into the dataset, falling back to the configured
    /// shard size and replication factor.
    pub async fn ingest(
        &self,
        dataset_id: &str,
        records: &[Record],
        shard_size: Option<usize>,
        replication_factor: Option<usize>,
    ) -> Result<ShardingReport> {
        let report = self
            .engine
            .shard_dataset(
                dataset_id,
                records,
                shard_size.unwrap_or(self.config.default_shard_size),
                replication_factor.unwrap_or(self.config.default_replication_factor),
            )
            .await?;
        let delivered = report.distribution.values().map(|peers| peers.len()).sum();
        self.metrics.record_transfers(delivered, report.failed_transfers);
        Ok(report)
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchOutcome> {
        let query_type = request.query.kind();
        let outcome = self.search.search(request).await?;
        self.metrics.record_search(query_type, outcome.failed.len());
        Ok(outcome)
    }

    pub async fn rebalance(
        &self,
        dataset_id: Option<&str>,
        target: Option<usize>,
    ) -> Result<BTreeMap<String, RebalanceCounts>> {
        let counts = self.rebalancer.rebalance(dataset_id, target).await?;
        self.metrics
            .record_rebalance(counts.values().map(|c| c.rebalanced).sum());
        Ok(counts)
    }

    /// One sync round against every discovered peer.
    pub async fn sync_now(&self) -> BTreeMap<NodeId, shardmesh_replication::Result<SyncReport>> {
        let reports = self.sync.sync_round().await;
        for result in reports.values() {
            self.metrics.record_sync_round(result.is_ok());
        }
        reports
    }

    /// Refreshes the gauges that mirror local state.
    pub fn refresh_gauges(&self) {
        let stats = self.ctx.store().stats();
        self.metrics.datasets_total.set(stats.datasets as i64);
        self.metrics.shards_total.set(stats.shards as i64);
        self.metrics
            .peers_known
            .set(self.ctx.membership().peer_count() as i64);
    }
}

impl std::fmt::Debug for ShardNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardNode")
            .field("node_id", self.node_id())
            .field("role", &self.ctx.role())
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}
