//! Shardmesh node binary.

use anyhow::Context;
use clap::Parser;
use shardmesh_node::api::{create_router, AppState};
use shardmesh_node::observability::{init_logging, LogFormat};
use shardmesh_node::{NodeConfig, ShardNode, StorageBackend};
use shardmesh_types::NodeRole;
use std::path::PathBuf;
use std::sync::Arc;

/// Shardmesh node - dataset sharding, replication and federated search
#[derive(Parser, Debug)]
#[command(name = "shardmesh-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "SHARDMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Peer transport listen address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Address announced to peers
    #[arg(long)]
    advertise_addr: Option<String>,

    /// HTTP API listen address
    #[arg(long)]
    api_addr: Option<String>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Node role (coordinator, worker, hybrid, client)
    #[arg(long)]
    role: Option<NodeRole>,

    /// Bootstrap peer as node_id@host:port (repeatable)
    #[arg(long = "bootstrap")]
    bootstrap_peers: Vec<String>,

    /// Metadata storage backend (memory, file, rocksdb)
    #[arg(long)]
    storage: Option<StorageBackend>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(self, config: &mut NodeConfig) {
        if let Some(v) = self.listen_addr {
            config.listen_addr = v;
        }
        if let Some(v) = self.advertise_addr {
            config.advertise_addr = Some(v);
        }
        if let Some(v) = self.api_addr {
            config.api_addr = v;
        }
        if let Some(v) = self.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = self.role {
            config.role = v;
        }
        if !self.bootstrap_peers.is_empty() {
            config.bootstrap_peers = self.bootstrap_peers;
        }
        if let Some(v) = self.storage {
            config.storage_backend = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
        if let Some(v) = self.log_format {
            config.log_format = v;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let print_config = args.print_config;

    let mut config =
        NodeConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    if print_config {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    init_logging(&config.log_level, config.log_format);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting shardmesh node");

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let api_addr = config.api_addr.clone();
    let node = Arc::new(ShardNode::bind(config).await?);
    node.start().await?;

    let app = create_router(AppState { node: node.clone() });
    let listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API on {api_addr}"))?;
    tracing::info!(
        node_id = %node.node_id(),
        api_addr = %api_addr,
        peer_addr = ?node.peer_addr(),
        "node is ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("API server failed")?;

    node.shutdown().await?;
    Ok(())
}
