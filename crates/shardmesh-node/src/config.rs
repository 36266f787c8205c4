//! Node configuration.
//!
//! Sources, later ones winning: built-in defaults, an optional YAML file,
//! `SHARDMESH_*` environment variables, then CLI flags applied by the binary.

use crate::observability::LogFormat;
use serde::{Deserialize, Serialize};
use shardmesh_types::{NodeRole, PeerInfo};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Where dataset and shard metadata live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Lost on restart.
    Memory,
    /// One JSON file per record under `data_dir`.
    #[default]
    File,
    /// RocksDB under `data_dir`. Needs the `rocksdb` feature.
    RocksDb,
}

impl std::str::FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "rocksdb" => Ok(Self::RocksDb),
            other => Err(ConfigError::Invalid(format!(
                "unknown storage backend '{other}'"
            ))),
        }
    }
}

/// Configuration for a shardmesh node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity file, metadata store and shard payloads.
    pub data_dir: PathBuf,
    /// Peer transport listen address.
    pub listen_addr: String,
    /// Address announced to peers. Defaults to `listen_addr`.
    pub advertise_addr: Option<String>,
    /// HTTP API listen address.
    pub api_addr: String,
    pub role: NodeRole,
    /// `node_id@host:port` entries dialled on start.
    pub bootstrap_peers: Vec<String>,
    pub request_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub rebalance_interval_secs: u64,
    pub default_replication_factor: usize,
    pub default_shard_size: usize,
    pub storage_backend: StorageBackend,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            listen_addr: format!("0.0.0.0:{}", shardmesh_p2p::DEFAULT_PORT),
            advertise_addr: None,
            api_addr: "127.0.0.1:8080".to_string(),
            role: NodeRole::Hybrid,
            bootstrap_peers: Vec::new(),
            request_timeout_secs: shardmesh_p2p::DEFAULT_REQUEST_TIMEOUT.as_secs(),
            sync_interval_secs: 60,
            rebalance_interval_secs: 300,
            default_replication_factor: 3,
            default_shard_size: 1000,
            storage_backend: StorageBackend::File,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl NodeConfig {
    /// Loads the configuration from `path` (if any) and the environment, and
    /// validates it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SHARDMESH")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("bootstrap_peers"),
        );

        let config: NodeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML document, filling missing fields with defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Checks value ranges and bootstrap entries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be positive".into(),
            ));
        }
        if self.sync_interval_secs == 0 || self.rebalance_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "background intervals must be positive".into(),
            ));
        }
        if self.default_replication_factor == 0 {
            return Err(ConfigError::Invalid(
                "default_replication_factor must be positive".into(),
            ));
        }
        if self.default_shard_size == 0 {
            return Err(ConfigError::Invalid(
                "default_shard_size must be positive".into(),
            ));
        }
        self.bootstrap_peer_infos()?;
        Ok(())
    }

    /// Parsed bootstrap peers.
    pub fn bootstrap_peer_infos(&self) -> Result<Vec<PeerInfo>, ConfigError> {
        self.bootstrap_peers
            .iter()
            .map(|entry| {
                let info: PeerInfo = entry
                    .parse()
                    .map_err(|e| ConfigError::Invalid(format!("bootstrap peer '{entry}': {e}")))?;
                if info.address.is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "bootstrap peer '{entry}' has no address"
                    )));
                }
                Ok(info)
            })
            .collect()
    }

    /// Address announced to peers.
    pub fn advertised_addr(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.listen_addr)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }
}
