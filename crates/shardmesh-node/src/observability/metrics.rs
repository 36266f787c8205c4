//! Prometheus metrics collection.
//!
//! Provides metrics for:
//! - HTTP request latency and counts
//! - Shard transfers, sync rounds and rebalance runs
//! - Search fan-outs and the holders that failed to answer
//! - Peer and metadata gauges

use parking_lot::RwLock;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// HTTP request labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Request path pattern
    pub path: String,
    /// Response status code
    pub status: u16,
}

/// Outcome label for operations that can succeed or fail per peer.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// `ok` or `failed`.
    pub outcome: String,
}

impl OutcomeLabels {
    fn ok() -> Self {
        Self {
            outcome: "ok".to_string(),
        }
    }

    fn failed() -> Self {
        Self {
            outcome: "failed".to_string(),
        }
    }
}

/// Search query labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SearchLabels {
    /// `vector` or `keyword`.
    pub query_type: String,
}

/// Metrics state container.
#[derive(Clone)]
pub struct MetricsState {
    /// Prometheus registry.
    pub registry: Arc<RwLock<Registry>>,
    /// HTTP request counter.
    pub http_requests_total: Family<HttpLabels, Counter>,
    /// HTTP request duration histogram (seconds).
    pub http_request_duration_seconds: Family<HttpLabels, Histogram>,
    /// HTTP requests in flight.
    pub http_active_requests: Gauge,
    /// Known peers.
    pub peers_known: Gauge,
    /// Datasets in the local metadata store.
    pub datasets_total: Gauge,
    /// Shards in the local metadata store.
    pub shards_total: Gauge,
    /// Outbound shard transfers by outcome.
    pub shard_transfers_total: Family<OutcomeLabels, Counter>,
    /// Pairwise sync rounds by outcome.
    pub sync_rounds_total: Family<OutcomeLabels, Counter>,
    /// Rebalance runs.
    pub rebalance_runs_total: Counter,
    /// Shards brought up to their replication target.
    pub shards_rebalanced_total: Counter,
    /// Federated searches started.
    pub search_fanouts_total: Family<SearchLabels, Counter>,
    /// Holders that did not answer a search.
    pub search_failed_targets_total: Counter,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsState").finish_non_exhaustive()
    }
}

impl MetricsState {
    /// Create a new metrics state with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        // HTTP metrics
        let http_requests_total = Family::<HttpLabels, Counter>::default();
        registry.register(
            "shardmesh_http_requests",
            "Total HTTP requests",
            http_requests_total.clone(),
        );

        let http_request_duration_seconds =
            Family::<HttpLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 16))
            });
        registry.register(
            "shardmesh_http_request_duration_seconds",
            "HTTP request duration in seconds",
            http_request_duration_seconds.clone(),
        );

        let http_active_requests = Gauge::default();
        registry.register(
            "shardmesh_http_active_requests",
            "Number of HTTP requests in flight",
            http_active_requests.clone(),
        );

        // Cluster view
        let peers_known = Gauge::default();
        registry.register(
            "shardmesh_peers_known",
            "Number of known peers",
            peers_known.clone(),
        );

        let datasets_total = Gauge::default();
        registry.register(
            "shardmesh_datasets",
            "Datasets in the local metadata store",
            datasets_total.clone(),
        );

        let shards_total = Gauge::default();
        registry.register(
            "shardmesh_shards",
            "Shards in the local metadata store",
            shards_total.clone(),
        );

        // Replication
        let shard_transfers_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "shardmesh_shard_transfers",
            "Outbound shard transfers",
            shard_transfers_total.clone(),
        );

        let sync_rounds_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "shardmesh_sync_rounds",
            "Pairwise metadata sync rounds",
            sync_rounds_total.clone(),
        );

        let rebalance_runs_total = Counter::default();
        registry.register(
            "shardmesh_rebalance_runs",
            "Rebalance runs",
            rebalance_runs_total.clone(),
        );

        let shards_rebalanced_total = Counter::default();
        registry.register(
            "shardmesh_shards_rebalanced",
            "Shards brought up to their replication target",
            shards_rebalanced_total.clone(),
        );

        // Search
        let search_fanouts_total = Family::<SearchLabels, Counter>::default();
        registry.register(
            "shardmesh_search_fanouts",
            "Federated searches started",
            search_fanouts_total.clone(),
        );

        let search_failed_targets_total = Counter::default();
        registry.register(
            "shardmesh_search_failed_targets",
            "Holders that did not answer a search",
            search_failed_targets_total.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            http_requests_total,
            http_request_duration_seconds,
            http_active_requests,
            peers_known,
            datasets_total,
            shards_total,
            shard_transfers_total,
            sync_rounds_total,
            rebalance_runs_total,
            shards_rebalanced_total,
            search_fanouts_total,
            search_failed_targets_total,
        }
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let labels = HttpLabels {
            method: method.to_string(),
            path: normalize_path(path),
            status,
        };

        self.http_requests_total.get_or_create(&labels).inc();
        self.http_request_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record the outcome of a batch of shard transfers.
    pub fn record_transfers(&self, succeeded: usize, failed: usize) {
        self.shard_transfers_total
            .get_or_create(&OutcomeLabels::ok())
            .inc_by(succeeded as u64);
        self.shard_transfers_total
            .get_or_create(&OutcomeLabels::failed())
            .inc_by(failed as u64);
    }

    /// Record one pairwise sync round.
    pub fn record_sync_round(&self, ok: bool) {
        let labels = if ok {
            OutcomeLabels::ok()
        } else {
            OutcomeLabels::failed()
        };
        self.sync_rounds_total.get_or_create(&labels).inc();
    }

    /// Record a rebalance run and how many shards it completed.
    pub fn record_rebalance(&self, rebalanced: usize) {
        self.rebalance_runs_total.inc();
        self.shards_rebalanced_total.inc_by(rebalanced as u64);
    }

    /// Record a search fan-out.
    pub fn record_search(&self, query_type: &str, failed_targets: usize) {
        self.search_fanouts_total
            .get_or_create(&SearchLabels {
                query_type: query_type.to_string(),
            })
            .inc();
        self.search_failed_targets_total.inc_by(failed_targets as u64);
    }

    /// Encode metrics for Prometheus scraping.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        let registry = self.registry.read();
        prometheus_client::encoding::text::encode(&mut buffer, &registry)?;
        Ok(buffer)
    }
}

/// Normalize path for metrics (replace dataset ids).
fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            if i > 0 && parts[i - 1] == "datasets" && !part.is_empty() {
                ":id"
            } else {
                *part
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
