//! HTTP API for the shardmesh node.
//!
//! Clients create datasets, ingest records, run federated searches and
//! trigger rebalance or sync rounds through these endpoints.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use shardmesh_replication::ReplicationError;
use shardmesh_search::SearchError;
use shardmesh_storage::MetadataStore;
use shardmesh_types::{NewDataset, PeerInfo, Record, SearchQuery, SearchRequest};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::node::{NodeError, ShardNode};
use crate::observability::{metrics_middleware, request_id_middleware};

/// Application state shared across handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    pub node: Arc<ShardNode>,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::Replication(ReplicationError::InvalidArgument(reason))
            | NodeError::Search(SearchError::InvalidArgument(reason)) => ApiError::BadRequest(reason),
            NodeError::Replication(err @ ReplicationError::NotFound { .. }) => {
                ApiError::NotFound(err.to_string())
            }
            NodeError::Search(err @ SearchError::DatasetNotFound(_)) => {
                ApiError::NotFound(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<shardmesh_storage::StorageError> for ApiError {
    fn from(e: shardmesh_storage::StorageError) -> Self {
        NodeError::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Records to shard into a dataset.
#[derive(Debug, Deserialize, Serialize)]
pub struct IngestRequest {
    pub records: Vec<Record>,
    #[serde(default)]
    pub shard_size: Option<usize>,
    #[serde(default)]
    pub replication_factor: Option<usize>,
}

/// Scope of a rebalance run.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RebalanceRequest {
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub target: Option<usize>,
}

/// This node and the peers it knows.
#[derive(Debug, Serialize, Deserialize)]
pub struct PeersResponse {
    pub local: PeerInfo,
    pub peers: Vec<PeerInfo>,
}

/// Creates the API router.
pub fn create_router(state: AppState) -> Router {
    let metrics = state.node.metrics().clone();
    Router::new()
        .route("/health", get(health_check))
        .route("/peers", get(list_peers))
        .route("/datasets", get(list_datasets).post(create_dataset))
        .route("/datasets/{id}", get(get_dataset))
        .route("/datasets/{id}/shards", get(list_shards))
        .route("/datasets/{id}/records", post(ingest_records))
        .route("/datasets/{id}/search", post(search_dataset))
        .route("/rebalance", post(rebalance))
        .route("/sync", post(sync))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn_with_state(metrics, metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "node_id": state.node.node_id(),
        "role": state.node.context().role(),
        "store_open": state.node.context().store().is_open(),
    }))
}

async fn list_peers(State(state): State<AppState>) -> impl IntoResponse {
    let membership = state.node.context().membership();
    Json(PeersResponse {
        local: membership.local_info(),
        peers: membership.known_peers(),
    })
}

async fn list_datasets(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.node.context().store().list_datasets()?))
}

async fn create_dataset(
    State(state): State<AppState>,
    Json(params): Json<NewDataset>,
) -> Result<impl IntoResponse, ApiError> {
    let dataset = state.node.create_dataset(params).await?;
    Ok((StatusCode::CREATED, Json(dataset)))
}

async fn get_dataset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let dataset = state
        .node
        .context()
        .dataset(&id)
        .map_err(|e| ApiError::from(NodeError::from(e)))?;
    Ok(Json(dataset))
}

async fn list_shards(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.node.context().store();
    if store.get_dataset(&id)?.is_none() {
        return Err(ApiError::NotFound(format!("dataset not found: {id}")));
    }
    Ok(Json(store.list_shards_for_dataset(&id)?))
}

async fn ingest_records(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .node
        .ingest(&id, &req.records, req.shard_size, req.replication_factor)
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn search_dataset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(query): Json<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .node
        .search(SearchRequest {
            dataset_id: id,
            query,
        })
        .await?;
    Ok(Json(outcome))
}

async fn rebalance(
    State(state): State<AppState>,
    Json(req): Json<RebalanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let counts = state
        .node
        .rebalance(req.dataset_id.as_deref(), req.target)
        .await?;
    Ok(Json(counts))
}

async fn sync(State(state): State<AppState>) -> impl IntoResponse {
    let reports: BTreeMap<String, serde_json::Value> = state
        .node
        .sync_now()
        .await
        .into_iter()
        .map(|(peer, result)| {
            let value = match result {
                Ok(report) => serde_json::to_value(report)
                    .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() })),
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            };
            (peer.to_string(), value)
        })
        .collect();
    Json(reports)
}

async fn metrics_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    state.node.refresh_gauges();
    let body = state
        .node
        .metrics()
        .encode()
        .map_err(|e| ApiError::Internal(format!("failed to encode metrics: {e}")))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response())
}
