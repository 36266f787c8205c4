//! HTTP API tests against nodes wired over the in-memory network.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use shardmesh_node::api::{create_router, AppState};
use shardmesh_node::{NodeConfig, ShardNode, StorageBackend};
use shardmesh_p2p::{MemoryNetwork, NodeIdentity, ProtocolRouter};
use shardmesh_types::{NodeId, NodeRole, PeerInfo};
use std::sync::Arc;
use tower::ServiceExt;

fn id(name: &str) -> NodeId {
    NodeId::new(name).expect("valid node id")
}

fn memory_node(network: &MemoryNetwork, name: &str, role: NodeRole) -> Arc<ShardNode> {
    let config = NodeConfig {
        role,
        storage_backend: StorageBackend::Memory,
        request_timeout_secs: 1,
        default_replication_factor: 2,
        default_shard_size: 2,
        ..NodeConfig::default()
    };
    let router = Arc::new(ProtocolRouter::new());
    let transport = network.join(id(name), router.clone());
    let node = ShardNode::assemble(config, NodeIdentity::new(id(name), role), transport, router)
        .expect("node assembles");
    Arc::new(node)
}

fn introduce(node: &ShardNode, others: &[&Arc<ShardNode>]) {
    for other in others {
        node.context()
            .membership()
            .add_peer(PeerInfo::new(other.node_id().clone()));
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.map(|b| b.to_string()).unwrap_or_default()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, value)
}

struct Cluster {
    a: Arc<ShardNode>,
    b: Arc<ShardNode>,
    app: Router,
}

fn cluster(network: &MemoryNetwork) -> Cluster {
    let a = memory_node(network, "a", NodeRole::Hybrid);
    let b = memory_node(network, "b", NodeRole::Worker);
    let c = memory_node(network, "c", NodeRole::Worker);
    introduce(&a, &[&b, &c]);
    introduce(&b, &[&a]);
    let app = create_router(AppState { node: a.clone() });
    Cluster { a, b, app }
}

fn records(n: usize) -> Value {
    let records: Vec<Value> = (0..n)
        .map(|i| json!({"id": i, "text": format!("note {i}"), "vector": [i as f32]}))
        .collect();
    json!({ "records": records })
}

async fn create(app: &Router, name: &str) -> String {
    let (status, body) = call(app, "POST", "/datasets", Some(json!({"name": name}))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["dataset_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let network = MemoryNetwork::new();
    let cluster = cluster(&network);

    let (status, body) = call(&cluster.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node_id"], "a");
    assert_eq!(body["role"], "hybrid");
}

#[tokio::test]
async fn test_ingest_and_inspect() {
    let network = MemoryNetwork::new();
    let cluster = cluster(&network);
    let ds = create(&cluster.app, "notes").await;

    let (status, report) = call(
        &cluster.app,
        "POST",
        &format!("/datasets/{ds}/records"),
        Some(records(5)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(report["shards"].as_array().unwrap().len(), 3);
    assert_eq!(report["failed_transfers"], 0);

    let (_, dataset) = call(&cluster.app, "GET", &format!("/datasets/{ds}"), None).await;
    assert_eq!(dataset["total_records"], 5);

    let (_, shards) = call(&cluster.app, "GET", &format!("/datasets/{ds}/shards"), None).await;
    let shards = shards.as_array().unwrap();
    let counts: Vec<_> = shards.iter().map(|s| s["record_count"].as_u64().unwrap()).collect();
    assert_eq!(counts, vec![2, 2, 1]);
    for shard in shards {
        assert_eq!(shard["node_ids"].as_array().unwrap().len(), 3);
    }

    let (_, list) = call(&cluster.app, "GET", "/datasets", None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (_, metrics) = call(&cluster.app, "GET", "/metrics", None).await;
    let metrics = metrics.as_str().unwrap().to_string();
    assert!(metrics.contains("shardmesh_shard_transfers_total{outcome=\"ok\"} 6"));
    assert!(metrics.contains("shardmesh_shards 3"));
}

#[tokio::test]
async fn test_search_endpoint() {
    let network = MemoryNetwork::new();
    let cluster = cluster(&network);
    let ds = create(&cluster.app, "vectors").await;
    call(&cluster.app, "POST", &format!("/datasets/{ds}/records"), Some(records(6))).await;

    let (status, outcome) = call(
        &cluster.app,
        "POST",
        &format!("/datasets/{ds}/search"),
        Some(json!({"query_type": "vector", "query_vector": [4.2], "top_k": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<_> = outcome["hits"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["record"]["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![4, 5]);
    assert_eq!(outcome["failed"], json!([]));

    let (status, outcome) = call(
        &cluster.app,
        "POST",
        &format!("/datasets/{ds}/search"),
        Some(json!({"query_type": "keyword", "query": "note", "top_k": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["hits"].as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn test_error_statuses() {
    let network = MemoryNetwork::new();
    let cluster = cluster(&network);
    let ds = create(&cluster.app, "errors").await;

    let (status, body) = call(&cluster.app, "GET", "/datasets/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("missing"));

    let (status, _) = call(&cluster.app, "GET", "/datasets/missing/shards", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &cluster.app,
        "POST",
        &format!("/datasets/{ds}/search"),
        Some(json!({"query_type": "vector", "query_vector": [1.0], "top_k": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &cluster.app,
        "POST",
        "/datasets/missing/search",
        Some(json!({"query_type": "keyword", "query": "x", "top_k": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &cluster.app,
        "POST",
        &format!("/datasets/{ds}/records"),
        Some(json!({"records": [], "shard_size": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Workers cannot create datasets.
    let worker_app = create_router(AppState {
        node: cluster.b.clone(),
    });
    let (status, _) = call(&worker_app, "POST", "/datasets", Some(json!({"name": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sync_and_rebalance_endpoints() {
    let network = MemoryNetwork::new();
    let cluster = cluster(&network);
    let ds = create(&cluster.app, "ops").await;
    call(
        &cluster.app,
        "POST",
        &format!("/datasets/{ds}/records"),
        Some(json!({"records": [{"id": 0}], "replication_factor": 1})),
    )
    .await;

    let worker_app = create_router(AppState {
        node: cluster.b.clone(),
    });
    let (status, reports) = call(&worker_app, "POST", "/sync", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reports["a"]["peer"], "a");
    assert!(reports["a"].get("error").is_none());
    assert!(cluster.b.context().find_dataset(&ds).unwrap().is_some());

    let (status, counts) = call(
        &cluster.app,
        "POST",
        "/rebalance",
        Some(json!({"dataset_id": ds, "target": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(counts[&ds]["failed"], 0);
    let holders = cluster.a.context().shard(&format!("{ds}-shard-0")).unwrap().node_ids;
    assert_eq!(holders.len(), 3);

    let (status, _) = call(&cluster.app, "POST", "/rebalance", Some(json!({"target": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let network = MemoryNetwork::new();
    let cluster = cluster(&network);
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-42")
        .body(Body::empty())
        .unwrap();
    let response = cluster.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-42");
}
