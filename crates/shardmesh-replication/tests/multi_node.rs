//! Multi-node replication tests.
//!
//! These tests run several nodes in one process over the in-memory network
//! and verify that:
//! 1. Sharding splits records into consecutive shards with correct totals
//! 2. Sync converges metadata across hops, unions holders and is idempotent
//! 3. Rebalancing reaches the target replication deterministically
//! 4. Unreachable peers degrade results without failing operations

use serde_json::json;
use shardmesh_p2p::{Membership, MemoryNetwork, NodeIdentity, PeerClient, ProtocolRouter};
use shardmesh_replication::{
    register_handlers, DistributionEngine, Rebalancer, ShardingContext, SyncProtocol,
};
use shardmesh_storage::{MemoryContentStore, MemoryMetadataStore, MetadataStore};
use shardmesh_types::{NewDataset, NodeId, NodeRole, PeerInfo, Record};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn id(name: &str) -> NodeId {
    NodeId::new(name).expect("valid node id")
}

struct TestNode {
    ctx: Arc<ShardingContext>,
    engine: DistributionEngine,
    sync: SyncProtocol,
}

impl TestNode {
    fn start(network: &MemoryNetwork, name: &str, role: NodeRole) -> Self {
        let router = Arc::new(ProtocolRouter::new());
        let transport = network.join(id(name), router.clone());
        let client = PeerClient::new(transport, Duration::from_millis(500));
        let membership = Arc::new(Membership::new(NodeIdentity::new(id(name), role), client));
        let store = Arc::new(MemoryMetadataStore::new());
        store.open().expect("store opens");

        let ctx = Arc::new(ShardingContext::new(
            membership,
            store,
            Arc::new(MemoryContentStore::new()),
        ));
        register_handlers(&router, &ctx);
        Self {
            engine: DistributionEngine::new(ctx.clone()),
            sync: SyncProtocol::new(ctx.clone()),
            ctx,
        }
    }

    fn knows(&self, others: &[&TestNode]) {
        for other in others {
            self.ctx
                .membership()
                .add_peer(PeerInfo::new(other.ctx.local_id().clone()));
        }
    }

    fn holders(&self, shard_id: &str) -> BTreeSet<NodeId> {
        self.ctx.shard(shard_id).expect("shard known").node_ids
    }
}

fn records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| json!({"id": i, "text": format!("record {i}"), "vector": [i as f32, 0.0]}))
        .collect()
}

#[tokio::test]
async fn test_sharding_scenario() {
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, "a", NodeRole::Coordinator);

    let ds = a.engine.create_dataset(NewDataset::new("ds1")).await.unwrap();
    let report = a
        .engine
        .shard_dataset(&ds.dataset_id, &records(2500), 1000, 3)
        .await
        .unwrap();

    let sizes: Vec<u64> = report.shards.iter().map(|s| s.record_count).collect();
    assert_eq!(sizes, vec![1000, 1000, 500]);
    assert_eq!(report.dataset.total_records, 2500);
    let sum: u64 = a
        .ctx
        .store()
        .list_shards_for_dataset(&ds.dataset_id)
        .unwrap()
        .iter()
        .map(|s| s.record_count)
        .sum();
    assert_eq!(sum, report.dataset.total_records);
}

#[tokio::test]
async fn test_sync_scenario_unions_holders() {
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, "a", NodeRole::Hybrid);
    let b = TestNode::start(&network, "b", NodeRole::Worker);

    let ds = a.engine.create_dataset(NewDataset::new("s")).await.unwrap();
    a.engine
        .shard_dataset(&ds.dataset_id, &records(10), 10, 0)
        .await
        .unwrap();
    let s1 = format!("{}-shard-0", ds.dataset_id);
    assert_eq!(a.holders(&s1), BTreeSet::from([id("a")]));

    let before_a = a.holders(&s1);
    let report = b.sync.sync_with_peer(&id("a")).await.unwrap();
    assert_eq!(report.shards_pulled, 1);

    let on_b = b.holders(&s1);
    assert!(on_b.contains(&id("a")) && on_b.contains(&id("b")));
    assert!(a.holders(&s1).is_superset(&before_a));
    assert_eq!(
        b.ctx.dataset(&ds.dataset_id).unwrap().total_records,
        a.ctx.dataset(&ds.dataset_id).unwrap().total_records
    );

    // Both directions settle after one round.
    assert!(b.sync.sync_with_peer(&id("a")).await.unwrap().is_unchanged());
    assert!(a.sync.sync_with_peer(&id("b")).await.unwrap().is_unchanged());
}

#[tokio::test]
async fn test_gossip_reaches_every_node() {
    let network = MemoryNetwork::new();
    let nodes: Vec<TestNode> = ["a", "b", "c", "d"]
        .iter()
        .map(|n| TestNode::start(&network, n, NodeRole::Hybrid))
        .collect();
    // A line: a - b - c - d
    for pair in nodes.windows(2) {
        pair[0].knows(&[&pair[1]]);
        pair[1].knows(&[&pair[0]]);
    }

    let ds = nodes[0]
        .engine
        .create_dataset(NewDataset::new("line"))
        .await
        .unwrap();
    nodes[0]
        .engine
        .shard_dataset(&ds.dataset_id, &records(4), 2, 0)
        .await
        .unwrap();

    for _ in 0..3 {
        for node in &nodes {
            node.sync.sync_round().await;
        }
    }

    let reference = nodes[0].ctx.dataset(&ds.dataset_id).unwrap();
    for node in &nodes {
        let dataset = node.ctx.dataset(&ds.dataset_id).unwrap();
        assert_eq!(dataset.total_records, 4);
        assert_eq!(dataset.shard_ids, reference.shard_ids);
        for shard_id in &dataset.shard_ids {
            assert_eq!(
                node.ctx.shard(shard_id).unwrap(),
                nodes[0].ctx.shard(shard_id).unwrap()
            );
        }
    }

    // Converged nodes have nothing left to exchange.
    for node in &nodes {
        for report in node.sync.sync_round().await.into_values() {
            assert!(report.unwrap().is_unchanged());
        }
    }
}

#[tokio::test]
async fn test_rebalance_scenario() {
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, "a", NodeRole::Hybrid);
    let peers: Vec<TestNode> = ["p1", "p2", "p3", "p4"]
        .iter()
        .map(|n| TestNode::start(&network, n, NodeRole::Worker))
        .collect();
    a.knows(&peers.iter().collect::<Vec<_>>());

    let ds = a.engine.create_dataset(NewDataset::new("r")).await.unwrap();
    a.engine
        .shard_dataset(&ds.dataset_id, &records(3), 1, 0)
        .await
        .unwrap();

    let rebalancer = Rebalancer::new(a.engine.clone(), 3);
    let counts = rebalancer.rebalance(Some(&ds.dataset_id), Some(3)).await.unwrap();
    assert_eq!(counts[&ds.dataset_id].rebalanced, 3);
    assert_eq!(counts[&ds.dataset_id].failed, 0);

    let first: Vec<_> = (0..3)
        .map(|i| a.holders(&format!("{}-shard-{i}", ds.dataset_id)))
        .collect();
    assert!(first.iter().all(|h| h.len() == 3 && h.contains(&id("a"))));

    // Same peer set on a fresh coordinator gives the same placement.
    let network2 = MemoryNetwork::new();
    let a2 = TestNode::start(&network2, "a", NodeRole::Hybrid);
    let peers2: Vec<TestNode> = ["p1", "p2", "p3", "p4"]
        .iter()
        .map(|n| TestNode::start(&network2, n, NodeRole::Worker))
        .collect();
    a2.knows(&peers2.iter().collect::<Vec<_>>());
    a2.ctx
        .apply_dataset(a.ctx.dataset(&ds.dataset_id).unwrap())
        .await
        .unwrap();
    for i in 0..3 {
        let shard_id = format!("{}-shard-{i}", ds.dataset_id);
        let mut shard = a.ctx.shard(&shard_id).unwrap();
        shard.node_ids = BTreeSet::from([id("a")]);
        let payload = a.ctx.content().get(&shard.content_id).await.unwrap().unwrap();
        a2.ctx.content().put(payload).await.unwrap();
        a2.ctx.store().put_shard(&shard).unwrap();
    }
    Rebalancer::new(a2.engine.clone(), 3)
        .rebalance(None, None)
        .await
        .unwrap();
    let second: Vec<_> = (0..3)
        .map(|i| a2.holders(&format!("{}-shard-{i}", ds.dataset_id)))
        .collect();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_unreachable_peers_degrade_gracefully() {
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, "a", NodeRole::Hybrid);
    let b = TestNode::start(&network, "b", NodeRole::Worker);
    let c = TestNode::start(&network, "c", NodeRole::Worker);
    a.knows(&[&b, &c]);
    network.set_reachable(&id("c"), false);

    let ds = a.engine.create_dataset(NewDataset::new("u")).await.unwrap();
    let shard_id = format!("{}-shard-0", ds.dataset_id);
    let report = a
        .engine
        .shard_dataset(&ds.dataset_id, &records(5), 10, 2)
        .await
        .unwrap();
    assert_eq!(report.distribution[&shard_id], BTreeSet::from([id("b")]));

    let targets = vec![id("b"), id("c")];
    let outcome = a
        .engine
        .distribute_shard(&shard_id, Some(targets), 2)
        .await
        .unwrap();
    assert_eq!(outcome.succeeded, BTreeSet::from([id("b")]));
    assert_eq!(outcome.failed, BTreeSet::from([id("c")]));

    network.set_reachable(&id("c"), true);
    let counts = Rebalancer::new(a.engine.clone(), 3)
        .rebalance(None, None)
        .await
        .unwrap();
    assert_eq!(counts[&ds.dataset_id].rebalanced, 1);
    assert_eq!(a.holders(&shard_id).len(), 3);
}

#[tokio::test]
async fn test_cancelled_distribution_keeps_committed_transfers() {
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, "a", NodeRole::Hybrid);
    let fast = TestNode::start(&network, "fast", NodeRole::Worker);
    let slow = TestNode::start(&network, "slow", NodeRole::Worker);
    a.knows(&[&fast, &slow]);

    let ds = a.engine.create_dataset(NewDataset::new("c")).await.unwrap();
    let report = a
        .engine
        .shard_dataset(&ds.dataset_id, &records(4), 2, 0)
        .await
        .unwrap();
    let shard_id = report.shards[0].shard_id.clone();

    network.set_hanging(&id("slow"), true);
    let push = a
        .engine
        .distribute_shard(&shard_id, Some(vec![id("fast"), id("slow")]), 2);
    assert!(tokio::time::timeout(Duration::from_millis(100), push)
        .await
        .is_err());

    // The transfer that finished before cancellation stays on both sides.
    assert_eq!(a.holders(&shard_id), BTreeSet::from([id("a"), id("fast")]));
    let received = fast.ctx.shard(&shard_id).unwrap();
    assert!(fast.ctx.holds_payload(&received).await.unwrap());
    // The abandoned one left nothing behind.
    assert!(slow.ctx.find_shard(&shard_id).unwrap().is_none());

    let dataset = a.ctx.dataset(&ds.dataset_id).unwrap();
    assert_eq!(dataset.shard_ids.len(), 2);
    assert_eq!(dataset.total_records, 4);

    network.set_hanging(&id("slow"), false);
    let retry = a
        .engine
        .distribute_shard(&shard_id, Some(vec![id("slow")]), 1)
        .await
        .unwrap();
    assert_eq!(retry.succeeded, BTreeSet::from([id("slow")]));
    assert_eq!(a.holders(&shard_id).len(), 3);
}

#[tokio::test]
async fn test_cancelled_sharding_keeps_local_shards() {
    let network = MemoryNetwork::new();
    let a = TestNode::start(&network, "a", NodeRole::Hybrid);
    let slow = TestNode::start(&network, "slow", NodeRole::Worker);
    a.knows(&[&slow]);
    network.set_hanging(&id("slow"), true);

    let ds = a.engine.create_dataset(NewDataset::new("c")).await.unwrap();
    let recs = records(4);
    let pending = a.engine.shard_dataset(&ds.dataset_id, &recs, 2, 1);
    assert!(tokio::time::timeout(Duration::from_millis(100), pending)
        .await
        .is_err());

    let dataset = a.ctx.dataset(&ds.dataset_id).unwrap();
    assert_eq!(dataset.shard_ids.len(), 2);
    assert_eq!(dataset.total_records, 4);
    for shard_id in &dataset.shard_ids {
        let shard = a.ctx.shard(shard_id).unwrap();
        assert!(a.ctx.holds_payload(&shard).await.unwrap());
    }
    assert!(slow.ctx.store().list_shards().unwrap().is_empty());

    // The dataset lock was released with the dropped call.
    network.set_hanging(&id("slow"), false);
    let report = a
        .engine
        .shard_dataset(&ds.dataset_id, &records(1), 2, 1)
        .await
        .unwrap();
    assert_eq!(report.shards[0].shard_index, 2);
    assert_eq!(report.dataset.total_records, 5);
}
