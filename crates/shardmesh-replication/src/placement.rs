//! Consistent-hash shard placement.
//!
//! A node's affinity for a shard is `hash(node_id) XOR hash(shard_id)`; the
//! nodes with the lowest affinity hold the shard. Adding or removing one
//! candidate only moves the shards whose chosen set included it.

use sha2::{Digest, Sha256};
use shardmesh_types::NodeId;
use std::collections::BTreeSet;

/// 32-bit placement hash: the first four bytes of SHA-256, big-endian.
/// Stable across processes and platforms.
#[must_use]
pub fn placement_hash(id: &str) -> u32 {
    let digest = Sha256::digest(id.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Picks up to `count` nodes for `shard_id` from `candidates`, skipping
/// anything in `exclude`. Duplicates are ignored. The result is ordered by
/// affinity and depends only on the candidate set, not its order.
#[must_use]
pub fn select_nodes<'a>(
    shard_id: &str,
    candidates: impl IntoIterator<Item = &'a NodeId>,
    exclude: &BTreeSet<NodeId>,
    count: usize,
) -> Vec<NodeId> {
    let shard_hash = placement_hash(shard_id);
    let unique: BTreeSet<&NodeId> = candidates
        .into_iter()
        .filter(|n| !exclude.contains(*n))
        .collect();

    let mut ranked: Vec<(u32, &NodeId)> = unique
        .into_iter()
        .map(|node| (placement_hash(node.as_str()) ^ shard_hash, node))
        .collect();
    // Ties on affinity fall back to id order.
    ranked.sort();
    ranked
        .into_iter()
        .take(count)
        .map(|(_, node)| node.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::new(*n).unwrap()).collect()
    }

    #[test]
    fn hash_is_stable() {
        // First four bytes of SHA-256("").
        assert_eq!(placement_hash(""), 0xe3b0_c442);
        assert_eq!(placement_hash("shard"), placement_hash("shard"));
    }

    #[test]
    fn excludes_and_dedupes() {
        let candidates = nodes(&["a", "b", "b", "c", "self"]);
        let exclude = BTreeSet::from([NodeId::new("self").unwrap()]);
        let chosen = select_nodes("ds-shard-0", &candidates, &exclude, 10);

        assert_eq!(chosen.len(), 3);
        assert!(!chosen.iter().any(|n| n.as_str() == "self"));
        let unique: BTreeSet<_> = chosen.iter().collect();
        assert_eq!(unique.len(), chosen.len());
    }

    #[test]
    fn returns_fewer_when_short_of_candidates() {
        let chosen = select_nodes("s", &nodes(&["a"]), &BTreeSet::new(), 3);
        assert_eq!(chosen, nodes(&["a"]));
        assert!(select_nodes("s", &nodes(&[]), &BTreeSet::new(), 3).is_empty());
        assert!(select_nodes("s", &nodes(&["a", "b"]), &BTreeSet::new(), 0).is_empty());
    }

    #[test]
    fn ordered_by_affinity() {
        let candidates = nodes(&["n1", "n2", "n3", "n4", "n5"]);
        let chosen = select_nodes("ds-shard-7", &candidates, &BTreeSet::new(), 5);
        let shard_hash = placement_hash("ds-shard-7");
        let affinities: Vec<u32> = chosen
            .iter()
            .map(|n| placement_hash(n.as_str()) ^ shard_hash)
            .collect();
        let mut sorted = affinities.clone();
        sorted.sort();
        assert_eq!(affinities, sorted);
    }

    proptest! {
        #[test]
        fn deterministic_for_same_candidate_set(
            names in proptest::collection::btree_set("[a-z0-9]{1,8}", 1..12),
            shard in "[a-z0-9-]{1,20}",
            count in 0usize..6,
        ) {
            let forward: Vec<NodeId> = names.iter().map(|n| NodeId::new(n.clone()).unwrap()).collect();
            let mut reversed = forward.clone();
            reversed.reverse();

            let a = select_nodes(&shard, &forward, &BTreeSet::new(), count);
            let b = select_nodes(&shard, &reversed, &BTreeSet::new(), count);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.len(), count.min(forward.len()));
        }

        #[test]
        fn removing_unchosen_candidate_keeps_selection(
            names in proptest::collection::btree_set("[a-z0-9]{1,8}", 2..12),
            shard in "[a-z0-9-]{1,20}",
        ) {
            let all: Vec<NodeId> = names.iter().map(|n| NodeId::new(n.clone()).unwrap()).collect();
            let chosen = select_nodes(&shard, &all, &BTreeSet::new(), 1);
            let unchosen: Vec<NodeId> = all.iter().filter(|n| !chosen.contains(n)).cloned().collect();
            let dropped = &unchosen[0];
            let remaining: Vec<NodeId> = all.iter().filter(|n| *n != dropped).cloned().collect();
            prop_assert_eq!(select_nodes(&shard, &remaining, &BTreeSet::new(), 1), chosen);
        }
    }
}
