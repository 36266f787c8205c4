//! Merging ranked hits from many nodes.

use shardmesh_types::{SearchHit, SearchQuery};
use std::cmp::Ordering;
use std::collections::HashMap;

fn rank_cmp(a: &SearchHit, b: &SearchHit, query: &SearchQuery) -> Ordering {
    let primary = match query {
        // Ascending distance; hits without one sort last.
        SearchQuery::Vector { .. } => match (a.distance, b.distance) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        },
        // Descending score.
        SearchQuery::Keyword { .. } => match (a.score, b.score) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        },
    };
    primary
        .then_with(|| a.shard_id.cmp(&b.shard_id))
        .then_with(|| a.record_index.cmp(&b.record_index))
}

/// Dedupes hits by `(shard_id, record_index)`, keeping the best-ranked copy,
/// sorts them for the query kind and truncates to `top_k`.
///
/// Replicas of one shard return the same records; the dedupe keeps them from
/// crowding out other results.
#[must_use]
pub fn merge_hits(hits: Vec<SearchHit>, query: &SearchQuery) -> Vec<SearchHit> {
    let mut best: HashMap<(String, u64), SearchHit> = HashMap::new();
    for hit in hits {
        let key = (hit.shard_id.clone(), hit.record_index);
        match best.get(&key) {
            Some(current) if rank_cmp(current, &hit, query) != Ordering::Greater => {}
            _ => {
                best.insert(key, hit);
            }
        }
    }

    let mut merged: Vec<SearchHit> = best.into_values().collect();
    merged.sort_by(|a, b| rank_cmp(a, b, query));
    merged.truncate(query.top_k());
    merged
}
