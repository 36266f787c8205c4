//! Scatter-gather search across the nodes holding a dataset.

use crate::local::LocalSearch;
use crate::merge::merge_hits;
use crate::searcher::validate_query;
use crate::{Result, SearchError};
use serde::Serialize;
use shardmesh_p2p::message::{FederatedSearchRequest, SearchResultsData, ShardDiscoveryRequest, ShardsData};
use shardmesh_p2p::Membership;
use shardmesh_types::{NodeId, SearchHit, SearchQuery, SearchRequest};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Merged hits plus which holders answered.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub responded: BTreeSet<NodeId>,
    pub failed: BTreeSet<NodeId>,
}

/// Fans a query out to every holder of a dataset and merges the answers.
#[derive(Debug, Clone)]
pub struct SearchCoordinator {
    membership: Arc<Membership>,
    local: Arc<LocalSearch>,
}

impl SearchCoordinator {
    #[must_use]
    pub fn new(membership: Arc<Membership>, local: Arc<LocalSearch>) -> Self {
        Self { membership, local }
    }

    pub async fn vector_search(
        &self,
        dataset_id: &str,
        query_vector: Vec<f32>,
        top_k: usize,
        distance_threshold: Option<f32>,
    ) -> Result<SearchOutcome> {
        self.search(SearchRequest {
            dataset_id: dataset_id.to_string(),
            query: SearchQuery::Vector {
                query_vector,
                top_k,
                distance_threshold,
            },
        })
        .await
    }

    pub async fn keyword_search(
        &self,
        dataset_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<SearchOutcome> {
        self.search(SearchRequest {
            dataset_id: dataset_id.to_string(),
            query: SearchQuery::Keyword {
                query: query.to_string(),
                top_k,
            },
        })
        .await
    }

    /// Runs `request` on every holder in parallel.
    ///
    /// Holders that fail or time out contribute nothing and are listed in
    /// [`SearchOutcome::failed`]. Fails only for an invalid query, or when
    /// neither this node nor any reachable peer knows the dataset.
    #[instrument(skip(self, request), fields(dataset_id = %request.dataset_id, query_type = request.query.kind()))]
    pub async fn search(&self, request: SearchRequest) -> Result<SearchOutcome> {
        validate_query(&request.query)?;
        let Some(holders) = self.resolve_holders(&request.dataset_id).await? else {
            return Err(SearchError::DatasetNotFound(request.dataset_id));
        };

        let local_id = self.local.node_id().clone();
        let client = self.membership.client().clone();
        let request = Arc::new(request);
        let mut tasks = JoinSet::new();
        for holder in holders {
            let request = request.clone();
            if holder == local_id {
                let local = self.local.clone();
                tasks.spawn(async move {
                    let result = local.search(&request).await.map_err(|e| e.to_string());
                    (holder, result)
                });
            } else {
                let client = client.clone();
                tasks.spawn(async move {
                    let result: shardmesh_p2p::Result<SearchResultsData> = client
                        .call(&holder, &FederatedSearchRequest::Search((*request).clone()))
                        .await;
                    (holder, result.map(|d| d.results).map_err(|e| e.to_string()))
                });
            }
        }

        let mut outcome = SearchOutcome::default();
        let mut hits = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (holder, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "search task panicked");
                    continue;
                }
            };
            match result {
                Ok(found) => {
                    hits.extend(found);
                    outcome.responded.insert(holder);
                }
                Err(reason) => {
                    warn!(peer = %holder, error = %reason, "holder did not answer search");
                    outcome.failed.insert(holder);
                }
            }
        }

        outcome.hits = merge_hits(hits, &request.query);
        info!(
            hits = outcome.hits.len(),
            responded = outcome.responded.len(),
            failed = outcome.failed.len(),
            "federated search finished"
        );
        Ok(outcome)
    }

    /// Union of the holders recorded locally and those reported by one round
    /// of peer shard discovery. `None` when nobody knows the dataset.
    async fn resolve_holders(&self, dataset_id: &str) -> Result<Option<BTreeSet<NodeId>>> {
        let store = self.local.store();
        let mut known = store.get_dataset(dataset_id)?.is_some();
        let mut holders: BTreeSet<NodeId> = store
            .list_shards_for_dataset(dataset_id)?
            .into_iter()
            .flat_map(|s| s.node_ids)
            .collect();

        let peers = self.membership.discover_peers().await;
        let mut tasks = JoinSet::new();
        for peer in peers {
            let client = self.membership.client().clone();
            let request = ShardDiscoveryRequest::ListShards {
                dataset_id: Some(dataset_id.to_string()),
            };
            tasks.spawn(async move {
                let result: shardmesh_p2p::Result<ShardsData> = client.call(&peer, &request).await;
                (peer, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let Ok((peer, result)) = joined else {
                continue;
            };
            match result {
                Ok(data) => {
                    if !data.shards.is_empty() {
                        known = true;
                    }
                    holders.extend(data.shards.into_iter().flat_map(|s| s.node_ids));
                }
                Err(e) => debug!(peer = %peer, error = %e, "shard discovery failed"),
            }
        }

        known |= !holders.is_empty();
        debug!(holders = holders.len(), "resolved dataset holders");
        Ok(known.then_some(holders))
    }
}
