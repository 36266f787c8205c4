//! Search over the shards held by this node, and the federated-search
//! handler that exposes it to peers.

use crate::merge::merge_hits;
use crate::searcher::{validate_query, ShardSearcher};
use crate::{Result, SearchError};
use async_trait::async_trait;
use shardmesh_p2p::message::{FederatedSearchRequest, SearchResultsData};
use shardmesh_p2p::{read_request, write_response, PeerStream, ProtocolHandler, Response};
use shardmesh_storage::{ContentStore, MetadataStore, RecordEncoder};
use shardmesh_types::{NodeId, SearchHit, SearchRequest};
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs queries against local shard payloads.
pub struct LocalSearch {
    node_id: NodeId,
    store: Arc<dyn MetadataStore>,
    content: Arc<dyn ContentStore>,
    encoder: Arc<dyn RecordEncoder>,
    searcher: Arc<dyn ShardSearcher>,
}

impl LocalSearch {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn MetadataStore>,
        content: Arc<dyn ContentStore>,
        encoder: Arc<dyn RecordEncoder>,
        searcher: Arc<dyn ShardSearcher>,
    ) -> Self {
        Self {
            node_id,
            store,
            content,
            encoder,
            searcher,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Searches every shard of the dataset whose payload is stored here and
    /// returns at most `top_k` merged hits.
    ///
    /// Shards with missing or undecodable payloads are skipped.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        validate_query(&request.query)?;
        let shards = self.store.list_shards_for_dataset(&request.dataset_id)?;

        let mut hits = Vec::new();
        let mut searched = 0usize;
        for shard in shards {
            let Some(payload) = self.content.get(&shard.content_id).await? else {
                continue;
            };
            let records = match self.encoder.decode(&payload) {
                Ok(records) => records,
                Err(e) => {
                    warn!(shard_id = %shard.shard_id, error = %e, "skipping undecodable shard");
                    continue;
                }
            };
            searched += 1;
            for scored in self.searcher.rank(&records, &request.query) {
                let Some(record) = records.get(scored.index) else {
                    continue;
                };
                hits.push(SearchHit {
                    shard_id: shard.shard_id.clone(),
                    record_index: scored.index as u64,
                    node_id: self.node_id.clone(),
                    record: record.clone(),
                    distance: scored.distance,
                    score: scored.score,
                });
            }
        }
        debug!(
            dataset_id = %request.dataset_id,
            query_type = request.query.kind(),
            shards = searched,
            hits = hits.len(),
            "local search"
        );
        Ok(merge_hits(hits, &request.query))
    }
}

impl std::fmt::Debug for LocalSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSearch")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Serves `search` on the federated-search protocol.
#[derive(Debug)]
pub struct FederatedSearchHandler {
    local: Arc<LocalSearch>,
}

impl FederatedSearchHandler {
    #[must_use]
    pub fn new(local: Arc<LocalSearch>) -> Self {
        Self { local }
    }
}

#[async_trait]
impl ProtocolHandler for FederatedSearchHandler {
    async fn handle(&self, peer: &NodeId, stream: &mut dyn PeerStream) -> shardmesh_p2p::Result<()> {
        let FederatedSearchRequest::Search(request) = read_request(stream).await?;
        let response = match self.local.search(&request).await {
            Ok(results) => Response::success(SearchResultsData { results })?,
            Err(SearchError::InvalidArgument(reason)) => Response::error(reason),
            Err(e) => return Err(e.into()),
        };
        debug!(peer = %peer, dataset_id = %request.dataset_id, "served search");
        write_response(stream, &response).await
    }
}
