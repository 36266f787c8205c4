//! Query and result types for federated search.

use crate::NodeId;
use serde::{Deserialize, Serialize};

/// A single dataset record. Records are schemaless JSON objects.
pub type Record = serde_json::Value;

/// The query part of a search request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "query_type", rename_all = "snake_case")]
pub enum SearchQuery {
    /// Nearest-neighbour search by vector distance.
    Vector {
        query_vector: Vec<f32>,
        top_k: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance_threshold: Option<f32>,
    },
    /// Term-matching search ranked by score.
    Keyword { query: String, top_k: usize },
}

impl SearchQuery {
    /// The maximum number of results the caller wants.
    #[must_use]
    pub fn top_k(&self) -> usize {
        match self {
            Self::Vector { top_k, .. } | Self::Keyword { top_k, .. } => *top_k,
        }
    }

    /// Short name of the query kind, for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Vector { .. } => "vector",
            Self::Keyword { .. } => "keyword",
        }
    }
}

/// A search addressed to one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub dataset_id: String,
    #[serde(flatten)]
    pub query: SearchQuery,
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub shard_id: String,
    /// Position of the record inside its shard.
    pub record_index: u64,
    /// Node that produced the hit.
    pub node_id: NodeId,
    pub record: Record,
    /// Set for vector queries. Lower is better.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    /// Set for keyword queries. Higher is better.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_flattens_query_type() {
        let req = SearchRequest {
            dataset_id: "ds".into(),
            query: SearchQuery::Keyword {
                query: "rust".into(),
                top_k: 5,
            },
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({"dataset_id": "ds", "query_type": "keyword", "query": "rust", "top_k": 5})
        );

        let back: SearchRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn vector_query_threshold_is_optional() {
        let req: SearchRequest = serde_json::from_value(json!({
            "dataset_id": "ds",
            "query_type": "vector",
            "query_vector": [0.0, 1.0],
            "top_k": 3
        }))
        .unwrap();
        assert_eq!(req.query.top_k(), 3);
        assert_eq!(req.query.kind(), "vector");
        assert!(matches!(
            req.query,
            SearchQuery::Vector {
                distance_threshold: None,
                ..
            }
        ));
    }
}
