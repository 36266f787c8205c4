//! Per-shard scoring.

use crate::{Result, SearchError};
use shardmesh_types::{Record, SearchQuery};

/// One record matched inside a shard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredRecord {
    /// Position of the record in its shard.
    pub index: usize,
    /// Set for vector queries. Lower is better.
    pub distance: Option<f32>,
    /// Set for keyword queries. Higher is better.
    pub score: Option<f32>,
}

/// Ranks the records of one shard against a query.
pub trait ShardSearcher: Send + Sync {
    /// Returns matching records in any order.
    fn rank(&self, records: &[Record], query: &SearchQuery) -> Vec<ScoredRecord>;
}

/// Checks a query before it is run or fanned out.
pub fn validate_query(query: &SearchQuery) -> Result<()> {
    if query.top_k() == 0 {
        return Err(SearchError::InvalidArgument("top_k must be positive".into()));
    }
    match query {
        SearchQuery::Vector {
            query_vector,
            distance_threshold,
            ..
        } => {
            if query_vector.is_empty() {
                return Err(SearchError::InvalidArgument(
                    "query vector must not be empty".into(),
                ));
            }
            if query_vector.iter().any(|v| !v.is_finite()) {
                return Err(SearchError::InvalidArgument(
                    "query vector must be finite".into(),
                ));
            }
            if distance_threshold.is_some_and(|t| t.is_nan() || t < 0.0) {
                return Err(SearchError::InvalidArgument(
                    "distance threshold must be non-negative".into(),
                ));
            }
        }
        SearchQuery::Keyword { query, .. } => {
            if tokenize(query).is_empty() {
                return Err(SearchError::InvalidArgument(
                    "keyword query has no terms".into(),
                ));
            }
        }
    }
    Ok(())
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Scans every record: Euclidean distance over a vector field and term
/// frequency over a text field.
#[derive(Debug, Clone)]
pub struct BruteForceSearcher {
    vector_field: String,
    text_field: String,
}

impl Default for BruteForceSearcher {
    fn default() -> Self {
        Self {
            vector_field: "vector".to_string(),
            text_field: "text".to_string(),
        }
    }
}

impl BruteForceSearcher {
    #[must_use]
    pub fn new(vector_field: impl Into<String>, text_field: impl Into<String>) -> Self {
        Self {
            vector_field: vector_field.into(),
            text_field: text_field.into(),
        }
    }

    fn vector_of(&self, record: &Record) -> Option<Vec<f32>> {
        record
            .get(&self.vector_field)?
            .as_array()?
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect()
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

impl ShardSearcher for BruteForceSearcher {
    fn rank(&self, records: &[Record], query: &SearchQuery) -> Vec<ScoredRecord> {
        match query {
            SearchQuery::Vector {
                query_vector,
                distance_threshold,
                ..
            } => records
                .iter()
                .enumerate()
                .filter_map(|(index, record)| {
                    let vector = self.vector_of(record)?;
                    if vector.len() != query_vector.len() {
                        return None;
                    }
                    let distance = euclidean(&vector, query_vector);
                    if distance_threshold.is_some_and(|t| distance > t) {
                        return None;
                    }
                    Some(ScoredRecord {
                        index,
                        distance: Some(distance),
                        score: None,
                    })
                })
                .collect(),
            SearchQuery::Keyword { query, .. } => {
                let terms = tokenize(query);
                records
                    .iter()
                    .enumerate()
                    .filter_map(|(index, record)| {
                        let text = record.get(&self.text_field)?.as_str()?;
                        let tokens = tokenize(text);
                        if tokens.is_empty() {
                            return None;
                        }
                        let hits = tokens.iter().filter(|t| terms.contains(t)).count();
                        if hits == 0 {
                            return None;
                        }
                        Some(ScoredRecord {
                            index,
                            distance: None,
                            score: Some(hits as f32 / tokens.len() as f32),
                        })
                    })
                    .collect()
            }
        }
    }
}
