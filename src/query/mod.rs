//! Query processing module.
//!
//! This module answers free-text prompts against the live snapshot. A query
//! embeds the normalized prompt, scans the snapshot's vector index for the
//! nearest records, and joins each hit to its metadata row by index position.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use paper_search::embedding::fastembed::FastEmbedProvider;
//! use paper_search::query::{QueryService, SearchEngine, SearchQuery};
//! use paper_search::snapshot::SnapshotHandle;
//!
//! # async fn example(handle: Arc<SnapshotHandle>) -> Result<(), Box<dyn std::error::Error>> {
//! let provider = FastEmbedProvider::new(None, None)?;
//! let service = QueryService::new(provider, handle, 100);
//!
//! let query = SearchQuery::new("graph neural networks", Some(5));
//! for result in service.search(&query).await? {
//!     println!("{} - distance: {:.3}", result.title, result.distance);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Queries never mutate shared state: each one clones the current
//! `Arc<Snapshot>` and works on that, so a concurrent build cannot change the
//! index underneath it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error};

use crate::embedding::{normalize_text, EmbeddingProvider};
use crate::index::IndexError;
use crate::models::SearchResult;
use crate::snapshot::{SnapshotHandle, SnapshotManifest};

/// Number of results returned when the caller does not specify `top_k`.
pub const DEFAULT_TOP_K: usize = 5;

/// Errors that can occur during query processing.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Caller error: empty prompt or out-of-range `top_k`
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The live snapshot was built with a different embedding model
    #[error("Snapshot was built with model '{snapshot}' but the active model is '{active}'")]
    ModelVersionMismatch { snapshot: String, active: String },

    /// No snapshot has been built or loaded yet
    #[error("No index snapshot is loaded; run a build first")]
    NoSnapshot,

    /// Index and metadata disagree about a position
    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    /// Prompt embedding failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Index search failed
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
}

/// Result type for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Search query parameters.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// The prompt text (will be normalized and embedded)
    pub prompt: String,

    /// Maximum number of results to return
    pub top_k: usize,
}

impl SearchQuery {
    /// Create a new search query.
    ///
    /// # Arguments
    /// * `prompt` - The search prompt
    /// * `top_k` - Maximum number of results to return (default: 5)
    pub fn new(prompt: impl Into<String>, top_k: Option<usize>) -> Self {
        Self {
            prompt: prompt.into(),
            top_k: top_k.unwrap_or(DEFAULT_TOP_K),
        }
    }
}

/// Trait for search engines.
///
/// Implementations embed the prompt and return the nearest records, closest
/// first.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Execute a search query and return ranked results.
    ///
    /// # Returns
    /// Results sorted by ascending distance; equal distances keep index order
    async fn search(&self, query: &SearchQuery) -> QueryResult<Vec<SearchResult>>;
}

/// Search engine over the live snapshot.
pub struct QueryService<E> {
    provider: E,
    handle: Arc<SnapshotHandle>,
    max_top_k: usize,
}

impl<E: EmbeddingProvider> QueryService<E> {
    /// # Arguments
    /// * `provider` - Embeds prompts; must match the model the snapshot was built with
    /// * `handle` - Pointer to the live snapshot
    /// * `max_top_k` - Largest `top_k` a caller may request
    pub fn new(provider: E, handle: Arc<SnapshotHandle>, max_top_k: usize) -> Self {
        Self {
            provider,
            handle,
            max_top_k,
        }
    }

    /// Convenience wrapper around [`SearchEngine::search`].
    pub async fn query(&self, prompt: &str, top_k: usize) -> QueryResult<Vec<SearchResult>> {
        self.search(&SearchQuery::new(prompt, Some(top_k))).await
    }

    /// Manifest of the live snapshot, if one is loaded.
    pub fn status(&self) -> Option<SnapshotManifest> {
        self.handle.current().map(|s| s.manifest().clone())
    }

    pub fn max_top_k(&self) -> usize {
        self.max_top_k
    }

    pub fn provider(&self) -> &E {
        &self.provider
    }

    fn validate(&self, query: &SearchQuery) -> QueryResult<()> {
        if query.top_k == 0 {
            return Err(QueryError::InvalidArgument(
                "top_k must be at least 1".to_string(),
            ));
        }
        if query.top_k > self.max_top_k {
            return Err(QueryError::InvalidArgument(format!(
                "top_k must be at most {}",
                self.max_top_k
            )));
        }
        if query.prompt.trim().is_empty() {
            return Err(QueryError::InvalidArgument(
                "prompt must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<E: EmbeddingProvider> SearchEngine for QueryService<E> {
    async fn search(&self, query: &SearchQuery) -> QueryResult<Vec<SearchResult>> {
        self.validate(query)?;

        let snapshot = self.handle.current().ok_or(QueryError::NoSnapshot)?;
        if snapshot.embedding_config() != self.provider.config() {
            return Err(QueryError::ModelVersionMismatch {
                snapshot: snapshot.manifest().model_name.clone(),
                active: self.provider.model_name().to_string(),
            });
        }

        let embedding = self
            .provider
            .embed(&normalize_text(&query.prompt))
            .await
            .map_err(|e| QueryError::Embedding(e.to_string()))?;

        let neighbors = snapshot.index().search(&embedding, query.top_k)?;
        debug!(
            generation = snapshot.generation(),
            hits = neighbors.len(),
            "query answered"
        );

        neighbors
            .into_iter()
            .map(|hit| match snapshot.metadata().get(hit.position) {
                Some(row) if row.record_id == hit.record_id => Ok(SearchResult::new(row, hit.distance)),
                Some(row) => {
                    let msg = format!(
                        "position {} is {} in the index but {} in metadata",
                        hit.position, hit.record_id, row.record_id
                    );
                    error!(generation = snapshot.generation(), "{}", msg);
                    Err(QueryError::IndexCorruption(msg))
                }
                None => {
                    let msg = format!("no metadata row for index position {}", hit.position);
                    error!(generation = snapshot.generation(), "{}", msg);
                    Err(QueryError::IndexCorruption(msg))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::VectorIndex;
    use crate::models::RecordMetadata;
    use crate::snapshot::Snapshot;
    use crate::test_support::MockEmbeddingProvider;

    fn metadata(id: &str) -> RecordMetadata {
        RecordMetadata {
            record_id: id.to_string(),
            title: format!("Title {}", id),
            abstract_text: format!("Abstract {}", id),
            url: Some(format!("http://arxiv.org/abs/{}", id)),
        }
    }

    fn snapshot_for(provider: &MockEmbeddingProvider, docs: &[(&str, &str)]) -> Snapshot {
        let mut index = VectorIndex::new(provider.dimension());
        let mut rows = Vec::new();
        for (id, text) in docs {
            index.add(&provider.vector_for(text), *id).unwrap();
            rows.push(metadata(id));
        }
        let manifest = SnapshotManifest {
            generation: "gen-test".to_string(),
            model_name: provider.model_name().to_string(),
            dimension: provider.dimension(),
            count: docs.len(),
            built_at: chrono::Utc::now(),
            excluded: vec![],
        };
        Snapshot::new(manifest, index, rows).unwrap()
    }

    fn service(provider: MockEmbeddingProvider, snapshot: Option<Snapshot>) -> QueryService<MockEmbeddingProvider> {
        let handle = match snapshot {
            Some(s) => SnapshotHandle::with_snapshot(s),
            None => SnapshotHandle::new(),
        };
        QueryService::new(provider, Arc::new(handle), 100)
    }

    #[test]
    fn test_search_query_defaults() {
        let query = SearchQuery::new("transformers", None);
        assert_eq!(query.top_k, DEFAULT_TOP_K);
        assert_eq!(SearchQuery::new("x", Some(9)).top_k, 9);
    }

    #[tokio::test]
    async fn test_query_returns_nearest_with_metadata() {
        let provider = MockEmbeddingProvider::new("mock", 4);
        let snapshot = snapshot_for(
            &provider,
            &[("a", "quantum computing"), ("b", "graph neural networks"), ("c", "protein folding")],
        );
        let service = service(provider, Some(snapshot));

        let results = service.query("Graph  Neural Networks", 2).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].record_id, "b");
        assert_eq!(results[0].title, "Title b");
        assert_eq!(results[0].abstract_text, "Abstract b");
        assert_eq!(results[0].url.as_deref(), Some("http://arxiv.org/abs/b"));
        assert_eq!(results[0].distance, 0.0);
        assert!(results[0].distance <= results[1].distance);
    }

    #[tokio::test]
    async fn test_top_k_beyond_count_returns_everything() {
        let provider = MockEmbeddingProvider::new("mock", 3);
        let snapshot = snapshot_for(&provider, &[("a", "one"), ("b", "two")]);
        let service = service(provider, Some(snapshot));

        assert_eq!(service.query("one", 50).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let provider = MockEmbeddingProvider::new("mock", 3);
        let snapshot = snapshot_for(&provider, &[("a", "one")]);
        let service = service(provider.clone(), Some(snapshot));

        assert!(matches!(service.query("one", 0).await, Err(QueryError::InvalidArgument(_))));
        assert!(matches!(service.query("one", 101).await, Err(QueryError::InvalidArgument(_))));
        assert!(matches!(service.query("   ", 5).await, Err(QueryError::InvalidArgument(_))));
        assert_eq!(provider.calls(), 0, "rejected before embedding");
    }

    #[tokio::test]
    async fn test_no_snapshot() {
        let service = service(MockEmbeddingProvider::new("mock", 3), None);
        assert!(matches!(service.query("anything", 5).await, Err(QueryError::NoSnapshot)));
        assert!(service.status().is_none());
    }

    #[tokio::test]
    async fn test_model_mismatch() {
        let old_model = MockEmbeddingProvider::new("old-model", 3);
        let snapshot = snapshot_for(&old_model, &[("a", "one")]);
        let service = service(MockEmbeddingProvider::new("new-model", 3), Some(snapshot));

        match service.query("one", 1).await {
            Err(QueryError::ModelVersionMismatch { snapshot, active }) => {
                assert_eq!(snapshot, "old-model");
                assert_eq!(active, "new-model");
            }
            other => panic!("Expected ModelVersionMismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_reports_manifest() {
        let provider = MockEmbeddingProvider::new("mock", 3);
        let snapshot = snapshot_for(&provider, &[("a", "one"), ("b", "two")]);
        let service = service(provider, Some(snapshot));

        let status = service.status().unwrap();
        assert_eq!(status.generation, "gen-test");
        assert_eq!(status.count, 2);
    }
}
