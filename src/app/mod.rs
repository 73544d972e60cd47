//! Wiring shared by the binaries.
//!
//! Opens the record store, embedding cache and snapshot directory under the
//! configured data dir and ties them to one index builder and snapshot handle.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::builder::{BuildError, BuildReport, IndexBuilder};
use crate::cache::{CacheError, EmbeddingCache};
use crate::config::AppConfig;
use crate::embedding::fastembed::FastEmbedProvider;
use crate::embedding::pool::EmbeddingPool;
use crate::embedding::{EmbeddingError, EmbeddingProvider};
use crate::query::QueryService;
use crate::snapshot::{SnapshotError, SnapshotHandle, SnapshotReloader, SnapshotStore};
use crate::storage::sqlite::SqliteStorage;
use crate::storage::{RecordStore, StorageError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to open record store: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to open embedding cache: {0}")]
    Cache(#[from] CacheError),

    #[error("failed to load embedding model: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type AppResult<T> = Result<T, AppError>;

/// Embedding stack used in production: fastembed behind a bounded pool.
pub type PooledEmbedder = EmbeddingPool<FastEmbedProvider>;

/// Outcome of the startup consistency check.
#[derive(Debug)]
pub enum Freshness {
    /// The persisted snapshot matches the store and the active model.
    Fresh,
    /// The snapshot is stale and rebuilding was disabled.
    Stale,
    /// A new snapshot was built.
    Rebuilt(BuildReport),
}

/// Open (or create) the record store under `config.data_dir`.
pub async fn open_record_store(config: &AppConfig) -> AppResult<SqliteStorage> {
    let store = SqliteStorage::open(config.records_db())?;
    store.initialize().await?;
    Ok(store)
}

/// Load the configured fastembed model behind a pool of
/// `embedding.workers` permits.
pub async fn load_embedder(config: &AppConfig) -> AppResult<PooledEmbedder> {
    let model = config.embedding.model.clone();
    let cache_dir = config.embedding.resolved_cache_dir();
    let provider = tokio::task::spawn_blocking(move || FastEmbedProvider::from_name(&model, Some(cache_dir)))
        .await
        .map_err(|e| AppError::Task(e.to_string()))??;
    Ok(EmbeddingPool::new(provider, config.embedding.workers))
}

/// Everything needed to build and query the index.
pub struct SearchContext<S, E> {
    pub config: AppConfig,
    pub store: Arc<S>,
    pub embedder: E,
    pub handle: Arc<SnapshotHandle>,
    pub snapshots: SnapshotStore,
    pub builder: Arc<IndexBuilder<S, E>>,
}

impl SearchContext<SqliteStorage, PooledEmbedder> {
    /// Open the production stack described by `config`.
    pub async fn open(config: AppConfig) -> AppResult<Self> {
        let store = open_record_store(&config).await?;
        let embedder = load_embedder(&config).await?;
        Self::open_with(config, store, embedder)
    }
}

impl<S, E> SearchContext<S, E>
where
    S: RecordStore,
    E: EmbeddingProvider + Clone,
{
    /// Assemble a context around an already opened store and embedder.
    pub fn open_with(config: AppConfig, store: S, embedder: E) -> AppResult<Self> {
        let store = Arc::new(store);
        let cache = Arc::new(EmbeddingCache::open(config.embeddings_db(), embedder.clone())?);
        let snapshots = SnapshotStore::open(config.snapshots_dir())?;
        let handle = Arc::new(SnapshotHandle::new());
        let builder = Arc::new(IndexBuilder::new(
            Arc::clone(&store),
            cache,
            snapshots.clone(),
            Arc::clone(&handle),
        ));

        Ok(Self {
            config,
            store,
            embedder,
            handle,
            snapshots,
            builder,
        })
    }

    /// Publish the persisted snapshot, if there is a readable one.
    ///
    /// An unreadable snapshot is logged and treated as absent so that the
    /// next build replaces it.
    pub async fn load_snapshot(&self) -> AppResult<bool> {
        let snapshots = self.snapshots.clone();
        let loaded = tokio::task::spawn_blocking(move || snapshots.load_current())
            .await
            .map_err(|e| AppError::Task(e.to_string()))?;

        match loaded {
            Ok(Some(snapshot)) => {
                info!(generation = snapshot.generation(), count = snapshot.count(), "loaded snapshot");
                self.handle.publish(Arc::new(snapshot));
                Ok(true)
            }
            Ok(None) => {
                info!("no snapshot on disk yet");
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "persisted snapshot is unreadable, treating it as missing");
                Ok(false)
            }
        }
    }

    /// Load the persisted snapshot and rebuild it if it disagrees with the
    /// record store or the active model.
    pub async fn ensure_fresh(&self, rebuild_on_mismatch: bool) -> AppResult<Freshness> {
        self.load_snapshot().await?;

        if !self.builder.is_stale().await? {
            return Ok(Freshness::Fresh);
        }
        if !rebuild_on_mismatch {
            warn!("snapshot is stale and rebuilding is disabled; serving it as is");
            return Ok(Freshness::Stale);
        }

        info!("snapshot is stale, rebuilding");
        Ok(Freshness::Rebuilt(self.builder.build().await?))
    }

    /// A query service over this context's snapshot handle.
    pub fn query_service(&self) -> QueryService<E> {
        QueryService::new(
            self.embedder.clone(),
            Arc::clone(&self.handle),
            self.config.server.max_top_k,
        )
    }

    /// Picks up generations that another process makes current, as long as
    /// they were built with this context's embedding model.
    pub fn reloader(&self) -> SnapshotReloader {
        SnapshotReloader::new(self.snapshots.clone(), Arc::clone(&self.handle), self.embedder.config())
    }
}
