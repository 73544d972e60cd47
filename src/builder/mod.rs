//! Index builder.
//!
//! Turns the record store into a new snapshot generation: every record is run
//! through the embedding cache, the vectors that came back are appended to a
//! fresh index in store order, and index + metadata are persisted together and
//! published. Records whose embedding fails are logged and left out; the
//! build carries on without them.
//!
//! Only one build runs at a time, across processes as well: a build first
//! takes the in-process build lock, then the snapshot root's `LOCK` file.
//! Queries keep using the previous snapshot until the new one is published.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheError, EmbeddingCache};
use crate::embedding::EmbeddingProvider;
use crate::index::{IndexError, VectorIndex};
use crate::models::RecordMetadata;
use crate::snapshot::{
    new_generation, Snapshot, SnapshotError, SnapshotHandle, SnapshotManifest, SnapshotStore, SnapshotWriter,
};
use crate::storage::{RecordStore, StorageError};

#[derive(Debug, Error)]
pub enum BuildError {
    /// Another build, in this process or another, holds the build lock.
    #[error("an index build is already in progress")]
    BuildInProgress,

    #[error("record store error: {0}")]
    Storage(#[from] StorageError),

    #[error("embedding cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("build task failed: {0}")]
    Other(String),
}

pub type BuildResult<T> = Result<T, BuildError>;

/// Summary of one completed build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub generation: String,
    pub records_seen: usize,
    pub indexed: usize,
    pub failed: Vec<String>,
    pub cache_hits: usize,
    pub recomputed: usize,
    pub elapsed_ms: u64,
}

pub struct IndexBuilder<S, E> {
    store: Arc<S>,
    cache: Arc<EmbeddingCache<E>>,
    snapshots: SnapshotStore,
    handle: Arc<SnapshotHandle>,
    build_lock: Mutex<()>,
}

impl<S, E> IndexBuilder<S, E>
where
    S: RecordStore,
    E: EmbeddingProvider,
{
    pub fn new(
        store: Arc<S>,
        cache: Arc<EmbeddingCache<E>>,
        snapshots: SnapshotStore,
        handle: Arc<SnapshotHandle>,
    ) -> Self {
        Self {
            store,
            cache,
            snapshots,
            handle,
            build_lock: Mutex::new(()),
        }
    }

    pub fn handle(&self) -> &Arc<SnapshotHandle> {
        &self.handle
    }

    /// Build, persist and publish a new snapshot from the current store.
    ///
    /// # Errors
    /// `BuildError::BuildInProgress` if another build is running, here or in
    /// another process sharing the snapshot directory. Storage,
    /// cache-database and persist failures abort the build; the previously
    /// published snapshot stays live in that case.
    pub async fn build(&self) -> BuildResult<BuildReport> {
        let _guard = self
            .build_lock
            .try_lock()
            .map_err(|_| BuildError::BuildInProgress)?;
        let writer = match self.snapshots.lock() {
            Ok(writer) => writer,
            Err(SnapshotError::Locked(holder)) => {
                info!(holder = %holder, "snapshot directory is locked by another build");
                return Err(BuildError::BuildInProgress);
            }
            Err(e) => return Err(e.into()),
        };

        let result = self.run_build(writer).await;
        if let Err(e) = &result {
            error!(error = %e, "index build aborted");
        }
        result
    }

    async fn run_build(&self, writer: SnapshotWriter) -> BuildResult<BuildReport> {
        let started = Instant::now();
        let stats_before = self.cache.stats();
        let provider = self.cache.provider();
        let dimension = provider.dimension();
        let model_name = provider.model_name().to_string();

        let records = self.store.get_all_records().await?;
        info!(records = records.len(), model = %model_name, "starting index build");

        let mut index = VectorIndex::with_capacity(dimension, records.len());
        let mut metadata = Vec::with_capacity(records.len());
        let mut failed = Vec::new();

        for record in &records {
            match self.cache.get_or_compute(record).await {
                Ok(vector) => {
                    index.add(&vector, record.id.as_str())?;
                    metadata.push(RecordMetadata::from(record));
                }
                Err(CacheError::EmbeddingFailure { record_id, reason }) => {
                    warn!(record_id = %record_id, reason = %reason, "skipping record that failed to embed");
                    failed.push(record_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let generation = new_generation();
        let manifest = SnapshotManifest {
            generation: generation.clone(),
            model_name,
            dimension,
            count: index.count(),
            built_at: Utc::now(),
            excluded: failed.clone(),
        };
        let snapshot = Arc::new(Snapshot::new(manifest, index, metadata)?);

        let to_persist = Arc::clone(&snapshot);
        tokio::task::spawn_blocking(move || writer.persist(&to_persist))
            .await
            .map_err(|e| BuildError::Other(e.to_string()))??;

        self.handle.publish(Arc::clone(&snapshot));

        let stats_after = self.cache.stats();
        let report = BuildReport {
            generation,
            records_seen: records.len(),
            indexed: snapshot.count(),
            failed,
            cache_hits: stats_after.hits - stats_before.hits,
            recomputed: stats_after.computed - stats_before.computed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            generation = %report.generation,
            indexed = report.indexed,
            failed = report.failed.len(),
            cache_hits = report.cache_hits,
            recomputed = report.recomputed,
            elapsed_ms = report.elapsed_ms,
            "index build complete"
        );
        Ok(report)
    }

    /// Whether the live snapshot no longer reflects the store or the model.
    ///
    /// Stale means: nothing published yet, a different embedding model, or a
    /// record id set that differs from the snapshot's indexed plus excluded ids.
    pub async fn is_stale(&self) -> BuildResult<bool> {
        let Some(snapshot) = self.handle.current() else {
            debug!("no snapshot loaded");
            return Ok(true);
        };

        if snapshot.embedding_config() != self.cache.provider().config() {
            info!(
                snapshot_model = %snapshot.manifest().model_name,
                active_model = %self.cache.provider().model_name(),
                "snapshot was built with a different embedding model"
            );
            return Ok(true);
        }

        let store_ids: HashSet<String> = self.store.list_ids().await?.into_iter().collect();
        let snapshot_ids: HashSet<String> = snapshot
            .index()
            .ids()
            .iter()
            .chain(&snapshot.manifest().excluded)
            .cloned()
            .collect();

        if store_ids != snapshot_ids {
            warn!(
                store = store_ids.len(),
                snapshot = snapshot_ids.len(),
                generation = snapshot.generation(),
                "snapshot ids disagree with the record store"
            );
            return Ok(true);
        }
        Ok(false)
    }
}
