//! Bounded concurrency for embedding calls.
//!
//! Query handlers and index builds share one model. `EmbeddingPool` caps the
//! number of in-flight embedding calls with a semaphore so a burst of slow
//! requests queues here instead of occupying every runtime worker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{EmbeddingError, EmbeddingProvider, EmbeddingResult};

/// An `EmbeddingProvider` wrapper that admits at most `workers` concurrent calls.
pub struct EmbeddingPool<E> {
    inner: Arc<E>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl<E> Clone for EmbeddingPool<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            permits: Arc::clone(&self.permits),
            workers: self.workers,
        }
    }
}

impl<E: EmbeddingProvider> EmbeddingPool<E> {
    /// Wrap `provider`, allowing `workers` concurrent calls (minimum one).
    pub fn new(provider: E, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            inner: Arc::new(provider),
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    /// Configured number of concurrent workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Permits not currently held by a running call.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[async_trait]
impl<E: EmbeddingProvider> EmbeddingProvider for EmbeddingPool<E> {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| EmbeddingError::WorkerUnavailable(e.to_string()))?;
        self.inner.embed(text).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}
