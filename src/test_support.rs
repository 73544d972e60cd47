//! Mocks shared by unit tests across modules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::embedding::{EmbeddingError, EmbeddingProvider, EmbeddingResult};
use crate::models::Record;
use crate::storage::{RecordStore, StorageError, StorageResult};

/// Deterministic embedding provider.
///
/// Each byte of the text adds to component `i % dimension`, so identical text
/// always maps to the same vector and a query equal to a record's text lands
/// at distance zero from it.
#[derive(Clone)]
pub struct MockEmbeddingProvider {
    model_name: String,
    dimension: usize,
    calls: Arc<AtomicUsize>,
    fail_on: Option<String>,
    delay: Option<Duration>,
}

impl MockEmbeddingProvider {
    pub fn new(model_name: &str, dimension: usize) -> Self {
        Self {
            model_name: model_name.to_string(),
            dimension,
            calls: Arc::new(AtomicUsize::new(0)),
            fail_on: None,
            delay: None,
        }
    }

    /// Fail any text containing `needle`.
    pub fn fail_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    /// Sleep before answering, to keep a build in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % self.dimension] += byte as f32 / 100.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(needle) = &self.fail_on {
            if text.contains(needle.as_str()) {
                return Err(EmbeddingError::InvalidInput(format!("refusing '{}'", text)));
            }
        }
        Ok(self.vector_for(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// In-memory record store.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<Record>>,
    fail_reads: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Record>) -> Self {
        Self {
            records: Mutex::new(records),
            fail_reads: Mutex::new(false),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        *self.fail_reads.lock() = fail;
    }

    pub fn push(&self, record: Record) {
        self.records.lock().push(record);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn initialize(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn insert_record(&self, record: &Record) -> StorageResult<bool> {
        let mut records = self.records.lock();
        if records.iter().any(|r| r.id == record.id) {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }

    async fn contains(&self, id: &str) -> StorageResult<bool> {
        Ok(self.records.lock().iter().any(|r| r.id == id))
    }

    async fn get_all_records(&self) -> StorageResult<Vec<Record>> {
        if *self.fail_reads.lock() {
            return Err(StorageError::ConnectionError("mock store offline".to_string()));
        }
        Ok(self.records.lock().clone())
    }

    async fn get_record(&self, id: &str) -> StorageResult<Record> {
        self.records
            .lock()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn count_records(&self) -> StorageResult<usize> {
        Ok(self.records.lock().len())
    }
}

pub fn record(id: &str, text: &str) -> Record {
    Record::new(id, format!("Title {}", id), text).with_url(format!("http://arxiv.org/abs/{}", id))
}
