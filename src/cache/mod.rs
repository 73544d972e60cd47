//! Persistent embedding cache.
//!
//! Maps a record id to its embedding vector, tagged with the model that
//! produced it and a SHA-256 hash of the normalized text it was computed from.
//! A cached vector is reused only while both tags still match; otherwise the
//! record is re-embedded and the entry overwritten.
//!
//! Entries live in their own SQLite database so they survive restarts
//! independently of the snapshot files. Vectors are stored as little-endian
//! `f32` BLOBs.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::embedding::{normalize_text, EmbeddingProvider};
use crate::models::Record;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS embeddings (
    record_id     TEXT PRIMARY KEY,
    model_version TEXT NOT NULL,
    text_hash     TEXT NOT NULL,
    dimension     INTEGER NOT NULL,
    vector        BLOB NOT NULL,
    updated_at    TEXT NOT NULL
);
";

/// Errors raised by the embedding cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The model could not embed this record. Recoverable: the index builder
    /// skips the record and carries on.
    #[error("embedding failed for record {record_id}: {reason}")]
    EmbeddingFailure { record_id: String, reason: String },

    /// The cache database could not be read or written.
    #[error("embedding cache database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Database(err.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// A cache row as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingEntry {
    pub record_id: String,
    pub vector: Vec<f32>,
    pub model_version: String,
    pub text_hash: String,
}

/// Hit/miss counters since the cache was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub computed: usize,
}

/// SHA-256 of the normalized text, hex encoded.
pub fn text_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(normalize_text(text).as_bytes()))
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

/// Embedding cache in front of an `EmbeddingProvider`.
pub struct EmbeddingCache<E> {
    provider: E,
    conn: Mutex<Connection>,
    hits: AtomicUsize,
    computed: AtomicUsize,
}

impl<E: EmbeddingProvider> EmbeddingCache<E> {
    /// Open (or create) a cache database at `path`.
    pub fn open(path: impl AsRef<Path>, provider: E) -> CacheResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CacheError::Database(e.to_string()))?;
            }
        }
        Self::from_connection(Connection::open(path)?, provider)
    }

    /// Open a private in-memory cache.
    pub fn open_in_memory(provider: E) -> CacheResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, provider)
    }

    fn from_connection(conn: Connection, provider: E) -> CacheResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            provider,
            conn: Mutex::new(conn),
            hits: AtomicUsize::new(0),
            computed: AtomicUsize::new(0),
        })
    }

    /// The provider used for cache misses.
    pub fn provider(&self) -> &E {
        &self.provider
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            computed: self.computed.load(Ordering::Relaxed),
        }
    }

    /// Number of stored entries, stale ones included.
    pub fn len(&self) -> CacheResult<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Fetch the stored entry for a record, whether or not it is current.
    pub fn get(&self, record_id: &str) -> CacheResult<Option<EmbeddingEntry>> {
        let row: Option<(String, String, Vec<u8>)> = self
            .conn
            .lock()
            .query_row(
                "SELECT model_version, text_hash, vector FROM embeddings WHERE record_id = ?1",
                params![record_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        Ok(row.and_then(|(model_version, text_hash, blob)| {
            decode_vector(&blob).map(|vector| EmbeddingEntry {
                record_id: record_id.to_string(),
                vector,
                model_version,
                text_hash,
            })
        }))
    }

    /// Return the embedding for `record`, computing and storing it on a miss.
    ///
    /// A stored vector is reused only when it was produced by the active model
    /// from text with the same hash. Anything else, including an unreadable
    /// BLOB or a vector of the wrong length, counts as a miss and is overwritten.
    ///
    /// # Errors
    /// `CacheError::EmbeddingFailure` when the record has no text, the
    /// provider fails or returns a vector of the wrong dimension;
    /// `CacheError::Database` when the cache cannot be written.
    pub async fn get_or_compute(&self, record: &Record) -> CacheResult<Vec<f32>> {
        let model_version = self.provider.model_name().to_string();
        let dimension = self.provider.dimension();
        let hash = text_hash(&record.text);

        if let Some(entry) = self.get(&record.id)? {
            if entry.model_version == model_version
                && entry.text_hash == hash
                && entry.vector.len() == dimension
            {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.vector);
            }
            debug!(record_id = %record.id, "cached embedding is stale");
        }

        let normalized = normalize_text(&record.text);
        if normalized.is_empty() {
            return Err(CacheError::EmbeddingFailure {
                record_id: record.id.clone(),
                reason: "record text is empty".to_string(),
            });
        }

        let vector = self
            .provider
            .embed(&normalized)
            .await
            .map_err(|e| CacheError::EmbeddingFailure {
                record_id: record.id.clone(),
                reason: e.to_string(),
            })?;
        if vector.len() != dimension {
            return Err(CacheError::EmbeddingFailure {
                record_id: record.id.clone(),
                reason: format!("model returned {} values, expected {}", vector.len(), dimension),
            });
        }

        self.put(&EmbeddingEntry {
            record_id: record.id.clone(),
            vector: vector.clone(),
            model_version,
            text_hash: hash,
        })?;
        self.computed.fetch_add(1, Ordering::Relaxed);

        Ok(vector)
    }

    /// Insert or overwrite an entry.
    pub fn put(&self, entry: &EmbeddingEntry) -> CacheResult<()> {
        let result = self.conn.lock().execute(
            "INSERT INTO embeddings (record_id, model_version, text_hash, dimension, vector, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(record_id) DO UPDATE SET
                model_version = excluded.model_version,
                text_hash = excluded.text_hash,
                dimension = excluded.dimension,
                vector = excluded.vector,
                updated_at = excluded.updated_at",
            params![
                entry.record_id,
                entry.model_version,
                entry.text_hash,
                entry.vector.len() as i64,
                encode_vector(&entry.vector),
                chrono::Utc::now().to_rfc3339()
            ],
        );
        if let Err(e) = &result {
            warn!(record_id = %entry.record_id, error = %e, "failed to persist embedding");
        }
        result?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockEmbeddingProvider;

    fn provider(model_name: &str) -> MockEmbeddingProvider {
        MockEmbeddingProvider::new(model_name, 3).fail_on("unembeddable")
    }

    #[test]
    fn test_vector_blob_encoding() {
        let vector = vec![1.0_f32, -0.5, f32::MIN_POSITIVE, 3.25e7];
        let bytes = encode_vector(&vector);
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode_vector(&bytes).unwrap(), vector);
        assert!(decode_vector(&bytes[..5]).is_none());
    }

    #[test]
    fn test_text_hash_ignores_whitespace_and_case() {
        assert_eq!(text_hash("Deep  Learning\n"), text_hash("deep learning"));
        assert_ne!(text_hash("deep learning"), text_hash("shallow learning"));
    }

    #[tokio::test]
    async fn test_second_call_is_a_hit() {
        let provider = provider("model-a");
        let cache = EmbeddingCache::open_in_memory(provider.clone()).unwrap();
        let record = Record::new("1", "Title", "Some abstract text");

        let first = cache.get_or_compute(&record).await.unwrap();
        let second = cache.get_or_compute(&record).await.unwrap();

        let first_bits: Vec<u32> = first.iter().map(|v| v.to_bits()).collect();
        let second_bits: Vec<u32> = second.iter().map(|v| v.to_bits()).collect();
        assert_eq!(first_bits, second_bits);
        assert_eq!(provider.calls(), 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, computed: 1 });
    }

    #[tokio::test]
    async fn test_changed_text_recomputes() {
        let provider = provider("model-a");
        let cache = EmbeddingCache::open_in_memory(provider.clone()).unwrap();

        cache
            .get_or_compute(&Record::new("1", "T", "original text"))
            .await
            .unwrap();
        let updated = cache
            .get_or_compute(&Record::new("1", "T", "A revised, longer abstract"))
            .await
            .unwrap();

        assert_eq!(provider.calls(), 2);
        assert_eq!(updated, provider.vector_for("a revised, longer abstract"));
        assert_eq!(cache.len().unwrap(), 1, "entry is overwritten, not duplicated");
    }

    #[tokio::test]
    async fn test_model_change_recomputes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.db");
        let record = Record::new("1", "T", "shared text");

        {
            let cache = EmbeddingCache::open(&path, provider("model-a")).unwrap();
            cache.get_or_compute(&record).await.unwrap();
        }

        let provider_b = provider("model-b");
        let cache = EmbeddingCache::open(&path, provider_b.clone()).unwrap();
        cache.get_or_compute(&record).await.unwrap();

        assert_eq!(provider_b.calls(), 1);
        assert_eq!(cache.get("1").unwrap().unwrap().model_version, "model-b");
    }

    #[tokio::test]
    async fn test_dimension_change_recomputes() {
        let record = Record::new("1", "T", "shared text");
        let cache = EmbeddingCache::open_in_memory(MockEmbeddingProvider::new("m", 4)).unwrap();
        cache
            .put(&EmbeddingEntry {
                record_id: "1".into(),
                vector: vec![0.0; 3],
                model_version: "m".into(),
                text_hash: text_hash("shared text"),
            })
            .unwrap();

        let vector = cache.get_or_compute(&record).await.unwrap();
        assert_eq!(vector.len(), 4);
        assert_eq!(cache.stats().computed, 1);
    }

    #[tokio::test]
    async fn test_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.db");
        let record = Record::new("1", "T", "durable text");

        let original = {
            let cache = EmbeddingCache::open(&path, provider("model-a")).unwrap();
            cache.get_or_compute(&record).await.unwrap()
        };

        let provider = provider("model-a");
        let cache = EmbeddingCache::open(&path, provider.clone()).unwrap();
        let reloaded = cache.get_or_compute(&record).await.unwrap();

        assert_eq!(original, reloaded);
        assert_eq!(provider.calls(), 0, "no recomputation after restart");
    }

    #[tokio::test]
    async fn test_embedding_failure_is_tagged_with_record_id() {
        let cache = EmbeddingCache::open_in_memory(provider("m")).unwrap();

        match cache
            .get_or_compute(&Record::new("bad-1", "T", "unembeddable text"))
            .await
        {
            Err(CacheError::EmbeddingFailure { record_id, .. }) => assert_eq!(record_id, "bad-1"),
            other => panic!("Expected EmbeddingFailure, got {:?}", other),
        }
        assert!(cache.get("bad-1").unwrap().is_none(), "failures are not cached");
    }

    #[tokio::test]
    async fn test_empty_text_fails_without_calling_model() {
        let provider = provider("m");
        let cache = EmbeddingCache::open_in_memory(provider.clone()).unwrap();

        let result = cache.get_or_compute(&Record::new("empty", "T", "  \n ")).await;
        assert!(matches!(result, Err(CacheError::EmbeddingFailure { .. })));
        assert_eq!(provider.calls(), 0);
    }
}
