//! Record store abstraction and implementations.
//!
//! This module defines the interface for persisting and retrieving canonical
//! paper records. The abstraction keeps the ingestion pipeline and the index
//! builder independent of the concrete backend.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Record;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution error
    #[error("Query execution failed: {0}")]
    QueryError(String),

    /// Schema or migration error
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::QueryError(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for record storage backends.
///
/// Records are keyed by their stable `id` and kept in insertion order. The
/// store is append-only: inserting an id that already exists leaves the stored
/// record untouched.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Initialize the storage (create tables, indexes, etc.).
    ///
    /// This should be idempotent and safe to call multiple times.
    async fn initialize(&self) -> StorageResult<()>;

    /// Insert a record unless its id is already present.
    ///
    /// # Returns
    /// `true` if the record was newly stored, `false` if the id already existed
    async fn insert_record(&self, record: &Record) -> StorageResult<bool>;

    /// Check whether a record with the given id exists.
    async fn contains(&self, id: &str) -> StorageResult<bool>;

    /// Retrieve all records in insertion order.
    ///
    /// The index builder relies on this order being stable across calls.
    async fn get_all_records(&self) -> StorageResult<Vec<Record>>;

    /// Get a record by its id.
    ///
    /// # Errors
    /// Returns `StorageError::NotFound` if the record doesn't exist
    async fn get_record(&self, id: &str) -> StorageResult<Record>;

    /// Get the total count of records in storage.
    async fn count_records(&self) -> StorageResult<usize>;

    /// All record ids in insertion order.
    async fn list_ids(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .get_all_records()
            .await?
            .into_iter()
            .map(|record| record.id)
            .collect())
    }
}
