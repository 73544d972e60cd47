//! SQLite storage implementation.
//!
//! This module provides a SQLite-based implementation of the `RecordStore` trait
//! using rusqlite. Insertion order is captured by an autoincrement `seq` column,
//! which is what `get_all_records` sorts on.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{RecordStore, StorageError, StorageResult};
use crate::models::Record;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS papers (
    seq       INTEGER PRIMARY KEY AUTOINCREMENT,
    id        TEXT NOT NULL UNIQUE,
    title     TEXT NOT NULL,
    summary   TEXT NOT NULL,
    url       TEXT,
    authors   TEXT,
    published TEXT
);
";

/// SQLite-based record storage.
///
/// The connection sits behind a mutex; every call holds it only for the
/// duration of one statement batch and never across an await point.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) a database file and ensure the schema exists.
    ///
    /// # Errors
    /// Returns `StorageError::ConnectionError` if the file cannot be opened
    pub fn open(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
            }
        }
        let conn = Connection::open(db_path)
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> StorageResult<()> {
        self.conn
            .lock()
            .execute_batch(SCHEMA_SQL)
            .map_err(|e| StorageError::SchemaError(e.to_string()))
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Record> {
        Ok(Record {
            id: row.get(0)?,
            title: row.get(1)?,
            text: row.get(2)?,
            url: row.get(3)?,
            authors: row.get(4)?,
            published: row.get(5)?,
        })
    }
}

#[async_trait]
impl RecordStore for SqliteStorage {
    async fn initialize(&self) -> StorageResult<()> {
        self.create_schema()
    }

    async fn insert_record(&self, record: &Record) -> StorageResult<bool> {
        let changed = self.conn.lock().execute(
            "INSERT OR IGNORE INTO papers (id, title, summary, url, authors, published)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.title,
                record.text,
                record.url,
                record.authors,
                record.published
            ],
        )?;
        Ok(changed == 1)
    }

    async fn contains(&self, id: &str) -> StorageResult<bool> {
        let found: Option<i64> = self
            .conn
            .lock()
            .query_row("SELECT 1 FROM papers WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    async fn get_all_records(&self) -> StorageResult<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, summary, url, authors, published FROM papers ORDER BY seq",
        )?;
        let records = stmt
            .query_map([], Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn get_record(&self, id: &str) -> StorageResult<Record> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, title, summary, url, authors, published FROM papers WHERE id = ?1",
                params![id],
                Self::row_to_record,
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn count_records(&self) -> StorageResult<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM papers", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    async fn list_ids(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM papers ORDER BY seq")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}
