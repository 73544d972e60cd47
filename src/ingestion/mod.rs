//! Ingestion pipeline module.
//!
//! This module pulls raw payloads from a [`PaperFeed`], validates them into
//! canonical [`Record`]s and appends them to the record store. It does not
//! embed anything; embeddings are computed later by the index builder.
//!
//! # Usage
//!
//! ```ignore
//! use paper_search::ingestion::{IngestionPipeline, RetryPolicy};
//! use paper_search::provider::json::JsonFileFeed;
//! use paper_search::storage::sqlite::SqliteStorage;
//!
//! let store = Arc::new(SqliteStorage::open("data/records.db")?);
//! let pipeline = IngestionPipeline::new(store, 100, RetryPolicy::default());
//!
//! let feed = JsonFileFeed::from_file("papers.json").await?;
//! let stats = pipeline.ingest_from_feed(&feed, None).await?;
//! println!("Inserted: {}, Duplicates: {}", stats.inserted, stats.duplicates_skipped);
//! ```
//!
//! The pipeline:
//! - Fetches the feed page by page, retrying transient failures a bounded
//!   number of times with a fixed delay
//! - Skips a page that still fails and moves on to the next one
//! - Skips payloads that are missing required fields, logging the reason
//! - Treats a record id that is already stored as a no-op

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{RawRecord, Record};
use crate::provider::{PaperFeed, ProviderError, ProviderResult};
use crate::storage::{RecordStore, StorageError};

/// Consecutive skipped pages after which a feed of unknown length is
/// considered unavailable.
const MAX_CONSECUTIVE_SKIPS: usize = 3;

/// Errors that can occur during ingestion.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Storage operation failed
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    /// Provider operation failed
    #[error("Provider error: {0}")]
    ProviderError(#[from] ProviderError),

    /// The feed kept failing and ingestion gave up
    #[error("Feed unavailable: {0}")]
    FeedUnavailable(String),
}

/// Result type for ingestion operations.
pub type IngestionResult<T> = Result<T, IngestionError>;

/// Why a raw payload could not become a record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Collapse line breaks and runs of whitespace into single spaces.
fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, ParseError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ParseError::MissingField(field)),
    }
}

/// Validate a raw feed payload into a canonical record.
///
/// `id`, `title` and `summary` must be present and non-blank. The record id is
/// the part of the entry id after `/abs/` (the whole entry id when it has no
/// such segment), and the full entry id is kept as the URL. Title and summary
/// are collapsed onto one line. Authors are comma-joined.
pub fn parse_record(raw: &RawRecord) -> Result<Record, ParseError> {
    let entry_id = required(&raw.id, "id")?;
    let title = clean_text(required(&raw.title, "title")?);
    let summary = clean_text(required(&raw.summary, "summary")?);

    let id = match entry_id.rsplit_once("/abs/") {
        Some((_, suffix)) => suffix.trim(),
        None => entry_id,
    };
    if id.is_empty() {
        return Err(ParseError::InvalidField {
            field: "id",
            reason: format!("no identifier after '/abs/' in '{}'", entry_id),
        });
    }

    let authors = raw
        .author
        .as_ref()
        .map(|a| a.names().join(", "))
        .filter(|joined| !joined.is_empty());

    Ok(Record {
        id: id.to_string(),
        title,
        text: summary,
        url: Some(entry_id.to_string()),
        authors,
        published: raw
            .published
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string),
    })
}

/// Fixed-delay retry with a bounded number of attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Only transient errors are
    /// retried.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> ProviderResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(attempt, max_attempts = self.max_attempts, error = %e, "request failed, retrying");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Statistics from an ingestion run.
///
/// This struct tracks the outcomes of processing feed payloads.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionStats {
    /// Total number of payloads processed
    pub total_processed: usize,

    /// Number of records newly stored
    pub inserted: usize,

    /// Number of payloads whose id was already stored
    pub duplicates_skipped: usize,

    /// Number of payloads rejected by the parser
    pub invalid: usize,

    /// Number of records the store failed to write
    pub failed: usize,

    /// Number of feed pages skipped after exhausting retries
    pub batches_skipped: usize,
}

impl IngestionStats {
    /// Create new empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful insertion.
    pub fn record_inserted(&mut self) {
        self.total_processed += 1;
        self.inserted += 1;
    }

    /// Record a duplicate that was skipped.
    pub fn record_duplicate(&mut self) {
        self.total_processed += 1;
        self.duplicates_skipped += 1;
    }

    /// Record a payload the parser rejected.
    pub fn record_invalid(&mut self) {
        self.total_processed += 1;
        self.invalid += 1;
    }

    /// Record a failed store write.
    pub fn record_failed(&mut self) {
        self.total_processed += 1;
        self.failed += 1;
    }
}

/// Ingestion pipeline coordinator.
pub struct IngestionPipeline<S> {
    store: Arc<S>,

    /// Payloads requested per feed page
    batch_size: usize,

    retry: RetryPolicy,

    /// Pause between pages, to stay polite with remote feeds
    batch_pause: Duration,
}

impl<S: RecordStore> IngestionPipeline<S> {
    /// # Arguments
    /// * `store` - Record store receiving parsed records
    /// * `batch_size` - Payloads requested per feed page (minimum one)
    /// * `retry` - Retry policy for feed requests
    pub fn new(store: Arc<S>, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            retry,
            batch_pause: Duration::ZERO,
        }
    }

    pub fn with_batch_pause(mut self, pause: Duration) -> Self {
        self.batch_pause = pause;
        self
    }

    /// Parse and store one page of payloads, updating `stats`.
    pub async fn ingest_batch(&self, payloads: &[RawRecord], stats: &mut IngestionStats) {
        let before = stats.inserted;
        for raw in payloads {
            let record = match parse_record(raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!(entry = raw.id.as_deref().unwrap_or("<none>"), reason = %e, "skipping payload");
                    stats.record_invalid();
                    continue;
                }
            };

            match self.store.insert_record(&record).await {
                Ok(true) => stats.record_inserted(),
                Ok(false) => {
                    debug!(record_id = %record.id, "record already stored, skipping");
                    stats.record_duplicate();
                }
                Err(e) => {
                    warn!(record_id = %record.id, error = %e, "failed to store record");
                    stats.record_failed();
                }
            }
        }
        info!(new = stats.inserted - before, "saved batch");
    }

    /// Ingest every payload of `feed`, or the first `limit` of them.
    pub async fn ingest_from_feed<F>(&self, feed: &F, limit: Option<usize>) -> IngestionResult<IngestionStats>
    where
        F: PaperFeed + ?Sized,
    {
        self.ingest_from_feed_with(feed, limit, |_| {}).await
    }

    /// Like [`ingest_from_feed`](Self::ingest_from_feed), calling `on_batch`
    /// with the running totals after each page.
    pub async fn ingest_from_feed_with<F, P>(
        &self,
        feed: &F,
        limit: Option<usize>,
        mut on_batch: P,
    ) -> IngestionResult<IngestionStats>
    where
        F: PaperFeed + ?Sized,
        P: FnMut(&IngestionStats),
    {
        let known_total = feed.count_records().await?;
        let end = match (limit, known_total) {
            (Some(limit), Some(total)) => Some(limit.min(total)),
            (limit, total) => limit.or(total),
        };
        info!(feed = feed.name(), end = ?end, batch_size = self.batch_size, "starting ingestion");

        let mut stats = IngestionStats::new();
        let mut start = 0;
        let mut consecutive_skips = 0;

        loop {
            let page_size = match end {
                Some(end) if start >= end => break,
                Some(end) => self.batch_size.min(end - start),
                None => self.batch_size,
            };

            let page = self
                .retry
                .run(|attempt| {
                    debug!(start, page_size, attempt, "requesting page");
                    feed.fetch_batch(start, page_size)
                })
                .await;

            match page {
                Ok(payloads) if payloads.is_empty() => break,
                Ok(payloads) => {
                    consecutive_skips = 0;
                    self.ingest_batch(&payloads, &mut stats).await;
                }
                Err(e) => {
                    warn!(start, error = %e, "giving up on page, skipping it");
                    stats.batches_skipped += 1;
                    consecutive_skips += 1;
                    if end.is_none() && consecutive_skips >= MAX_CONSECUTIVE_SKIPS {
                        return Err(IngestionError::FeedUnavailable(format!(
                            "{} consecutive pages failed, last error: {}",
                            consecutive_skips, e
                        )));
                    }
                }
            }

            on_batch(&stats);
            start += page_size;
            if !self.batch_pause.is_zero() {
                tokio::time::sleep(self.batch_pause).await;
            }
        }

        info!(
            inserted = stats.inserted,
            duplicates = stats.duplicates_skipped,
            invalid = stats.invalid,
            failed = stats.failed,
            batches_skipped = stats.batches_skipped,
            "finished ingestion"
        );
        Ok(stats)
    }
}
