//! Paper feed module.
//!
//! This module defines the interface for sourcing raw paper payloads from an
//! external feed and includes a file-backed implementation.
//!
//! The `PaperFeed` trait abstracts the source of paper data so the ingestion
//! pipeline can work with different backends without coupling to them.
//!
//! # Design Notes
//!
//! - Feeds are paginated: callers ask for `max_results` payloads starting at an
//!   offset, and an empty page means the feed is exhausted
//! - Delivery is at-least-once; the same id may show up in several pages.
//!   Deduplication happens in the record store
//! - Payloads are unvalidated; `ingestion::parse_record` does the checking

use async_trait::async_trait;
use thiserror::Error;

use crate::models::RawRecord;

pub mod json;

/// Errors that can occur when fetching payloads from a feed.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Failed to read from the data source
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse the data format
    #[error("Parse error: {0}")]
    ParseError(String),

    /// API rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Network or connection error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Other provider-specific errors
    #[error("Provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::IoError(_)
                | ProviderError::RateLimitExceeded(_)
                | ProviderError::NetworkError(_)
        )
    }
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// A paginated source of raw paper payloads.
#[async_trait]
pub trait PaperFeed: Send + Sync {
    /// Fetch up to `max_results` payloads starting at offset `start`.
    ///
    /// # Returns
    /// The payloads of this page; empty once the feed is exhausted
    ///
    /// # Errors
    /// Returns `ProviderError` if the page cannot be fetched or decoded
    async fn fetch_batch(&self, start: usize, max_results: usize) -> ProviderResult<Vec<RawRecord>>;

    /// Total number of payloads, if the feed knows it.
    ///
    /// Used for progress reporting only.
    async fn count_records(&self) -> ProviderResult<Option<usize>> {
        Ok(None)
    }

    /// Get a human-readable name/description of this feed.
    fn name(&self) -> &str;
}
