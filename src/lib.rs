//! Paper Search - semantic search over research paper abstracts.
//!
//! This library keeps a record store, a persisted embedding cache and an exact
//! vector index consistent with each other, and answers nearest-neighbor
//! queries over free-text prompts.
//!
//! # Architecture
//!
//! The system is organized into several key modules:
//!
//! - **models**: Core data structures (Record, RawRecord, SearchResult, etc.)
//! - **provider**: Paginated feeds of raw paper payloads
//! - **ingestion**: Feed → record store pipeline with validation and retries
//! - **storage**: Record store (SQLite-based)
//! - **embedding**: Text embedding generation, normalization and the worker pool
//! - **cache**: Persistent record id → embedding cache
//! - **index**: Brute-force vector index
//! - **snapshot**: Persisted index generations and the live snapshot pointer
//! - **builder**: Store → cache → index → snapshot orchestration
//! - **query**: Prompt embedding, search and metadata join
//! - **server**: HTTP query API
//! - **config** / **logging** / **app**: Settings, tracing setup and wiring
//!
//! # Workflow
//!
//! ## Ingestion
//!
//! 1. Page through a feed of raw payloads
//! 2. Validate each payload into a record
//! 3. Append new records to the store; known ids are no-ops
//!
//! ## Index build
//!
//! 1. Read all records in insertion order
//! 2. Fetch or compute each embedding through the cache
//! 3. Write index, metadata and manifest as a new generation
//! 4. Atomically switch `CURRENT` and publish the snapshot
//!
//! ## Query
//!
//! 1. Normalize and embed the prompt
//! 2. Scan the live snapshot for the `top_k` nearest vectors
//! 3. Join hits to metadata by index position
//!
//! # Example
//!
//! ```ignore
//! use paper_search::{app::SearchContext, config::ConfigLoader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load(None)?;
//!     let ctx = SearchContext::open(config).await?;
//!     ctx.ensure_fresh(true).await?;
//!
//!     for result in ctx.query_service().query("deep learning", 5).await? {
//!         println!("{}: {}", result.title, result.distance);
//!     }
//!     Ok(())
//! }
//! ```

// Public modules
pub mod app;
pub mod builder;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod index;
pub mod ingestion;
pub mod logging;
pub mod models;
pub mod provider;
pub mod query;
pub mod server;
pub mod snapshot;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types at the crate root
pub use embedding::EmbeddingProvider;
pub use models::{EmbeddingConfig, RawRecord, Record, RecordMetadata, SearchResult};
pub use query::{SearchEngine, SearchQuery};
pub use storage::RecordStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
