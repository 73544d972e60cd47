//! Core data models for the paper search system.
//!
//! This module contains the fundamental data structures used across the application,
//! including canonical records, raw feed payloads, per-position metadata rows and
//! search results.

use serde::{Deserialize, Serialize};

/// A canonical paper record as held by the record store.
///
/// Records are immutable once stored: re-ingesting the same `id` is a no-op.
/// Only `text` participates in embedding; the remaining fields are metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Stable unique identifier (e.g. an arXiv id such as `2101.00001v1`)
    pub id: String,

    /// Paper title
    pub title: String,

    /// Abstract text, the input to the embedding model
    pub text: String,

    /// Link to the paper's landing page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Comma-joined author names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<String>,

    /// Publication timestamp as reported by the feed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
}

impl Record {
    /// Create a record with only the required fields set.
    pub fn new(id: impl Into<String>, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            text: text.into(),
            url: None,
            authors: None,
            published: None,
        }
    }

    /// Attach a URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// One author entry of a raw feed payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawAuthor {
    #[serde(default)]
    pub name: Option<String>,
}

/// The feed reports a single author as an object and several as a list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawAuthors {
    One(RawAuthor),
    Many(Vec<RawAuthor>),
}

impl RawAuthors {
    /// Author names in feed order, skipping entries without a name.
    pub fn names(&self) -> Vec<&str> {
        let authors: &[RawAuthor] = match self {
            RawAuthors::One(author) => std::slice::from_ref(author),
            RawAuthors::Many(authors) => authors,
        };
        authors
            .iter()
            .filter_map(|a| a.name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect()
    }
}

/// An unvalidated payload as delivered by the external feed.
///
/// Every field is optional here; `ingestion::parse_record` performs the
/// presence checks that turn a payload into a [`Record`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawRecord {
    /// Entry id, usually the full abstract URL (`http://arxiv.org/abs/<id>`)
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub summary: Option<String>,

    #[serde(default)]
    pub author: Option<RawAuthors>,

    #[serde(default)]
    pub published: Option<String>,
}

/// Metadata row stored alongside the vector index.
///
/// Row `i` of the metadata table describes the record whose vector sits at
/// position `i` of the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordMetadata {
    pub record_id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl From<&Record> for RecordMetadata {
    fn from(record: &Record) -> Self {
        Self {
            record_id: record.id.clone(),
            title: record.title.clone(),
            abstract_text: record.text.clone(),
            url: record.url.clone(),
        }
    }
}

/// A single ranked hit returned by the query service.
///
/// Lower `distance` means more similar; results are ordered ascending by
/// distance with ties broken by index position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub record_id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub url: Option<String>,

    /// Squared Euclidean distance between prompt and record embeddings
    pub distance: f32,
}

impl SearchResult {
    /// Create a search result from a metadata row and its distance.
    pub fn new(metadata: &RecordMetadata, distance: f32) -> Self {
        Self {
            record_id: metadata.record_id.clone(),
            title: metadata.title.clone(),
            abstract_text: metadata.abstract_text.clone(),
            url: metadata.url.clone(),
            distance,
        }
    }
}

/// Identity of the embedding model.
///
/// Stored in every snapshot manifest so that query-time embeddings are only
/// compared against vectors produced by the same model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbeddingConfig {
    /// Name/identifier of the embedding model (e.g. "AllMiniLML6V2")
    pub model_name: String,

    /// Dimension of the embedding vectors
    pub dimension: usize,
}
