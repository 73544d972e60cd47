//! JSON file feed.
//!
//! Reads raw payloads from a local JSON file. Two layouts are accepted:
//!
//! - a plain array of entries: `[{"id": ..., "title": ..., ...}, ...]`
//! - an Atom-style export: `{"feed": {"entry": [...]}}`, where `entry` may
//!   also be a single object when the feed held one paper

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{PaperFeed, ProviderError, ProviderResult};
use crate::models::RawRecord;

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<RawRecord>),
    One(Box<RawRecord>),
}

#[derive(Deserialize)]
struct FeedBody {
    #[serde(default)]
    entry: Option<OneOrMany>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FeedDocument {
    Entries(Vec<RawRecord>),
    Atom { feed: FeedBody },
}

/// Feed over the entries of a JSON file, loaded once.
#[derive(Debug, Clone)]
pub struct JsonFileFeed {
    name: String,
    entries: Vec<RawRecord>,
}

impl JsonFileFeed {
    /// Load and decode `path`.
    ///
    /// # Errors
    /// `ProviderError::IoError` if the file cannot be read,
    /// `ProviderError::ParseError` if it is not one of the accepted layouts
    pub async fn from_file(path: impl AsRef<Path>) -> ProviderResult<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let contents = tokio::fs::read_to_string(&path).await?;
        let feed = Self::from_json(&contents, path.display().to_string())?;
        debug!(path = %path.display(), entries = feed.entries.len(), "loaded feed file");
        Ok(feed)
    }

    /// Decode entries from a JSON string.
    pub fn from_json(json: &str, name: impl Into<String>) -> ProviderResult<Self> {
        let document: FeedDocument =
            serde_json::from_str(json).map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let entries = match document {
            FeedDocument::Entries(entries) => entries,
            FeedDocument::Atom { feed } => match feed.entry {
                Some(OneOrMany::Many(entries)) => entries,
                Some(OneOrMany::One(entry)) => vec![*entry],
                None => Vec::new(),
            },
        };

        Ok(Self {
            name: format!("json:{}", name.into()),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PaperFeed for JsonFileFeed {
    async fn fetch_batch(&self, start: usize, max_results: usize) -> ProviderResult<Vec<RawRecord>> {
        Ok(self
            .entries
            .iter()
            .skip(start)
            .take(max_results)
            .cloned()
            .collect())
    }

    async fn count_records(&self) -> ProviderResult<Option<usize>> {
        Ok(Some(self.entries.len()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
