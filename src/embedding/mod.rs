//! Text → vector embedding.
//!
//! [`EmbeddingProvider`] is the seam between the index/query code and the
//! model. `fastembed` holds the local model implementation and `pool` bounds
//! how many embedding calls may run at once.
//!
//! Abstracts and prompts are both passed through [`normalize_text`] before
//! they reach a provider.

pub mod fastembed;
pub mod pool;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::EmbeddingConfig;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Text the model refuses, such as an empty string
    #[error("Invalid input text: {0}")]
    InvalidInput(String),

    /// Unknown model or a model that failed to load
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The blocking task running the model died, or the pool was closed
    #[error("Embedding worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Embedding failed: {0}")]
    Other(String),
}

pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// A text embedding model.
///
/// `embed` must be deterministic for a given `model_name`: cache entries and
/// snapshots are keyed on the name and reused as long as it does not change.
///
/// ```ignore
/// let provider = FastEmbedProvider::from_name("all-MiniLM-L6-v2", None)?;
/// let vector = provider.embed(&normalize_text(abstract_text)).await?;
/// assert_eq!(vector.len(), provider.dimension());
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one piece of already normalized text.
    ///
    /// # Errors
    /// `EmbeddingError::InvalidInput` for text the model cannot embed, other
    /// variants when the model itself fails.
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>>;

    /// Length of every vector `embed` returns.
    fn dimension(&self) -> usize;

    /// Model identifier. Doubles as the model version for cache and
    /// snapshot invalidation.
    fn model_name(&self) -> &str;

    fn config(&self) -> EmbeddingConfig {
        EmbeddingConfig {
            model_name: self.model_name().to_string(),
            dimension: self.dimension(),
        }
    }
}

/// Canonical model input: lowercase, with every whitespace run (newlines
/// and tabs included) collapsed to one space and the ends trimmed.
///
/// Used for both abstracts and prompts, and as the input to the cache's text
/// hash.
pub fn normalize_text(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !normalized.is_empty() {
            normalized.push(' ');
        }
        normalized.push_str(&word.to_lowercase());
    }
    normalized
}
