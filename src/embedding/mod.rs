//! Embedding generators: turn chunk text into fixed-length vectors.
//!
//! The corpus engine never calls a model itself. Ingest and search go
//! through an [`EmbeddingGenerator`], chosen from `[embedding]` settings by
//! [`create_generator`].

mod hashing;

#[cfg(feature = "fastembed")]
mod fastembed;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::error::{CorpusError, CorpusResult};
use crate::types::EmbeddingDimension;

pub use hashing::{HashingEmbedder, tokenize};

#[cfg(feature = "fastembed")]
pub use self::fastembed::FastEmbedGenerator;

/// Trait for generating embeddings from text.
///
/// Implementations must be deterministic for identical input and safe to
/// share between threads.
pub trait EmbeddingGenerator: Send + Sync {
    /// Generate embeddings for multiple texts, one per input.
    ///
    /// Fails with `EmbeddingUnavailable` when the backing model cannot
    /// produce a vector.
    fn generate_embeddings(&self, texts: &[&str]) -> CorpusResult<Vec<Vec<f32>>>;

    /// Dimension of the produced vectors.
    #[must_use]
    fn dimension(&self) -> EmbeddingDimension;

    /// Embedding of a single text.
    fn embed(&self, text: &str) -> CorpusResult<Vec<f32>> {
        self.generate_embeddings(&[text])?
            .pop()
            .ok_or_else(|| CorpusError::EmbeddingUnavailable {
                reason: "generator returned no embedding".to_string(),
            })
    }
}

/// Builds the generator named by `config.model`.
pub fn create_generator(config: &EmbeddingConfig) -> CorpusResult<Arc<dyn EmbeddingGenerator>> {
    let dimension = EmbeddingDimension::new(config.dimension)?;
    match config.model.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(dimension))),
        #[cfg(feature = "fastembed")]
        model => Ok(Arc::new(FastEmbedGenerator::new(model)?)),
        #[cfg(not(feature = "fastembed"))]
        model => Err(CorpusError::Config {
            reason: format!(
                "embedding model '{model}' requires building with the `fastembed` feature"
            ),
        }),
    }
}

/// Generator returning fixed vectors for known texts.
///
/// Intended for tests: unknown texts fail with `EmbeddingUnavailable`, which
/// also makes it a convenient stand-in for an unreachable model.
#[derive(Debug, Clone)]
pub struct MockEmbeddingGenerator {
    dimension: EmbeddingDimension,
    vectors: HashMap<String, Vec<f32>>,
}

impl MockEmbeddingGenerator {
    pub fn new(dimension: EmbeddingDimension) -> Self {
        Self {
            dimension,
            vectors: HashMap::new(),
        }
    }

    /// Registers the vector returned for `text`.
    #[must_use]
    pub fn with(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.into(), vector);
        self
    }
}

impl EmbeddingGenerator for MockEmbeddingGenerator {
    fn generate_embeddings(&self, texts: &[&str]) -> CorpusResult<Vec<Vec<f32>>> {
        texts
            .iter()
            .map(|text| {
                self.vectors
                    .get(*text)
                    .cloned()
                    .ok_or_else(|| CorpusError::EmbeddingUnavailable {
                        reason: format!("no embedding registered for '{text}'"),
                    })
            })
            .collect()
    }

    fn dimension(&self) -> EmbeddingDimension {
        self.dimension
    }
}
