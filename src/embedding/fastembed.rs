//! Sentence-transformer embeddings through fastembed.

use std::sync::Mutex;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tracing::info;

use crate::error::{CorpusError, CorpusResult};
use crate::types::EmbeddingDimension;

use super::EmbeddingGenerator;

/// FastEmbed generator for one of the supported ONNX models.
///
/// The model is downloaded on first use and cached by fastembed.
pub struct FastEmbedGenerator {
    model: Mutex<TextEmbedding>,
    dimension: EmbeddingDimension,
}

impl FastEmbedGenerator {
    /// Loads `model`, e.g. `AllMiniLML6V2`.
    ///
    /// # Errors
    /// `Config` for an unknown model name, `EmbeddingUnavailable` when the
    /// model fails to initialize or download.
    pub fn new(name: &str) -> CorpusResult<Self> {
        let (kind, dim) = match name {
            "AllMiniLML6V2" => (EmbeddingModel::AllMiniLML6V2, 384),
            "AllMiniLML12V2" => (EmbeddingModel::AllMiniLML12V2, 384),
            "BGESmallENV15" => (EmbeddingModel::BGESmallENV15, 384),
            "BGEBaseENV15" => (EmbeddingModel::BGEBaseENV15, 768),
            other => {
                return Err(CorpusError::Config {
                    reason: format!("unknown embedding model '{other}'"),
                });
            }
        };

        let model = TextEmbedding::try_new(
            InitOptions::new(kind).with_show_download_progress(false),
        )
        .map_err(|e| CorpusError::EmbeddingUnavailable {
            reason: format!(
                "failed to initialize embedding model: {e}. First use needs network access to download it"
            ),
        })?;
        info!(model = name, dim, "loaded embedding model");

        Ok(Self {
            model: Mutex::new(model),
            dimension: EmbeddingDimension::new(dim)?,
        })
    }
}

impl EmbeddingGenerator for FastEmbedGenerator {
    fn generate_embeddings(&self, texts: &[&str]) -> CorpusResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let text_strings: Vec<String> = texts.iter().map(|&s| s.to_string()).collect();

        let embeddings = self
            .model
            .lock()
            .map_err(|_| CorpusError::EmbeddingUnavailable {
                reason: "embedding model lock poisoned".to_string(),
            })?
            .embed(text_strings, None)
            .map_err(|e| CorpusError::EmbeddingUnavailable {
                reason: format!("failed to generate embeddings: {e}"),
            })?;

        for embedding in &embeddings {
            self.dimension.validate(embedding)?;
        }
        Ok(embeddings)
    }

    fn dimension(&self) -> EmbeddingDimension {
        self.dimension
    }
}
