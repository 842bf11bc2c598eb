//! Error types for the corpus engine
//!
//! This module provides structured error types using thiserror for better
//! error handling and actionable error messages.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ChunkId;

/// Main error type for corpus operations
#[derive(Error, Debug)]
pub enum CorpusError {
    /// Embedding dimensionality disagrees with the corpus
    #[error(
        "Embedding dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure all chunks are embedded with the same model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Chunk {id} not found")]
    NotFound { id: ChunkId },

    /// The embedding collaborator could not produce a vector
    #[error("Embedding unavailable: {reason}")]
    EmbeddingUnavailable { reason: String },

    /// A point kept diverging after its coordinate was reset and the epoch retried
    #[error("Layout corrupted for chunk {id}: coordinates diverged after retry")]
    LayoutCorruption { id: ChunkId },

    #[error("Global settle abandoned: corpus was reset while it was running")]
    SettleAbandoned,

    #[error("Storage error at '{path}': {source}")]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid storage format: {reason}")]
    InvalidFormat { reason: String },

    #[error(
        "Invalid storage version: expected {expected}, got {actual}\nSuggestion: Reset the corpus or use a compatible version"
    )]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid score value: {value}")]
    InvalidScore { value: f32 },

    /// Configuration errors
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Chunk identifier space exhausted")]
    ChunkIdExhausted,

    /// A blocking engine task panicked or the service is shutting down
    #[error("Worker failed: {reason}")]
    Worker { reason: String },
}

impl CorpusError {
    /// Get a stable status code for this error type.
    ///
    /// Returns a string identifier that can be used in JSON responses
    /// for programmatic error handling.
    pub fn status_code(&self) -> String {
        match self {
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::EmbeddingUnavailable { .. } => "EMBEDDING_UNAVAILABLE",
            Self::LayoutCorruption { .. } => "LAYOUT_CORRUPTION",
            Self::SettleAbandoned => "SETTLE_ABANDONED",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::InvalidFormat { .. } => "INVALID_FORMAT",
            Self::VersionMismatch { .. } => "VERSION_MISMATCH",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::InvalidScore { .. } => "INVALID_SCORE",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::ChunkIdExhausted => "CHUNK_ID_EXHAUSTED",
            Self::Worker { .. } => "WORKER_ERROR",
        }
        .to_string()
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::EmbeddingUnavailable { .. } => vec![
                "Check that the embedding model is installed and reachable",
                "Retry the request once the model is available",
            ],
            Self::Storage { .. } => vec![
                "Check disk space and permissions in the data directory",
                "The record that failed was not written; the corpus is consistent",
            ],
            Self::InvalidFormat { .. } | Self::VersionMismatch { .. } => vec![
                "Run 'atlas reset --yes' to start from an empty corpus",
                "Check for disk errors or filesystem corruption",
            ],
            Self::LayoutCorruption { .. } => vec![
                "Run 'atlas settle' to re-optimize the whole layout",
                "Inspect the chunk embedding for NaN or extreme values",
            ],
            Self::Config { .. } => vec![
                "Run 'atlas config' to inspect the effective settings",
                "Run 'atlas init --force' to regenerate .atlas/settings.toml",
            ],
            _ => vec![],
        }
    }

    /// Whether the error is confined to a single chunk and must not abort a batch.
    #[must_use]
    pub fn is_per_chunk(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable { .. }
                | Self::DimensionMismatch { .. }
                | Self::LayoutCorruption { .. }
        )
    }
}

impl From<bincode::error::EncodeError> for CorpusError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CorpusError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CorpusError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result type alias for corpus operations
pub type CorpusResult<T> = Result<T, CorpusError>;

/// Helper trait for attaching a path to I/O errors
pub trait StorageContext<T> {
    fn at_path(self, path: &std::path::Path) -> CorpusResult<T>;
}

impl<T> StorageContext<T> for Result<T, std::io::Error> {
    fn at_path(self, path: &std::path::Path) -> CorpusResult<T> {
        self.map_err(|source| CorpusError::Storage {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        let err = CorpusError::DimensionMismatch {
            expected: 3,
            actual: 4,
        };
        assert_eq!(err.status_code(), "DIMENSION_MISMATCH");
        assert!(err.is_per_chunk());

        let err = CorpusError::NotFound {
            id: ChunkId::new_unchecked(7),
        };
        assert_eq!(err.status_code(), "NOT_FOUND");
        assert_eq!(err.to_string(), "Chunk 7 not found");
        assert!(!err.is_per_chunk());
    }

    #[test]
    fn test_storage_context() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk full"));
        let err = result.at_path(std::path::Path::new("/tmp/chunks.log")).unwrap_err();
        assert_eq!(err.status_code(), "STORAGE_ERROR");
        assert!(err.to_string().contains("chunks.log"));
        assert!(!err.recovery_suggestions().is_empty());
    }
}
