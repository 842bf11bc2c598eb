//! Exit codes for CLI operations following Unix conventions.
//!
//! # Exit Code Semantics
//!
//! - `0`: Success - operation completed (an empty result is acceptable)
//! - `1`: General error - unspecified failure
//! - `2`: Blocking error - the corpus cannot be used until repaired or reset
//! - `3-125`: Specific recoverable errors
//! - `126-255`: Reserved by shell

use crate::error::CorpusError;

/// Standard exit codes for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Operation succeeded (code 0)
    Success = 0,

    /// Unspecified error occurred (code 1)
    GeneralError = 1,

    /// Critical error that should halt automation (code 2)
    BlockingError = 2,

    /// Chunk not found (code 3)
    NotFound = 3,

    /// Embedding rejected or unavailable (code 4)
    EmbeddingError = 4,

    /// File I/O error (code 5)
    IoError = 5,

    /// Configuration error (code 6)
    ConfigError = 6,

    /// Corpus files unreadable or from another version (code 7)
    CorpusCorrupted = 7,

    /// Some chunks were not ingested (code 8)
    PartialIngest = 8,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl ExitCode {
    /// Maps a `CorpusError` to the exit code scripts can branch on.
    pub fn from_error(error: &CorpusError) -> Self {
        match error {
            CorpusError::NotFound { .. } => ExitCode::NotFound,

            CorpusError::DimensionMismatch { .. } | CorpusError::EmbeddingUnavailable { .. } => {
                ExitCode::EmbeddingError
            }

            CorpusError::Storage { .. } => ExitCode::IoError,
            CorpusError::Config { .. } => ExitCode::ConfigError,

            CorpusError::InvalidFormat { .. }
            | CorpusError::VersionMismatch { .. }
            | CorpusError::Serialization(_) => ExitCode::CorpusCorrupted,

            CorpusError::ChunkIdExhausted => ExitCode::BlockingError,

            _ => ExitCode::GeneralError,
        }
    }

    /// Blocking errors should halt automation pipelines.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        matches!(self, ExitCode::BlockingError | ExitCode::CorpusCorrupted)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }

    /// Get a human-readable description of the exit code.
    pub fn description(&self) -> &str {
        match self {
            ExitCode::Success => "Success",
            ExitCode::GeneralError => "General error",
            ExitCode::BlockingError => "Blocking error - automation should halt",
            ExitCode::NotFound => "Not found",
            ExitCode::EmbeddingError => "Embedding error",
            ExitCode::IoError => "I/O error",
            ExitCode::ConfigError => "Configuration error",
            ExitCode::CorpusCorrupted => "Corpus corrupted",
            ExitCode::PartialIngest => "Some chunks failed to ingest",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkId;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success as u8, 0);
        assert_eq!(ExitCode::GeneralError as u8, 1);
        assert_eq!(ExitCode::BlockingError as u8, 2);
        assert_eq!(ExitCode::NotFound as u8, 3);
        assert_eq!(i32::from(ExitCode::PartialIngest), 8);
    }

    #[test]
    fn test_from_error() {
        let not_found = CorpusError::NotFound {
            id: ChunkId::new_unchecked(1),
        };
        assert_eq!(ExitCode::from_error(&not_found), ExitCode::NotFound);

        let mismatch = CorpusError::DimensionMismatch {
            expected: 3,
            actual: 2,
        };
        assert_eq!(ExitCode::from_error(&mismatch), ExitCode::EmbeddingError);

        let version = CorpusError::VersionMismatch {
            expected: 1,
            actual: 9,
        };
        assert!(ExitCode::from_error(&version).is_blocking());
    }

    #[test]
    fn test_is_success() {
        assert!(ExitCode::Success.is_success());
        assert!(!ExitCode::NotFound.is_success());
        assert!(!ExitCode::PartialIngest.is_success());
    }
}
