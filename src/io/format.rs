//! Output formats for CLI commands.

use serde::Serialize;

use crate::error::CorpusError;
use crate::io::exit_code::ExitCode;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text (default)
    Text,
    /// JSON for scripts and plotting tools
    Json,
}

impl OutputFormat {
    #[must_use]
    pub fn from_json_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Text }
    }

    #[must_use]
    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Standard JSON envelope for command output.
#[derive(Debug, Serialize)]
pub struct JsonResponse<T = serde_json::Value>
where
    T: Serialize,
{
    /// "success" or "error"
    pub status: String,

    /// Result code (e.g., "OK", "NOT_FOUND", "EMBEDDING_UNAVAILABLE")
    pub code: String,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    /// Recovery suggestions (only for errors)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,

    /// Exit code for shell scripts
    pub exit_code: u8,
}

impl<T> JsonResponse<T>
where
    T: Serialize,
{
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            code: "OK".to_string(),
            message: "Operation completed successfully".to_string(),
            data: Some(data),
            suggestions: Vec::new(),
            exit_code: ExitCode::Success as u8,
        }
    }
}

impl JsonResponse<serde_json::Value> {
    pub fn from_error(error: &CorpusError) -> Self {
        Self {
            status: "error".to_string(),
            code: error.status_code(),
            message: error.to_string(),
            data: None,
            suggestions: error
                .recovery_suggestions()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exit_code: ExitCode::from_error(error) as u8,
        }
    }
}
