//! Input/Output handling for the CLI.
//!
//! This module provides:
//! - Unified output formatting (text, JSON)
//! - Semantic exit codes
//! - Progress bars and spinners

pub mod exit_code;
pub mod format;
pub mod progress;

pub use exit_code::ExitCode;
pub use format::{JsonResponse, OutputFormat};
