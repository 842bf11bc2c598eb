//! Tracing subscriber bootstrap for the binary.
//!
//! The library only emits events; installing a subscriber is left to the
//! process entry point so embedders keep control of their own output.

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

/// Install a stderr fmt subscriber.
///
/// `RUST_LOG` wins over the configured level. Calling this twice is harmless:
/// the second installation attempt is ignored.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output (JSON for --json), logs go to stderr
    let _ = fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
