//! Terminal progress for ingestion and layout settles.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;

use crate::corpus::IngestReport;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} sources {msg}";

/// Chunk counts for one ingested source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceTally {
    pub source: String,
    pub inserted: usize,
    pub failed: usize,
}

/// Chunk counts for a whole ingest run, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestTally {
    pub sources: Vec<SourceTally>,
    pub inserted: usize,
    pub failed: usize,
}

impl IngestTally {
    /// Sources that lost at least one chunk.
    pub fn incomplete(&self) -> impl Iterator<Item = &SourceTally> {
        self.sources.iter().filter(|s| s.failed > 0)
    }
}

/// Progress over the sources of one ingest run.
///
/// The bar advances per source while the message carries the running chunk
/// counts, so a long file shows what it has yielded so far.
pub struct IngestProgress {
    bar: ProgressBar,
    tally: IngestTally,
}

impl IngestProgress {
    /// Progress over `sources` inputs, drawn to stderr unless `visible` is false.
    pub fn new(sources: usize, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(sources as u64)
        } else {
            ProgressBar::with_draw_target(Some(sources as u64), ProgressDrawTarget::hidden())
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        if visible {
            bar.enable_steady_tick(Duration::from_millis(100));
        }
        Self {
            bar,
            tally: IngestTally::default(),
        }
    }

    /// Announces the source about to be chunked and embedded.
    pub fn start_source(&self, source: &str) {
        self.bar.set_message(format!(
            "{source} ({} chunks so far)",
            self.tally.inserted
        ));
    }

    /// Counts the outcome of one source and advances the bar.
    pub fn finish_source(&mut self, source: &str, report: &IngestReport) {
        let inserted = report.ingested.len();
        let failed = report.failures.len();
        self.tally.inserted += inserted;
        self.tally.failed += failed;
        self.tally.sources.push(SourceTally {
            source: source.to_string(),
            inserted,
            failed,
        });
        self.bar.inc(1);
        self.bar.set_message(format!(
            "{} chunks, {} failed",
            self.tally.inserted, self.tally.failed
        ));
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Clears the bar and hands back the counts.
    pub fn finish(self) -> IngestTally {
        self.bar.finish_and_clear();
        self.tally
    }
}

/// Runs `operation` behind a spinner that is cleared afterwards.
pub fn with_spinner<F, T>(message: &str, operation: F) -> T
where
    F: FnOnce() -> T,
{
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    let result = operation();
    spinner.finish_and_clear();
    result
}
