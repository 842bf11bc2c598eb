//! Splitting ingested text into chunks.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::{ChunkStrategy, ChunkingConfig};

static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)(.*?[.!?])\s+").expect("Invalid regex"));

/// Chunking policy resolved from `[chunking]` settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunker {
    /// Word windows of `size` words, consecutive windows sharing `overlap`
    TokenOverlap { size: usize, overlap: usize },
    /// Groups of `window` consecutive sentences
    Sentences { window: usize },
    /// Blank-line separated paragraphs
    Paragraphs,
}

impl Chunker {
    pub fn from_config(config: &ChunkingConfig) -> Self {
        match config.strategy {
            ChunkStrategy::TokenOverlap => Chunker::TokenOverlap {
                size: config.tokens_per_chunk,
                overlap: config.overlap,
            },
            ChunkStrategy::Sentences => Chunker::Sentences {
                window: config.sentence_window,
            },
            ChunkStrategy::Paragraphs => Chunker::Paragraphs,
        }
    }

    /// Chunks of `text` in document order. Whitespace-only text has no chunks.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        match *self {
            Chunker::TokenOverlap { size, overlap } => word_windows(text, size, overlap),
            Chunker::Sentences { window } => sentence_windows(&split_sentences(text), window),
            Chunker::Paragraphs => split_paragraphs(text),
        }
    }
}

/// Paragraphs separated by blank lines; the trimmed input when there are none.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let paragraphs: Vec<String> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();

    if paragraphs.is_empty() {
        vec![text.trim().to_string()]
    } else {
        paragraphs
    }
}

/// Sentences ending in `.`, `!` or `?` followed by whitespace, plus any
/// unterminated tail.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut last = 0;
    for caps in SENTENCE_END.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            sentences.push(m.as_str().trim().to_string());
            last = m.end();
        }
    }
    let tail = text[last..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

fn sentence_windows(sentences: &[String], window: usize) -> Vec<String> {
    if window == 0 {
        return Vec::new();
    }
    sentences.chunks(window).map(|group| group.join(" ")).collect()
}

fn word_windows(text: &str, size: usize, overlap: usize) -> Vec<String> {
    if size == 0 {
        return Vec::new();
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    let step = size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < words.len() {
        let end = (start + size).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }
    chunks
}
