//! Async facade over a [`Corpus`] for servers and other concurrent callers.
//!
//! Engine calls are blocking, so every request runs on tokio's blocking pool.
//! A semaphore sized by `server.workers` bounds how many run at once; beyond
//! that, requests wait for a permit.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::chunking::Chunker;
use crate::config::Settings;
use crate::corpus::{ChunkFailure, Corpus, CorpusStats, IngestReport, PointView, SettleOutcome};
use crate::embedding::{EmbeddingGenerator, create_generator};
use crate::error::{CorpusError, CorpusResult};
use crate::query::{ProjectionMethod, SearchHit};
use crate::store::NewChunk;
use crate::types::{ChunkId, LayoutDims};

/// Chunks `text`, embeds every chunk and inserts the batch.
///
/// Embedding failures are collected per chunk alongside insert failures.
/// Chunk indices follow document order, so re-ingesting the same `source`
/// overwrites its chunks in place.
pub fn ingest_text(
    corpus: &Corpus,
    embedder: &dyn EmbeddingGenerator,
    chunker: &Chunker,
    source: &str,
    text: &str,
) -> CorpusResult<IngestReport> {
    let started = Instant::now();
    let pieces = chunker.chunk(text);
    let mut report = IngestReport::default();
    if pieces.is_empty() {
        return Ok(report);
    }

    let embeddings = embed_each(embedder, &pieces);
    let mut chunks = Vec::with_capacity(pieces.len());
    for (index, (piece, embedding)) in pieces.into_iter().zip(embeddings).enumerate() {
        let chunk_index = u32::try_from(index).map_err(|_| CorpusError::Config {
            reason: format!("'{source}' produced more chunks than can be indexed"),
        })?;
        match embedding {
            Ok(embedding) => chunks.push(NewChunk::new(source, chunk_index, piece, embedding)),
            Err(error) => {
                debug!(%source, chunk_index, %error, "embedding failed");
                report.failures.push(ChunkFailure {
                    source: source.to_string(),
                    chunk_index,
                    error,
                });
            }
        }
    }

    report.merge(corpus.insert_batch(chunks)?);
    info!(
        %source,
        chunks = report.ingested.len(),
        failures = report.failures.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "ingest completed"
    );
    Ok(report)
}

/// Embeds the whole batch at once, falling back to one call per text when
/// the batch fails so a single bad text only costs its own chunk.
fn embed_each(embedder: &dyn EmbeddingGenerator, texts: &[String]) -> Vec<CorpusResult<Vec<f32>>> {
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    match embedder.generate_embeddings(&refs) {
        Ok(vectors) if vectors.len() == texts.len() => vectors.into_iter().map(Ok).collect(),
        _ => refs.iter().map(|text| embedder.embed(text)).collect(),
    }
}

/// Serializable summary of one text ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub source: String,
    pub chunks: usize,
    pub ingested: Vec<ChunkId>,
    pub failures: Vec<FailureView>,
    pub corrupted: Vec<ChunkId>,
    /// Chunks in the corpus after the ingest
    pub total_chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureView {
    pub chunk_index: u32,
    pub code: String,
    pub message: String,
}

impl IngestSummary {
    fn new(source: String, report: &IngestReport, total_chunks: usize) -> Self {
        Self {
            source,
            chunks: report.ingested.len() + report.failures.len(),
            ingested: report.ingested.clone(),
            failures: report
                .failures
                .iter()
                .map(|f| FailureView {
                    chunk_index: f.chunk_index,
                    code: f.error.status_code(),
                    message: f.error.to_string(),
                })
                .collect(),
            corrupted: report.corrupted.clone(),
            total_chunks,
        }
    }
}

/// Shared, cloneable handle serving corpus requests with bounded concurrency.
#[derive(Clone)]
pub struct CorpusService {
    corpus: Arc<Corpus>,
    embedder: Arc<dyn EmbeddingGenerator>,
    chunker: Chunker,
    permits: Arc<Semaphore>,
}

impl CorpusService {
    pub fn new(
        corpus: Corpus,
        embedder: Arc<dyn EmbeddingGenerator>,
        chunker: Chunker,
        workers: usize,
    ) -> Self {
        Self {
            corpus: Arc::new(corpus),
            embedder,
            chunker,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Opens the corpus and embedding model named by `settings`.
    pub fn open(settings: &Settings) -> CorpusResult<Self> {
        let embedder = create_generator(&settings.embedding)?;
        let corpus = Corpus::open(settings)?;
        Ok(Self::new(
            corpus,
            embedder,
            Chunker::from_config(&settings.chunking),
            settings.server.workers,
        ))
    }

    pub fn corpus(&self) -> &Arc<Corpus> {
        &self.corpus
    }

    pub fn chunker(&self) -> Chunker {
        self.chunker
    }

    /// Ingests `text` under `source`, with `chunker` overriding the
    /// configured policy.
    pub async fn ingest_text(
        &self,
        source: String,
        text: String,
        chunker: Option<Chunker>,
    ) -> CorpusResult<IngestSummary> {
        let chunker = chunker.unwrap_or(self.chunker);
        self.run(move |corpus, embedder| {
            let report = ingest_text(corpus, embedder, &chunker, &source, &text)?;
            Ok(IngestSummary::new(source, &report, corpus.read().len()))
        })
        .await
    }

    /// Embeds `query` and returns the `top_n` nearest chunks.
    ///
    /// Fails as a whole with `EmbeddingUnavailable` when the query cannot be
    /// embedded.
    pub async fn search_text(&self, query: String, top_n: usize) -> CorpusResult<Vec<SearchHit>> {
        self.search_projected(query, top_n, ProjectionMethod::Layout, None)
            .await
    }

    /// [`search_text`](Self::search_text) with hit coordinates from `method`.
    ///
    /// `dims` defaults to the corpus layout's dimension.
    pub async fn search_projected(
        &self,
        query: String,
        top_n: usize,
        method: ProjectionMethod,
        dims: Option<LayoutDims>,
    ) -> CorpusResult<Vec<SearchHit>> {
        self.run(move |corpus, embedder| {
            let started = Instant::now();
            let vector = embedder.embed(&query)?;
            let dims = match dims {
                Some(dims) => dims,
                None => corpus.read().layout().dims(),
            };
            let hits = corpus.search_projected(&vector, top_n, method, dims)?;
            info!(
                k = top_n,
                %method,
                dims = dims.get(),
                hits = hits.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "search completed"
            );
            Ok(hits)
        })
        .await
    }

    pub async fn reset(&self) -> CorpusResult<()> {
        self.run(|corpus, _| corpus.reset()).await
    }

    pub async fn points(&self) -> CorpusResult<Vec<PointView>> {
        self.run(|corpus, _| Ok(corpus.points())).await
    }

    pub async fn stats(&self) -> CorpusResult<CorpusStats> {
        self.run(|corpus, _| Ok(corpus.stats())).await
    }

    /// Runs a global settle and waits for it.
    pub async fn settle(&self) -> CorpusResult<SettleOutcome> {
        self.run(|corpus, _| corpus.settle_now()).await
    }

    async fn run<T, F>(&self, task: F) -> CorpusResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Corpus, &dyn EmbeddingGenerator) -> CorpusResult<T> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| CorpusError::Worker {
                reason: "service is shutting down".to_string(),
            })?;
        let corpus = Arc::clone(&self.corpus);
        let embedder = Arc::clone(&self.embedder);

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task(corpus.as_ref(), embedder.as_ref())
        })
        .await
        .map_err(|e| CorpusError::Worker {
            reason: e.to_string(),
        })?
    }
}

impl std::fmt::Debug for CorpusService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorpusService")
            .field("corpus", &self.corpus)
            .field("chunker", &self.chunker)
            .field("workers", &self.permits.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::CorpusConfig;
    use crate::embedding::{HashingEmbedder, MockEmbeddingGenerator};
    use crate::types::EmbeddingDimension;
    use tempfile::TempDir;

    fn inline_config() -> CorpusConfig {
        let mut config = CorpusConfig::default();
        config.settle.background = false;
        config.settle.global_every = 0;
        config
    }

    #[test]
    fn test_ingest_text_collects_embedding_failures() {
        let temp_dir = TempDir::new().unwrap();
        let corpus = Corpus::open_at(temp_dir.path(), inline_config()).unwrap();
        let embedder = MockEmbeddingGenerator::new(EmbeddingDimension::new(3).unwrap())
            .with("The whale swims.", vec![1.0, 0.0, 0.0])
            .with("Cats sleep.", vec![0.0, 0.0, 1.0]);

        let report = ingest_text(
            &corpus,
            &embedder,
            &Chunker::Sentences { window: 1 },
            "notes.txt",
            "The whale swims. Unknown sentence. Cats sleep.",
        )
        .unwrap();

        assert_eq!(report.ingested.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].chunk_index, 1);
        assert!(matches!(
            report.failures[0].error,
            CorpusError::EmbeddingUnavailable { .. }
        ));
        assert_eq!(corpus.read().len(), 2);
    }

    #[test]
    fn test_reingesting_source_keeps_identifiers() {
        let temp_dir = TempDir::new().unwrap();
        let corpus = Corpus::open_at(temp_dir.path(), inline_config()).unwrap();
        let embedder = HashingEmbedder::new(EmbeddingDimension::new(64).unwrap());
        let chunker = Chunker::Paragraphs;
        let text = "ships sail the ocean\n\ncats sleep on mats";

        let first = ingest_text(&corpus, &embedder, &chunker, "a.txt", text).unwrap();
        let second = ingest_text(&corpus, &embedder, &chunker, "a.txt", text).unwrap();

        assert_eq!(first.ingested, second.ingested);
        assert_eq!(corpus.read().len(), 2);
    }

    #[tokio::test]
    async fn test_service_search_and_reset() {
        let temp_dir = TempDir::new().unwrap();
        let corpus = Corpus::open_at(temp_dir.path(), inline_config()).unwrap();
        let embedder = Arc::new(HashingEmbedder::new(EmbeddingDimension::new(128).unwrap()));
        let service = CorpusService::new(corpus, embedder, Chunker::Paragraphs, 2);

        let summary = service
            .ingest_text(
                "sea.txt".to_string(),
                "the whale swims in the sea\n\nships sail the ocean\n\ncats sleep on mats"
                    .to_string(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.total_chunks, 3);

        let hits = service.search_text("whale sea".to_string(), 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_index, 0);

        service.reset().await.unwrap();
        assert!(service.points().await.unwrap().is_empty());
        assert!(service.search_text("whale".to_string(), 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unembeddable_query_fails_request() {
        let temp_dir = TempDir::new().unwrap();
        let corpus = Corpus::open_at(temp_dir.path(), inline_config()).unwrap();
        let embedder = Arc::new(MockEmbeddingGenerator::new(EmbeddingDimension::new(2).unwrap()));
        let service = CorpusService::new(corpus, embedder, Chunker::Paragraphs, 1);

        let result = service.search_text("anything".to_string(), 3).await;
        assert!(matches!(result, Err(CorpusError::EmbeddingUnavailable { .. })));
    }
}
