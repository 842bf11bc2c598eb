//! End-to-end ingest and search through the service facade.

use std::sync::Arc;

use corpus_atlas::{
    Chunker, CorpusError, CorpusService, EmbeddingDimension, MockEmbeddingGenerator, Score,
};

use crate::common::{create_test_corpus, inline_config};

const WHALE: &str = "the whale swims in the sea";
const SHIPS: &str = "ships sail the ocean";
const CATS: &str = "cats sleep on mats";

fn mock_embedder() -> MockEmbeddingGenerator {
    MockEmbeddingGenerator::new(EmbeddingDimension::new(3).unwrap())
        .with(WHALE, vec![1.0, 0.0, 0.0])
        .with(SHIPS, vec![0.9, 0.1, 0.0])
        .with(CATS, vec![0.0, 0.0, 1.0])
        .with("whale ship sea", vec![0.95, 0.05, 0.0])
}

#[tokio::test]
async fn test_whale_query_prefers_maritime_chunks() {
    let (corpus, _dir) = create_test_corpus(inline_config());
    let service = CorpusService::new(corpus, Arc::new(mock_embedder()), Chunker::Paragraphs, 4);

    let summary = service
        .ingest_text(
            "demo.txt".to_string(),
            format!("{WHALE}\n\n{SHIPS}\n\n{CATS}"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(summary.ingested.len(), 3);
    assert!(summary.failures.is_empty());

    let hits = service
        .search_text("whale ship sea".to_string(), 3)
        .await
        .unwrap();
    assert_eq!(hits.len(), 3);
    assert!(hits[0].chunk_index == 0 || hits[0].chunk_index == 1);

    let cats = hits.iter().find(|h| h.chunk_index == 2).unwrap();
    assert!(hits[0].score > cats.score);
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(hits.iter().all(|h| h.coords.len() == 2));
    assert_eq!(cats.preview, CATS);
}

#[tokio::test]
async fn test_empty_corpus_search_is_empty_not_error() {
    let (corpus, _dir) = create_test_corpus(inline_config());
    let service = CorpusService::new(corpus, Arc::new(mock_embedder()), Chunker::Paragraphs, 1);

    let hits = service
        .search_text("whale ship sea".to_string(), 10)
        .await
        .unwrap();
    assert!(hits.is_empty());
    assert!(service.points().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_searches_during_ingest() {
    let (corpus, _dir) = create_test_corpus(inline_config());
    let service = CorpusService::new(corpus, Arc::new(mock_embedder()), Chunker::Paragraphs, 4);
    service
        .ingest_text("a.txt".to_string(), WHALE.to_string(), None)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            service.search_text("whale ship sea".to_string(), 3).await
        }));
    }
    let ingest = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .ingest_text("b.txt".to_string(), format!("{SHIPS}\n\n{CATS}"), None)
                .await
        })
    };

    for task in tasks {
        let hits = task.await.unwrap().unwrap();
        // Each search sees a consistent view: one, two or three chunks
        assert!(!hits.is_empty() && hits.len() <= 3);
        assert!(hits.iter().all(|h| !h.coords.is_empty()));
    }
    assert_eq!(ingest.await.unwrap().unwrap().total_chunks, 3);
}

#[tokio::test]
async fn test_unknown_query_fails_whole_request() {
    let (corpus, _dir) = create_test_corpus(inline_config());
    let service = CorpusService::new(corpus, Arc::new(mock_embedder()), Chunker::Paragraphs, 1);
    service
        .ingest_text("a.txt".to_string(), WHALE.to_string(), None)
        .await
        .unwrap();

    let result = service.search_text("not registered".to_string(), 3).await;
    assert!(matches!(
        result,
        Err(CorpusError::EmbeddingUnavailable { .. })
    ));
}

#[test]
fn test_score_is_monotonic_in_distance() {
    assert_eq!(Score::from_distance(0.0).get(), 1.0);
    assert!(Score::from_distance(0.1) > Score::from_distance(0.2));
    assert!(Score::from_distance(f32::INFINITY).get() >= 0.0);
}
