//! Durability across restarts and reset semantics.

use corpus_atlas::{ChunkState, Corpus, NewChunk};
use tempfile::TempDir;

use crate::common::{chunks_for, clustered_vectors, inline_config};

#[test]
fn test_restart_restores_layout_and_identifiers() {
    let temp_dir = TempDir::new().unwrap();
    let vectors = clustered_vectors(30, 8, 3, 13);

    let (points, ingested) = {
        let corpus = Corpus::open_at(temp_dir.path(), inline_config()).unwrap();
        let report = corpus.insert_batch(chunks_for("doc", &vectors)).unwrap();
        corpus.settle_now().unwrap();
        (corpus.points(), report.ingested)
    };

    let corpus = Corpus::open_at(temp_dir.path(), inline_config()).unwrap();
    assert_eq!(corpus.points(), points);
    assert!(
        corpus
            .points()
            .iter()
            .all(|p| p.state == ChunkState::Settled)
    );

    // Identifiers keep counting from where the previous process stopped
    let next = corpus
        .insert(NewChunk::new("other", 0, "new", vectors[0].clone()))
        .unwrap();
    assert!(next.id > *ingested.last().unwrap());

    // Re-ingesting a known chunk reuses its identifier after restart
    let again = corpus
        .insert(NewChunk::new("doc", 4, "doc chunk 4", vectors[4].clone()))
        .unwrap();
    assert_eq!(again.id, ingested[4]);
}

#[test]
fn test_store_files_are_created() {
    let temp_dir = TempDir::new().unwrap();
    {
        let corpus = Corpus::open_at(temp_dir.path(), inline_config()).unwrap();
        corpus
            .insert_batch(chunks_for("doc", &clustered_vectors(3, 4, 1, 1)))
            .unwrap();
    }
    for file in ["chunks.log", "snapshot.bin", "metadata.json"] {
        assert!(temp_dir.path().join(file).exists(), "{file} missing");
    }

    let metadata: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(temp_dir.path().join("metadata.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(metadata["chunk_count"], 3);
}

#[test]
fn test_missing_snapshot_is_rebuilt_from_log() {
    let temp_dir = TempDir::new().unwrap();
    let vectors = clustered_vectors(12, 6, 2, 17);
    {
        let corpus = Corpus::open_at(temp_dir.path(), inline_config()).unwrap();
        corpus.insert_batch(chunks_for("doc", &vectors)).unwrap();
    }
    std::fs::remove_file(temp_dir.path().join("snapshot.bin")).unwrap();

    let corpus = Corpus::open_at(temp_dir.path(), inline_config()).unwrap();
    let state = corpus.read();
    assert_eq!(state.len(), 12);
    assert_eq!(state.layout().len(), 12);
    assert_eq!(state.graph().len(), 12);
}

#[test]
fn test_reset_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    {
        let corpus = Corpus::open_at(temp_dir.path(), inline_config()).unwrap();
        corpus
            .insert_batch(chunks_for("doc", &clustered_vectors(10, 4, 2, 2)))
            .unwrap();
        corpus.reset().unwrap();
        assert_eq!(corpus.stats().chunks, 0);
    }

    let corpus = Corpus::open_at(temp_dir.path(), inline_config()).unwrap();
    assert!(corpus.points().is_empty());
    assert!(corpus.search(&[1.0, 0.0, 0.0, 0.0], 5).unwrap().is_empty());
}

#[test]
fn test_reset_during_background_settle_leaves_corpus_empty() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = inline_config();
    config.settle.background = true;
    config.layout.epochs = 400;

    let corpus = Corpus::open_at(temp_dir.path(), config).unwrap();
    corpus
        .insert_batch(chunks_for("doc", &clustered_vectors(150, 16, 5, 4)))
        .unwrap();
    let generation = corpus.stats().generation;

    corpus.request_settle().unwrap();
    corpus.reset().unwrap();
    corpus.wait_for_settle();

    // Whether the settle finished before the reset or was abandoned, nothing
    // from the old corpus may reappear
    let stats = corpus.stats();
    assert_eq!(stats.chunks, 0);
    assert_eq!(stats.generation, generation + 1);
    assert!(corpus.points().is_empty());
    assert!(!stats.settle_in_progress);
}
