//! Layered configuration as seen by the corpus.

use corpus_atlas::config::{ChunkStrategy, Metric};
use corpus_atlas::{Chunker, CorpusConfig, LayoutDims, Settings};
use tempfile::TempDir;

#[test]
fn test_defaults() {
    let settings = Settings::default();
    assert_eq!(settings.embedding.model, "hashing");
    assert_eq!(settings.graph.n_neighbors, 15);
    assert_eq!(settings.graph.metric, Metric::Cosine);
    assert_eq!(settings.layout.dims, LayoutDims::Two);
    assert_eq!(settings.settle.global_every, 100);
    assert_eq!(settings.chunking.strategy, ChunkStrategy::TokenOverlap);
}

#[test]
fn test_toml_file_overrides_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("settings.toml");
    std::fs::write(
        &path,
        r#"
data_path = "/tmp/atlas-test"

[graph]
n_neighbors = 8
metric = "euclidean"

[layout]
dims = 3

[chunking]
strategy = "sentences"
sentence_window = 3
"#,
    )
    .unwrap();

    let settings = Settings::load_from(&path).unwrap();
    assert_eq!(settings.graph.n_neighbors, 8);
    assert_eq!(settings.graph.metric, Metric::Euclidean);
    assert_eq!(settings.layout.dims, LayoutDims::Three);
    // Untouched sections keep their defaults
    assert_eq!(settings.layout.epochs, 200);

    let config = CorpusConfig::from(&settings);
    assert_eq!(config.graph.n_neighbors, 8);
    assert_eq!(
        Chunker::from_config(&settings.chunking),
        Chunker::Sentences { window: 3 }
    );
}

#[test]
fn test_invalid_layout_dims_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("settings.toml");
    std::fs::write(&path, "[layout]\ndims = 4\n").unwrap();
    assert!(Settings::load_from(&path).is_err());
}

#[test]
fn test_settings_round_trip_through_toml() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("settings.toml");
    let mut settings = Settings::default();
    settings.settle.containment_bound = 0.25;
    settings.save(&path).unwrap();

    let loaded = Settings::load_from(&path).unwrap();
    assert_eq!(loaded.settle.containment_bound, 0.25);
}
