#![allow(dead_code)]

use corpus_atlas::{Corpus, CorpusConfig, NewChunk};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

/// Configuration with inline settles only, so runs are reproducible.
pub fn inline_config() -> CorpusConfig {
    let mut config = CorpusConfig::default();
    config.graph.n_neighbors = 5;
    config.settle.background = false;
    config.settle.global_every = 0;
    config.layout.epochs = 60;
    config.layout.local_epochs = 15;
    config
}

/// Opens a fresh corpus in its own temporary directory.
pub fn create_test_corpus(config: CorpusConfig) -> (Corpus, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let corpus = Corpus::open_at(temp_dir.path().join("corpus"), config)
        .expect("Failed to open corpus");
    (corpus, temp_dir)
}

/// `count` unit vectors of dimension `dim` drawn around a few cluster centers.
pub fn clustered_vectors(count: usize, dim: usize, clusters: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let centers: Vec<Vec<f32>> = (0..clusters.max(1))
        .map(|_| (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect();

    (0..count)
        .map(|i| {
            let center = &centers[i % centers.len()];
            let v: Vec<f32> = center
                .iter()
                .map(|c| c + rng.random_range(-0.15..0.15))
                .collect();
            normalize(v)
        })
        .collect()
}

pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

pub fn chunks_for(source: &str, vectors: &[Vec<f32>]) -> Vec<NewChunk> {
    vectors
        .iter()
        .enumerate()
        .map(|(i, v)| NewChunk::new(source, i as u32, format!("{source} chunk {i}"), v.clone()))
        .collect()
}

pub fn distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
