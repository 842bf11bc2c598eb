//! Signed feature hashing: a model-free, deterministic embedding.

use crate::error::{CorpusError, CorpusResult};
use crate::types::EmbeddingDimension;

use super::EmbeddingGenerator;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Hashes every token into one of `dimension` buckets with a ±1 sign and
/// L2-normalizes the result.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimension: EmbeddingDimension,
}

impl HashingEmbedder {
    pub fn new(dimension: EmbeddingDimension) -> Self {
        Self { dimension }
    }

    fn embed_one(&self, text: &str) -> CorpusResult<Vec<f32>> {
        let dim = self.dimension.get();
        let mut vector = vec![0.0f32; dim];
        let mut tokens = 0usize;
        for token in tokenize(text) {
            let hash = fnv1a(&token);
            let bucket = (hash % dim as u64) as usize;
            vector[bucket] += if hash & 1 == 0 { 1.0 } else { -1.0 };
            tokens += 1;
        }
        if tokens == 0 {
            return Err(CorpusError::EmbeddingUnavailable {
                reason: "text has no indexable tokens".to_string(),
            });
        }
        Ok(l2_normalize(vector))
    }
}

impl EmbeddingGenerator for HashingEmbedder {
    fn generate_embeddings(&self, texts: &[&str]) -> CorpusResult<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed_one(text)).collect()
    }

    fn dimension(&self) -> EmbeddingDimension {
        self.dimension
    }
}

/// Lowercased alphanumeric tokens of two or more characters. Apostrophes
/// inside words are kept.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|s| s.trim_matches('\''))
        .filter(|s| s.chars().count() > 1)
        .map(str::to_string)
        .collect()
}

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v
        .iter()
        .map(|x| f64::from(*x) * f64::from(*x))
        .sum::<f64>()
        .sqrt() as f32;
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
