//! Distance functions over high-dimensional embeddings.

use crate::config::Metric;

/// Distances below this are rounding noise and count as identical.
pub const DISTANCE_EPSILON: f32 = 1e-6;

/// Cosine similarity between two vectors, 0 when either has zero norm.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

impl Metric {
    /// Non-negative distance between `a` and `b`. Zero means identical.
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        let d = match self {
            // 1 - cos of identical vectors lands anywhere in about ±1e-7
            Metric::Cosine => 1.0 - cosine_similarity(a, b),
            Metric::Euclidean => euclidean_distance(a, b),
        };
        if d.is_nan() {
            f32::INFINITY
        } else if d < DISTANCE_EPSILON {
            0.0
        } else {
            d
        }
    }
}
