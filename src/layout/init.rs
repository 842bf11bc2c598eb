//! Initial positions for points that have nothing to be placed relative to.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{ChunkId, LayoutDims};

/// Stable pseudo-random position for `id` inside the cube `[-radius, radius]^d`.
///
/// Depends only on `(seed, id)`, so an isolated point lands in the same spot
/// no matter when or in which order it is inserted.
pub fn scatter(id: ChunkId, dims: LayoutDims, seed: u64, radius: f32) -> Vec<f32> {
    let mixed = seed ^ u64::from(id.get()).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let mut rng = StdRng::seed_from_u64(mixed);
    (0..dims.get())
        .map(|_| (rng.random::<f32>() * 2.0 - 1.0) * radius)
        .collect()
}

/// Weighted mean of `(coords, weight)` pairs. `None` when total weight is zero.
pub fn weighted_centroid<'a>(
    points: impl IntoIterator<Item = (&'a [f32], f32)>,
    dims: LayoutDims,
) -> Option<Vec<f32>> {
    let mut sum = vec![0.0f32; dims.get()];
    let mut total = 0.0f32;
    for (coords, weight) in points {
        if weight <= 0.0 || coords.iter().any(|c| !c.is_finite()) {
            continue;
        }
        for (acc, c) in sum.iter_mut().zip(coords) {
            *acc += c * weight;
        }
        total += weight;
    }
    (total > 0.0).then(|| sum.into_iter().map(|s| s / total).collect())
}
