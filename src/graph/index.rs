//! Nearest-neighbor lookup capability.
//!
//! Two implementations share the [`NeighborIndex`] trait:
//! - [`BruteForceIndex`] scans every stored embedding (exact, parallel via rayon)
//! - [`ProjectionIndex`] hashes embeddings with random hyperplanes into several
//!   bucket tables and only ranks the colliding candidates (approximate)
//!
//! The caller picks one by corpus size, so correctness tests can run against
//! the exact path while large corpora stay sub-linear per lookup.

use std::collections::{BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::trace;

use crate::config::Metric;
use crate::store::VectorStore;
use crate::types::ChunkId;

/// Capability for finding the nearest stored chunks to a query vector.
pub trait NeighborIndex: Send + Sync + std::fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Registers an embedding. Re-registering an id replaces its entry.
    fn insert(&mut self, id: ChunkId, embedding: &[f32]);

    fn remove(&mut self, id: ChunkId);

    fn clear(&mut self);

    /// Up to `k` nearest chunks to `query`, ascending by distance, ties by id.
    fn nearest(
        &self,
        store: &VectorStore,
        metric: Metric,
        query: &[f32],
        k: usize,
        exclude: Option<ChunkId>,
    ) -> Vec<(ChunkId, f32)>;
}

/// Keeps the `k` smallest `(id, distance)` pairs, ordered by distance then id.
pub fn select_top_k(mut scored: Vec<(ChunkId, f32)>, k: usize) -> Vec<(ChunkId, f32)> {
    let by_distance =
        |a: &(ChunkId, f32), b: &(ChunkId, f32)| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0));
    if scored.len() > k && k > 0 {
        scored.select_nth_unstable_by(k - 1, by_distance);
        scored.truncate(k);
    } else if k == 0 {
        scored.clear();
    }
    scored.sort_by(by_distance);
    scored
}

/// Exact search over every stored embedding.
#[derive(Debug, Default, Clone, Copy)]
pub struct BruteForceIndex;

impl NeighborIndex for BruteForceIndex {
    fn name(&self) -> &'static str {
        "brute-force"
    }

    fn insert(&mut self, _id: ChunkId, _embedding: &[f32]) {}

    fn remove(&mut self, _id: ChunkId) {}

    fn clear(&mut self) {}

    fn nearest(
        &self,
        store: &VectorStore,
        metric: Metric,
        query: &[f32],
        k: usize,
        exclude: Option<ChunkId>,
    ) -> Vec<(ChunkId, f32)> {
        let records: Vec<_> = store.list_all().collect();
        let scored: Vec<(ChunkId, f32)> = records
            .par_iter()
            .filter(|record| Some(record.id) != exclude)
            .map(|record| (record.id, metric.distance(query, &record.embedding)))
            .collect();
        select_top_k(scored, k)
    }
}

#[derive(Debug, Clone)]
struct ProjectionTable {
    /// Random unit hyperplanes (bits x dimension)
    hyperplanes: Vec<Vec<f32>>,
    buckets: HashMap<u64, Vec<ChunkId>>,
}

impl ProjectionTable {
    fn new(rng: &mut StdRng, bits: usize, dimension: usize) -> Self {
        let hyperplanes = (0..bits)
            .map(|_| {
                let mut plane: Vec<f32> = (0..dimension)
                    .map(|_| rng.random::<f32>() * 2.0 - 1.0)
                    .collect();
                let norm: f32 = plane.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for x in &mut plane {
                        *x /= norm;
                    }
                }
                plane
            })
            .collect();
        Self {
            hyperplanes,
            buckets: HashMap::new(),
        }
    }

    /// One bit per hyperplane, set when the embedding lies on its positive side
    fn hash(&self, embedding: &[f32]) -> u64 {
        let mut bucket = 0u64;
        for (i, plane) in self.hyperplanes.iter().enumerate() {
            let dot: f32 = embedding.iter().zip(plane.iter()).map(|(a, b)| a * b).sum();
            if dot > 0.0 {
                bucket |= 1 << i;
            }
        }
        bucket
    }
}

/// Random-projection bucketing over several independent tables.
#[derive(Debug, Clone)]
pub struct ProjectionIndex {
    seed: u64,
    tables_wanted: usize,
    bits: usize,
    tables: Vec<ProjectionTable>,
    /// Bucket of each id per table, for removal
    assignments: HashMap<ChunkId, Vec<u64>>,
}

impl ProjectionIndex {
    /// Hyperplanes are drawn lazily once the embedding dimension is known.
    pub fn new(tables: usize, bits: usize, seed: u64) -> Self {
        Self {
            seed,
            tables_wanted: tables.max(1),
            bits: bits.clamp(1, 63),
            tables: Vec::new(),
            assignments: HashMap::new(),
        }
    }

    fn ensure_tables(&mut self, dimension: usize) {
        if !self.tables.is_empty() {
            return;
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        self.tables = (0..self.tables_wanted)
            .map(|_| ProjectionTable::new(&mut rng, self.bits, dimension))
            .collect();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Ids colliding with `query` in any table, widened by single-bit probes
    /// until at least `want` candidates are collected.
    fn candidates(&self, query: &[f32], want: usize) -> BTreeSet<ChunkId> {
        let mut found = BTreeSet::new();
        let hashes: Vec<u64> = self.tables.iter().map(|t| t.hash(query)).collect();

        for (table, hash) in self.tables.iter().zip(&hashes) {
            if let Some(ids) = table.buckets.get(hash) {
                found.extend(ids.iter().copied());
            }
        }

        if found.len() < want {
            for (table, hash) in self.tables.iter().zip(&hashes) {
                for bit in 0..self.bits {
                    if let Some(ids) = table.buckets.get(&(hash ^ (1 << bit))) {
                        found.extend(ids.iter().copied());
                    }
                }
            }
        }
        found
    }
}

impl NeighborIndex for ProjectionIndex {
    fn name(&self) -> &'static str {
        "random-projection"
    }

    fn insert(&mut self, id: ChunkId, embedding: &[f32]) {
        self.remove(id);
        self.ensure_tables(embedding.len());
        let hashes: Vec<u64> = self
            .tables
            .iter_mut()
            .map(|table| {
                let hash = table.hash(embedding);
                table.buckets.entry(hash).or_default().push(id);
                hash
            })
            .collect();
        self.assignments.insert(id, hashes);
    }

    fn remove(&mut self, id: ChunkId) {
        let Some(hashes) = self.assignments.remove(&id) else {
            return;
        };
        for (table, hash) in self.tables.iter_mut().zip(hashes) {
            if let Some(ids) = table.buckets.get_mut(&hash) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    table.buckets.remove(&hash);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.tables.clear();
        self.assignments.clear();
    }

    fn nearest(
        &self,
        store: &VectorStore,
        metric: Metric,
        query: &[f32],
        k: usize,
        exclude: Option<ChunkId>,
    ) -> Vec<(ChunkId, f32)> {
        let candidates = self.candidates(query, k.saturating_mul(2) + 1);
        trace!(candidates = candidates.len(), "projection candidates");

        let scored: Vec<(ChunkId, f32)> = candidates
            .into_iter()
            .filter(|id| Some(*id) != exclude)
            .filter_map(|id| {
                store
                    .get(id)
                    .ok()
                    .map(|record| (id, metric.distance(query, &record.embedding)))
            })
            .collect();

        if scored.len() < k.min(store.len().saturating_sub(usize::from(exclude.is_some()))) {
            // Buckets too sparse around this query; fall back to the exact scan
            return BruteForceIndex.nearest(store, metric, query, k, exclude);
        }
        select_top_k(scored, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewChunk;
    use tempfile::TempDir;

    fn seeded_store(dir: &std::path::Path, n: usize) -> VectorStore {
        let mut store = VectorStore::open(dir).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..n {
            let embedding: Vec<f32> = (0..16).map(|_| rng.random::<f32>() - 0.5).collect();
            store
                .put(NewChunk::new("bench", i as u32, format!("chunk {i}"), embedding))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_select_top_k_orders_and_breaks_ties() {
        let id = ChunkId::new_unchecked;
        let scored = vec![(id(3), 0.5), (id(1), 0.2), (id(2), 0.2), (id(4), 0.9)];
        let top = select_top_k(scored, 3);
        assert_eq!(top, vec![(id(1), 0.2), (id(2), 0.2), (id(3), 0.5)]);
        assert!(select_top_k(vec![(id(1), 0.1)], 0).is_empty());
    }

    #[test]
    fn test_brute_force_excludes_self() {
        let temp_dir = TempDir::new().unwrap();
        let store = seeded_store(temp_dir.path(), 20);
        let first = store.list_all().next().unwrap();

        let hits = BruteForceIndex.nearest(
            &store,
            Metric::Euclidean,
            &first.embedding,
            5,
            Some(first.id),
        );
        assert_eq!(hits.len(), 5);
        assert!(hits.iter().all(|(id, _)| *id != first.id));

        let with_self =
            BruteForceIndex.nearest(&store, Metric::Euclidean, &first.embedding, 1, None);
        assert_eq!(with_self[0].0, first.id);
    }

    #[test]
    fn test_fewer_points_than_k() {
        let temp_dir = TempDir::new().unwrap();
        let store = seeded_store(temp_dir.path(), 3);
        let first = store.list_all().next().unwrap();
        let hits =
            BruteForceIndex.nearest(&store, Metric::Cosine, &first.embedding, 10, Some(first.id));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_projection_index_finds_exact_duplicate() {
        let temp_dir = TempDir::new().unwrap();
        let store = seeded_store(temp_dir.path(), 200);

        let mut index = ProjectionIndex::new(4, 6, 42);
        for record in store.list_all() {
            index.insert(record.id, &record.embedding);
        }
        assert_eq!(index.len(), 200);

        let target = store.list_all().nth(17).unwrap();
        let hits = index.nearest(&store, Metric::Cosine, &target.embedding, 5, None);
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].0, target.id);

        index.remove(target.id);
        assert_eq!(index.len(), 199);
    }

    #[test]
    fn test_projection_hashing_is_seeded() {
        let mut a = ProjectionIndex::new(2, 8, 9);
        let mut b = ProjectionIndex::new(2, 8, 9);
        let v = [0.3, -0.2, 0.9, 0.1];
        a.insert(ChunkId::new_unchecked(1), &v);
        b.insert(ChunkId::new_unchecked(1), &v);
        assert_eq!(
            a.assignments[&ChunkId::new_unchecked(1)],
            b.assignments[&ChunkId::new_unchecked(1)]
        );
    }
}
