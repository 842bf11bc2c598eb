//! Weighted k-nearest-neighbor graph over chunk embeddings.
//!
//! Each chunk owns a directed neighbor list of `(id, distance, weight)`
//! ordered by distance, with weights calibrated per list (see [`calibrate`]).
//! The layout consumes the symmetrized view: the weight between `a` and `b`
//! is the fuzzy union `w₁ + w₂ − w₁·w₂` of both directed weights.

pub mod calibrate;
pub mod index;
pub mod metric;

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{GraphConfig, Metric};
use crate::error::CorpusResult;
use crate::store::VectorStore;
use crate::types::ChunkId;

pub use calibrate::{Calibration, calibrate};
pub use index::{BruteForceIndex, NeighborIndex, ProjectionIndex};

/// One entry of a directed neighbor list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: ChunkId,
    pub distance: f32,
    pub weight: f32,
}

/// Undirected edge of the symmetrized graph, `a < b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub a: ChunkId,
    pub b: ChunkId,
    pub weight: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeighborGraph {
    lists: BTreeMap<ChunkId, Vec<Neighbor>>,
    /// 1.0 is pure fuzzy union, 0.0 pure fuzzy intersection
    mix_ratio: f32,
    /// Who lists whom; derived from `lists`
    #[serde(skip)]
    reverse: BTreeMap<ChunkId, BTreeSet<ChunkId>>,
}

impl NeighborGraph {
    pub fn new(mix_ratio: f32) -> Self {
        Self {
            lists: BTreeMap::new(),
            mix_ratio: mix_ratio.clamp(0.0, 1.0),
            reverse: BTreeMap::new(),
        }
    }

    /// Recomputes the reverse adjacency after deserialization.
    pub fn rebuild_reverse(&mut self) {
        self.reverse.clear();
        for (owner, list) in &self.lists {
            for neighbor in list {
                self.reverse.entry(neighbor.id).or_default().insert(*owner);
            }
        }
    }

    /// Replaces the neighbor list of `id` with calibrated weights.
    ///
    /// `raw` must be sorted ascending by distance and must not contain `id`.
    pub fn set_neighbors(&mut self, id: ChunkId, raw: &[(ChunkId, f32)]) {
        self.detach_list(id);
        let list = weigh(raw);
        for neighbor in &list {
            self.reverse.entry(neighbor.id).or_default().insert(id);
        }
        self.lists.insert(id, list);
    }

    fn detach_list(&mut self, id: ChunkId) {
        if let Some(old) = self.lists.remove(&id) {
            for neighbor in old {
                if let Some(owners) = self.reverse.get_mut(&neighbor.id) {
                    owners.remove(&id);
                    if owners.is_empty() {
                        self.reverse.remove(&neighbor.id);
                    }
                }
            }
        }
    }

    /// Offers `candidate` at `distance` to the list of `id`.
    ///
    /// The candidate is admitted when the list has fewer than `k` entries or
    /// the candidate is closer than the current k-th neighbor; the list is then
    /// recalibrated. Returns whether the list changed.
    pub fn offer(&mut self, id: ChunkId, candidate: ChunkId, distance: f32, k: usize) -> bool {
        let Some(list) = self.lists.get(&id) else {
            return false;
        };
        if k == 0 || candidate == id || list.iter().any(|n| n.id == candidate) {
            return false;
        }
        let admitted = list.len() < k || list.last().is_some_and(|last| distance < last.distance);
        if !admitted {
            return false;
        }

        let mut raw: Vec<(ChunkId, f32)> = list.iter().map(|n| (n.id, n.distance)).collect();
        let pos = raw
            .iter()
            .position(|(other, d)| distance < *d || (distance == *d && candidate < *other))
            .unwrap_or(raw.len());
        raw.insert(pos, (candidate, distance));
        raw.truncate(k);
        self.set_neighbors(id, &raw);
        true
    }

    /// Drops `id` and returns the chunks whose lists referenced it.
    pub fn remove(&mut self, id: ChunkId) -> Vec<ChunkId> {
        self.detach_list(id);
        let owners: Vec<ChunkId> = self
            .reverse
            .remove(&id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for owner in &owners {
            if let Some(list) = self.lists.get(owner) {
                let raw: Vec<(ChunkId, f32)> = list
                    .iter()
                    .filter(|n| n.id != id)
                    .map(|n| (n.id, n.distance))
                    .collect();
                self.set_neighbors(*owner, &raw);
            }
        }
        owners
    }

    pub fn clear(&mut self) {
        self.lists.clear();
        self.reverse.clear();
    }

    /// Copy of the lists of `focus` and of every chunk that lists one of them.
    ///
    /// Mutations touching only `focus` produce the same lists on the excerpt
    /// as on the full graph.
    pub fn excerpt(&self, focus: &BTreeSet<ChunkId>) -> NeighborGraph {
        let mut members = focus.clone();
        for id in focus {
            if let Some(owners) = self.reverse.get(id) {
                members.extend(owners.iter().copied());
            }
        }
        let mut out = NeighborGraph::new(self.mix_ratio);
        for id in members {
            if let Some(list) = self.lists.get(&id) {
                out.lists.insert(id, list.clone());
            }
        }
        out.rebuild_reverse();
        out
    }

    pub fn mix_ratio(&self) -> f32 {
        self.mix_ratio
    }

    pub fn neighbors(&self, id: ChunkId) -> Option<&[Neighbor]> {
        self.lists.get(&id).map(Vec::as_slice)
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.lists.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.lists.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Weight of `b` in the list of `a`, 0 when absent.
    pub fn directed_weight(&self, a: ChunkId, b: ChunkId) -> f32 {
        self.lists
            .get(&a)
            .and_then(|list| list.iter().find(|n| n.id == b))
            .map_or(0.0, |n| n.weight)
    }

    /// Symmetrized weight between `a` and `b`.
    pub fn edge_weight(&self, a: ChunkId, b: ChunkId) -> f32 {
        combine(
            self.directed_weight(a, b),
            self.directed_weight(b, a),
            self.mix_ratio,
        )
    }

    /// Every undirected edge once, ordered by `(a, b)`.
    pub fn symmetric_edges(&self) -> Vec<Edge> {
        let mut pairs: BTreeMap<(ChunkId, ChunkId), (f32, f32)> = BTreeMap::new();
        for (owner, list) in &self.lists {
            for neighbor in list {
                if *owner < neighbor.id {
                    pairs.entry((*owner, neighbor.id)).or_default().0 = neighbor.weight;
                } else {
                    pairs.entry((neighbor.id, *owner)).or_default().1 = neighbor.weight;
                }
            }
        }
        pairs
            .into_iter()
            .map(|((a, b), (w1, w2))| Edge {
                a,
                b,
                weight: combine(w1, w2, self.mix_ratio),
            })
            .filter(|edge| edge.weight > 0.0)
            .collect()
    }

    /// Undirected edges with at least one endpoint in `focus`.
    pub fn edges_touching(&self, focus: &BTreeSet<ChunkId>) -> Vec<Edge> {
        let mut pairs = BTreeSet::new();
        for id in focus {
            if let Some(list) = self.lists.get(id) {
                for neighbor in list {
                    pairs.insert(ordered(*id, neighbor.id));
                }
            }
            if let Some(owners) = self.reverse.get(id) {
                for owner in owners {
                    pairs.insert(ordered(*id, *owner));
                }
            }
        }
        pairs
            .into_iter()
            .map(|(a, b)| Edge {
                a,
                b,
                weight: self.edge_weight(a, b),
            })
            .filter(|edge| edge.weight > 0.0)
            .collect()
    }

    /// Chunks whose lists contain `id`.
    pub fn owners(&self, id: ChunkId) -> Vec<ChunkId> {
        self.reverse
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Chunks adjacent to `id` in either direction.
    pub fn adjacent(&self, id: ChunkId) -> BTreeSet<ChunkId> {
        let mut out: BTreeSet<ChunkId> = self
            .lists
            .get(&id)
            .map(|list| list.iter().map(|n| n.id).collect())
            .unwrap_or_default();
        if let Some(owners) = self.reverse.get(&id) {
            out.extend(owners.iter().copied());
        }
        out
    }
}

fn ordered(a: ChunkId, b: ChunkId) -> (ChunkId, ChunkId) {
    if a < b { (a, b) } else { (b, a) }
}

/// Blend of fuzzy union and fuzzy intersection of two directed weights.
#[inline]
pub fn combine(w1: f32, w2: f32, mix_ratio: f32) -> f32 {
    let product = w1 * w2;
    let union = w1 + w2 - product;
    mix_ratio * union + (1.0 - mix_ratio) * product
}

fn weigh(raw: &[(ChunkId, f32)]) -> Vec<Neighbor> {
    let distances: Vec<f32> = raw.iter().map(|(_, d)| *d).collect();
    let Some(cal) = calibrate(&distances) else {
        return Vec::new();
    };
    raw.iter()
        .map(|&(id, distance)| Neighbor {
            id,
            distance,
            weight: cal.weight(distance),
        })
        .collect()
}

/// Computes neighbor lists against the stored corpus.
///
/// Holds the approximate index, which is kept in sync with the store by the
/// corpus write path, and picks exact or approximate lookup by corpus size.
#[derive(Debug)]
pub struct GraphBuilder {
    metric: Metric,
    n_neighbors: usize,
    approximate_threshold: usize,
    exact: BruteForceIndex,
    approximate: ProjectionIndex,
}

impl GraphBuilder {
    pub fn new(config: &GraphConfig, seed: u64) -> Self {
        Self {
            metric: config.metric,
            n_neighbors: config.n_neighbors.max(1),
            approximate_threshold: config.approximate_threshold,
            exact: BruteForceIndex,
            approximate: ProjectionIndex::new(
                config.projection_tables,
                config.projection_bits,
                seed,
            ),
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn n_neighbors(&self) -> usize {
        self.n_neighbors
    }

    /// Index appropriate for a corpus of `corpus_size` chunks.
    pub fn index_for(&self, corpus_size: usize) -> &dyn NeighborIndex {
        if corpus_size > self.approximate_threshold {
            &self.approximate
        } else {
            &self.exact
        }
    }

    /// Registers an embedding with the approximate index.
    pub fn track(&mut self, id: ChunkId, embedding: &[f32]) {
        self.approximate.insert(id, embedding);
    }

    pub fn untrack(&mut self, id: ChunkId) {
        self.approximate.remove(id);
    }

    pub fn clear(&mut self) {
        self.approximate.clear();
    }

    /// Nearest stored chunks to an arbitrary vector.
    pub fn nearest(
        &self,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        exclude: Option<ChunkId>,
    ) -> Vec<(ChunkId, f32)> {
        self.index_for(store.len())
            .nearest(store, self.metric, query, k, exclude)
    }

    /// Ordered `(neighbor, distance)` list for a stored chunk.
    ///
    /// Exactly `k` entries unless the corpus holds `k` or fewer other chunks,
    /// in which case all of them.
    pub fn build_neighbors(
        &self,
        store: &VectorStore,
        id: ChunkId,
        k: usize,
    ) -> CorpusResult<Vec<(ChunkId, f32)>> {
        let record = store.get(id)?;
        Ok(self.nearest(store, &record.embedding, k, Some(id)))
    }

    /// Recomputes every neighbor list from scratch.
    pub fn rebuild(&self, store: &VectorStore, mix_ratio: f32) -> NeighborGraph {
        let ids: Vec<ChunkId> = store.list_all().map(|r| r.id).collect();
        let lists: Vec<(ChunkId, Vec<(ChunkId, f32)>)> = ids
            .par_iter()
            .map(|&id| {
                let raw = self
                    .build_neighbors(store, id, self.n_neighbors)
                    .unwrap_or_default();
                (id, raw)
            })
            .collect();

        let mut graph = NeighborGraph::new(mix_ratio);
        for (id, raw) in lists {
            graph.set_neighbors(id, &raw);
        }
        info!(
            chunks = graph.len(),
            index = self.index_for(store.len()).name(),
            "rebuilt neighbor graph"
        );
        graph
    }

    /// Whether `incremental` inserts since the last rebuild warrant a full one.
    pub fn needs_rebuild(&self, incremental: usize, corpus_size: usize, ratio: f32) -> bool {
        let threshold = ((corpus_size as f32) * ratio).ceil() as usize;
        let due = incremental > threshold.max(self.n_neighbors);
        if due {
            debug!(incremental, corpus_size, "neighbor graph rebuild due");
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewChunk;
    use tempfile::TempDir;

    fn id(n: u32) -> ChunkId {
        ChunkId::new_unchecked(n)
    }

    #[test]
    fn test_union_formula() {
        assert_eq!(combine(1.0, 0.0, 1.0), 1.0);
        assert!((combine(0.5, 0.5, 1.0) - 0.75).abs() < 1e-6);
        assert!((combine(0.5, 0.5, 0.0) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_edge_weight_is_symmetric() {
        let mut graph = NeighborGraph::new(1.0);
        graph.set_neighbors(id(1), &[(id(2), 0.1), (id(3), 0.5)]);
        graph.set_neighbors(id(2), &[(id(1), 0.1), (id(3), 0.2)]);
        graph.set_neighbors(id(3), &[(id(2), 0.2)]);

        for (a, b) in [(1, 2), (1, 3), (2, 3)] {
            let w1 = graph.directed_weight(id(a), id(b));
            let w2 = graph.directed_weight(id(b), id(a));
            let expected = w1 + w2 - w1 * w2;
            assert!((graph.edge_weight(id(a), id(b)) - expected).abs() < 1e-6);
            assert_eq!(
                graph.edge_weight(id(a), id(b)),
                graph.edge_weight(id(b), id(a))
            );
        }

        let edges = graph.symmetric_edges();
        assert_eq!(edges.len(), 3);
        assert!(edges.iter().all(|e| e.a < e.b));
        let e13 = edges.iter().find(|e| e.a == id(1) && e.b == id(3)).unwrap();
        assert!((e13.weight - graph.directed_weight(id(1), id(3))).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_neighbor_has_unit_weight() {
        let mut graph = NeighborGraph::new(1.0);
        graph.set_neighbors(id(1), &[(id(2), 0.3), (id(3), 0.6), (id(4), 0.9)]);
        let list = graph.neighbors(id(1)).unwrap();
        assert_eq!(list[0].weight, 1.0);
        assert!(list.windows(2).all(|w| w[0].weight > w[1].weight));
    }

    #[test]
    fn test_offer_admits_closer_candidates() {
        let mut graph = NeighborGraph::new(1.0);
        graph.set_neighbors(id(1), &[(id(2), 0.2), (id(3), 0.8)]);

        assert!(!graph.offer(id(1), id(4), 0.9, 2));
        assert!(graph.offer(id(1), id(4), 0.1, 2));
        let ids: Vec<ChunkId> = graph.neighbors(id(1)).unwrap().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![id(4), id(2)]);
        assert!(graph.adjacent(id(4)).contains(&id(1)));
        assert!(!graph.adjacent(id(3)).contains(&id(1)));
    }

    #[test]
    fn test_remove_repairs_referencing_lists() {
        let mut graph = NeighborGraph::new(1.0);
        graph.set_neighbors(id(1), &[(id(2), 0.2), (id(3), 0.4)]);
        graph.set_neighbors(id(2), &[(id(1), 0.2)]);
        graph.set_neighbors(id(3), &[(id(1), 0.4)]);

        let affected = graph.remove(id(1));
        assert_eq!(affected, vec![id(2), id(3)]);
        assert!(!graph.contains(id(1)));
        assert!(graph.neighbors(id(2)).unwrap().is_empty());
        assert!(graph.symmetric_edges().is_empty());
    }

    #[test]
    fn test_edges_touching_focus() {
        let mut graph = NeighborGraph::new(1.0);
        graph.set_neighbors(id(1), &[(id(2), 0.1)]);
        graph.set_neighbors(id(2), &[(id(1), 0.1)]);
        graph.set_neighbors(id(3), &[(id(4), 0.1)]);
        graph.set_neighbors(id(4), &[(id(3), 0.1)]);

        let focus: BTreeSet<ChunkId> = [id(2)].into_iter().collect();
        let edges = graph.edges_touching(&focus);
        assert_eq!(edges.len(), 1);
        assert_eq!((edges[0].a, edges[0].b), (id(1), id(2)));
    }

    #[test]
    fn test_excerpt_matches_full_graph_for_focus() {
        let mut graph = NeighborGraph::new(1.0);
        graph.set_neighbors(id(1), &[(id(2), 0.1), (id(3), 0.3)]);
        graph.set_neighbors(id(2), &[(id(1), 0.1)]);
        graph.set_neighbors(id(3), &[(id(4), 0.2)]);
        graph.set_neighbors(id(4), &[(id(3), 0.2)]);

        let focus: BTreeSet<ChunkId> = [id(3)].into_iter().collect();
        let mut excerpt = graph.excerpt(&focus);
        assert!(excerpt.contains(id(1)));
        assert!(!excerpt.contains(id(2)));

        graph.offer(id(3), id(5), 0.05, 2);
        excerpt.offer(id(3), id(5), 0.05, 2);
        assert_eq!(graph.neighbors(id(3)), excerpt.neighbors(id(3)));
        assert_eq!(graph.adjacent(id(3)), excerpt.adjacent(id(3)));
    }

    #[test]
    fn test_serde_round_trip_restores_reverse() {
        let mut graph = NeighborGraph::new(1.0);
        graph.set_neighbors(id(1), &[(id(2), 0.1)]);
        let bytes = bincode::serde::encode_to_vec(&graph, bincode::config::standard()).unwrap();
        let (mut loaded, _): (NeighborGraph, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        loaded.rebuild_reverse();
        assert!(loaded.adjacent(id(2)).contains(&id(1)));
    }

    #[test]
    fn test_builder_rebuild_lists_everyone() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = VectorStore::open(temp_dir.path()).unwrap();
        for (i, v) in [[1.0, 0.0], [0.9, 0.1], [0.0, 1.0], [0.1, 0.9]].iter().enumerate() {
            store
                .put(NewChunk::new("doc", i as u32, "t", v.to_vec()))
                .unwrap();
        }

        let config = GraphConfig {
            n_neighbors: 2,
            ..GraphConfig::default()
        };
        let builder = GraphBuilder::new(&config, 42);
        let graph = builder.rebuild(&store, 1.0);
        assert_eq!(graph.len(), 4);
        let first = graph.neighbors(id(1)).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, id(2));

        let lone = builder.build_neighbors(&store, id(3), 10).unwrap();
        assert_eq!(lone.len(), 3);
    }
}
