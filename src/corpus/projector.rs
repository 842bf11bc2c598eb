//! Incremental placement of a single chunk.
//!
//! [`project`] works on a read-only view of the corpus and returns a
//! [`Projection`] describing every change the insert makes. The caller
//! applies it under the write lock, which keeps the expensive part (neighbor
//! search and the local settle) off the critical section.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::graph::NeighborGraph;
use crate::layout::{LayoutState, Mobility, OptimizeReport, Optimizer, Workspace, init};
use crate::types::ChunkId;

use super::{CorpusConfig, CorpusState};

/// Bounds on the number of fixed points drawn as repulsion targets.
const NEGATIVE_POOL_MIN: usize = 16;
const NEGATIVE_POOL_MAX: usize = 256;

/// Multiplier used to decorrelate per-chunk random streams.
const SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Every change an insert makes to graph and layout.
#[derive(Debug, Clone)]
pub(crate) struct Projection {
    pub id: ChunkId,
    /// The chunk replaces an existing one with the same identifier
    pub replaced: bool,
    /// Sorted `(neighbor, distance)` list of the new chunk
    pub neighbors: Vec<(ChunkId, f32)>,
    /// Chunks whose lists are offered the new chunk
    pub offers: Vec<(ChunkId, f32)>,
    pub initial: Vec<f32>,
    pub coords: Vec<f32>,
    /// Movement of existing points during the local settle
    pub displacements: Vec<(ChunkId, Vec<f32>)>,
    pub report: OptimizeReport,
}

/// Computes neighbors, initial position and local settle for `id`.
pub(crate) fn project(
    state: &CorpusState,
    config: &CorpusConfig,
    optimizer: &Optimizer,
    id: ChunkId,
    embedding: &[f32],
    replaced: bool,
) -> Projection {
    let k = state.builder.n_neighbors();

    // A wider candidate set approximates the chunks that will list the new one.
    // `id` is excluded because it may already be stored (overwrite, recovery).
    let candidates = state
        .builder
        .nearest(&state.store, embedding, k * 2, Some(id));
    let neighbors: Vec<(ChunkId, f32)> = candidates.iter().take(k).copied().collect();

    let mut focus: BTreeSet<ChunkId> = candidates.iter().map(|(c, _)| *c).collect();
    focus.insert(id);
    let mut scratch = state.graph.excerpt(&focus);
    link(&mut scratch, id, replaced, &neighbors, &candidates, k);

    let initial = initial_position(&state.layout, &scratch, id, config);
    let (coords, displacements, report) =
        settle_locally(&state.layout, &scratch, config, optimizer, id, &initial);

    Projection {
        id,
        replaced,
        neighbors,
        offers: candidates,
        initial,
        coords,
        displacements,
        report,
    }
}

/// Graph mutations of an insert. Applied to the scratch excerpt here and to
/// the live graph when the projection is committed.
pub(crate) fn link(
    graph: &mut NeighborGraph,
    id: ChunkId,
    replaced: bool,
    neighbors: &[(ChunkId, f32)],
    offers: &[(ChunkId, f32)],
    k: usize,
) {
    if replaced {
        graph.remove(id);
    }
    graph.set_neighbors(id, neighbors);
    for &(other, distance) in offers {
        graph.offer(other, id, distance, k);
    }
}

/// Weighted centroid of the neighbors' coordinates.
///
/// Falls back to the centroid of the whole layout, then to a stable random
/// point when the layout is empty.
fn initial_position(
    layout: &LayoutState,
    graph: &NeighborGraph,
    id: ChunkId,
    config: &CorpusConfig,
) -> Vec<f32> {
    let weighted = graph
        .neighbors(id)
        .unwrap_or_default()
        .iter()
        .filter(|n| n.id != id)
        .filter_map(|n| layout.coords(n.id).map(|coords| (coords, n.weight)));

    init::weighted_centroid(weighted, layout.dims())
        .or_else(|| layout.centroid())
        .unwrap_or_else(|| {
            init::scatter(
                id,
                layout.dims(),
                config.layout.seed,
                config.layout.init_radius,
            )
        })
}

/// Short optimization over the new point's neighborhood.
///
/// The new point is free, its direct neighbors may move within the
/// containment bound around their last settled position, and everything
/// else in the workspace is fixed.
fn settle_locally(
    layout: &LayoutState,
    graph: &NeighborGraph,
    config: &CorpusConfig,
    optimizer: &Optimizer,
    id: ChunkId,
    initial: &[f32],
) -> (Vec<f32>, Vec<(ChunkId, Vec<f32>)>, OptimizeReport) {
    let adjacent = graph.adjacent(id);
    let mut focus = adjacent.clone();
    focus.insert(id);
    let edges = graph.edges_touching(&focus);

    let mut ws = Workspace::new(layout.dims());
    ws.add_row(id, initial, initial, Mobility::Free);

    let bounded = Mobility::Bounded {
        radius: config.settle.containment_bound.max(0.0),
    };
    for &other in &adjacent {
        if let Some(placement) = layout.get(other) {
            ws.add_anchored_row(
                other,
                &placement.coords,
                &placement.initial,
                placement.anchor(),
                bounded,
            );
        }
    }
    for edge in &edges {
        for end in [edge.a, edge.b] {
            if !ws.contains(end)
                && let Some(placement) = layout.get(end)
            {
                ws.add_row(end, &placement.coords, &placement.initial, Mobility::Fixed);
            }
        }
        ws.add_edge(edge.a, edge.b, edge.weight);
    }

    let seed = config.layout.seed ^ u64::from(id.get()).wrapping_mul(SEED_MIX);
    add_negative_pool(&mut ws, layout, id, seed, config.layout.negative_sample_rate);

    let local = Optimizer::new(optimizer.params().with_seed(seed));
    let report = local.run(&mut ws, config.layout.local_epochs);

    let coords = ws.coords(id).map(<[f32]>::to_vec).unwrap_or_else(|| initial.to_vec());
    let displacements = ws
        .iter()
        .filter(|(other, _, mobility, delta)| {
            *other != id
                && matches!(mobility, Mobility::Bounded { .. })
                && delta.iter().any(|d| *d != 0.0)
        })
        .map(|(other, _, _, delta)| (other, delta))
        .collect();

    (coords, displacements, report)
}

/// Adds randomly drawn placed points as fixed repulsion targets.
fn add_negative_pool(
    ws: &mut Workspace,
    layout: &LayoutState,
    id: ChunkId,
    seed: u64,
    negative_rate: usize,
) {
    if layout.is_empty() {
        return;
    }
    let pool = (ws.edge_count() * negative_rate.max(1))
        .clamp(NEGATIVE_POOL_MIN, NEGATIVE_POOL_MAX)
        .min(layout.len());
    let mut rng = StdRng::seed_from_u64(seed.rotate_left(17));
    for _ in 0..pool {
        let Some(other) = layout.id_at(rng.random_range(0..layout.len())) else {
            continue;
        };
        if other == id || ws.contains(other) {
            continue;
        }
        if let Some(placement) = layout.get(other) {
            ws.add_row(other, &placement.coords, &placement.initial, Mobility::Fixed);
        }
    }
}
