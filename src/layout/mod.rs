//! Low-dimensional layout of the corpus.
//!
//! [`LayoutState`] maps every placed chunk to its current coordinates, the
//! coordinates it was first given (used to recover from divergence) and its
//! lifecycle state.

pub mod curve;
pub mod init;
pub mod optimizer;
pub mod pca;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ChunkId, ChunkState, LayoutDims};

pub use curve::CurveShape;
pub use optimizer::{Mobility, OptimizeReport, Optimizer, OptimizerParams, Workspace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub coords: Vec<f32>,
    /// Position assigned when the point was placed
    pub initial: Vec<f32>,
    pub state: ChunkState,
    /// Position at the end of the last global settle
    pub settled: Option<Vec<f32>>,
}

impl Placement {
    /// Center of the region a local settle may move this point within.
    pub fn anchor(&self) -> &[f32] {
        self.settled.as_deref().unwrap_or(&self.coords)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutState {
    dims: LayoutDims,
    points: BTreeMap<ChunkId, Placement>,
    /// Sorted ids for O(1) random access during negative sampling
    #[serde(skip)]
    roster: Vec<ChunkId>,
}

impl LayoutState {
    pub fn new(dims: LayoutDims) -> Self {
        Self {
            dims,
            points: BTreeMap::new(),
            roster: Vec::new(),
        }
    }

    /// Recomputes the roster after deserialization.
    pub fn rebuild_roster(&mut self) {
        self.roster = self.points.keys().copied().collect();
    }

    pub fn dims(&self) -> LayoutDims {
        self.dims
    }

    /// Places `id` at `coords`, which also become its initial position.
    ///
    /// Re-placing an existing point keeps its state from moving backwards.
    pub fn place(&mut self, id: ChunkId, coords: Vec<f32>, state: ChunkState) {
        let state = self
            .points
            .get(&id)
            .map_or(state, |old| old.state.advance(state));
        if let Err(pos) = self.roster.binary_search(&id) {
            self.roster.insert(pos, id);
        }
        self.points.insert(
            id,
            Placement {
                initial: coords.clone(),
                coords,
                state,
                settled: None,
            },
        );
    }

    pub fn get(&self, id: ChunkId) -> Option<&Placement> {
        self.points.get(&id)
    }

    pub fn coords(&self, id: ChunkId) -> Option<&[f32]> {
        self.points.get(&id).map(|p| p.coords.as_slice())
    }

    /// Overwrites the current coordinates of an existing point.
    pub fn set_coords(&mut self, id: ChunkId, coords: &[f32]) -> bool {
        match self.points.get_mut(&id) {
            Some(placement) => {
                placement.coords.clear();
                placement.coords.extend_from_slice(coords);
                true
            }
            None => false,
        }
    }

    /// Adds `delta` to the current coordinates of an existing point.
    pub fn displace(&mut self, id: ChunkId, delta: &[f32]) -> bool {
        match self.points.get_mut(&id) {
            Some(placement) => {
                for (c, d) in placement.coords.iter_mut().zip(delta) {
                    *c += d;
                }
                true
            }
            None => false,
        }
    }

    pub fn advance(&mut self, id: ChunkId, state: ChunkState) {
        if let Some(placement) = self.points.get_mut(&id) {
            placement.state = placement.state.advance(state);
        }
    }

    /// Records that `id` took part in a global settle at its current position.
    pub fn mark_settled(&mut self, id: ChunkId) {
        if let Some(placement) = self.points.get_mut(&id) {
            placement.state = placement.state.advance(ChunkState::Settled);
            placement.settled = Some(placement.coords.clone());
        }
    }

    pub fn remove(&mut self, id: ChunkId) -> Option<Placement> {
        if let Ok(pos) = self.roster.binary_search(&id) {
            self.roster.remove(pos);
        }
        self.points.remove(&id)
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.roster.clear();
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.points.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChunkId, &Placement)> {
        self.points.iter().map(|(id, p)| (*id, p))
    }

    pub fn ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.points.keys().copied()
    }

    /// Id at position `index` of the sorted roster.
    pub fn id_at(&self, index: usize) -> Option<ChunkId> {
        self.roster.get(index).copied()
    }

    /// Unweighted mean of all current coordinates.
    pub fn centroid(&self) -> Option<Vec<f32>> {
        init::weighted_centroid(
            self.points.values().map(|p| (p.coords.as_slice(), 1.0)),
            self.dims,
        )
    }
}
