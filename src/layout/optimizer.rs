//! Epoch-based stochastic layout optimization.
//!
//! Each undirected edge is sampled in both directions on a schedule
//! proportional to its weight. A sample pulls the endpoints together along
//! the gradient of `1 / (1 + a·d^{2b})` and then pushes the head away from a
//! few randomly drawn non-neighbors. Every gradient component is clipped to
//! `max_step` and the learning rate decays linearly to zero, so a run always
//! takes exactly `epochs` epochs. All randomness comes from a seeded
//! [`StdRng`]: the same workspace, seed and epoch count give the same output.
//!
//! After every epoch the movable rows are checked against `coordinate_bound`.
//! Diverged rows are reset to their initial position and the epoch is rerun
//! from its checkpoint once; rows that diverge again are frozen at their
//! initial position and reported as corrupted.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::LayoutConfig;
use crate::graph::Edge;
use crate::layout::{CurveShape, LayoutState};
use crate::types::{ChunkId, LayoutDims};

/// Distance added to the repulsion denominator to keep it finite.
const REPULSION_EPSILON: f32 = 0.001;

/// How much a row may move during a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mobility {
    Free,
    /// May move at most `radius` away from its anchor
    Bounded { radius: f32 },
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerParams {
    pub shape: CurveShape,
    pub learning_rate: f32,
    pub negative_sample_rate: usize,
    pub repulsion_strength: f32,
    pub max_step: f32,
    pub coordinate_bound: f32,
    pub seed: u64,
}

impl OptimizerParams {
    pub fn from_config(config: &LayoutConfig) -> Self {
        Self {
            shape: CurveShape::fit(config.spread, config.min_dist),
            learning_rate: config.learning_rate,
            negative_sample_rate: config.negative_sample_rate,
            repulsion_strength: config.repulsion_strength,
            max_step: config.max_step.abs(),
            coordinate_bound: config.coordinate_bound.abs(),
            seed: config.seed,
        }
    }

    /// Same parameters with a different random stream.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Outcome of an optimizer run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizeReport {
    pub epochs: usize,
    pub edges: usize,
    /// Rows that diverged once and recovered after being reset
    pub recovered: Vec<ChunkId>,
    /// Rows that diverged again after the retry; frozen at their initial position
    pub corrupted: Vec<ChunkId>,
}

/// Dense, row-indexed copy of the points and edges a run operates on.
#[derive(Debug, Clone)]
pub struct Workspace {
    dim: usize,
    ids: Vec<ChunkId>,
    rows: HashMap<ChunkId, usize>,
    coords: Vec<f32>,
    /// Coordinates when the row was added
    start: Vec<f32>,
    /// Centers of the containment balls of bounded rows
    anchors: Vec<f32>,
    initial: Vec<f32>,
    mobility: Vec<Mobility>,
    edges: Vec<(usize, usize, f32)>,
    adjacency: Vec<Vec<usize>>,
}

impl Workspace {
    pub fn new(dims: LayoutDims) -> Self {
        Self {
            dim: dims.get(),
            ids: Vec::new(),
            rows: HashMap::new(),
            coords: Vec::new(),
            start: Vec::new(),
            anchors: Vec::new(),
            initial: Vec::new(),
            mobility: Vec::new(),
            edges: Vec::new(),
            adjacency: Vec::new(),
        }
    }

    /// Every placed point as a free row, plus all edges between them.
    pub fn from_layout(layout: &LayoutState, edges: &[Edge]) -> Self {
        let mut ws = Self::new(layout.dims());
        for (id, placement) in layout.iter() {
            ws.add_row(id, &placement.coords, &placement.initial, Mobility::Free);
        }
        for edge in edges {
            ws.add_edge(edge.a, edge.b, edge.weight);
        }
        ws
    }

    /// Adds a row, or returns the existing row for `id` unchanged.
    pub fn add_row(
        &mut self,
        id: ChunkId,
        coords: &[f32],
        initial: &[f32],
        mobility: Mobility,
    ) -> usize {
        self.add_anchored_row(id, coords, initial, coords, mobility)
    }

    /// Like [`add_row`](Self::add_row), with the containment ball of a
    /// bounded row centered on `anchor` instead of the starting position.
    pub fn add_anchored_row(
        &mut self,
        id: ChunkId,
        coords: &[f32],
        initial: &[f32],
        anchor: &[f32],
        mobility: Mobility,
    ) -> usize {
        if let Some(&row) = self.rows.get(&id) {
            return row;
        }
        let row = self.ids.len();
        self.ids.push(id);
        self.rows.insert(id, row);
        self.coords.extend(fit_dim(coords, self.dim));
        self.start.extend(fit_dim(coords, self.dim));
        self.anchors.extend(fit_dim(anchor, self.dim));
        self.initial.extend(fit_dim(initial, self.dim).map(|c| {
            if c.is_finite() { c } else { 0.0 }
        }));
        self.mobility.push(mobility);
        self.adjacency.push(Vec::new());
        row
    }

    /// Adds an undirected edge between two existing rows.
    pub fn add_edge(&mut self, a: ChunkId, b: ChunkId, weight: f32) -> bool {
        let (Some(&ra), Some(&rb)) = (self.rows.get(&a), self.rows.get(&b)) else {
            return false;
        };
        if ra == rb || weight <= 0.0 || !weight.is_finite() {
            return false;
        }
        self.edges.push((ra, rb, weight));
        for (from, to) in [(ra, rb), (rb, ra)] {
            if let Err(pos) = self.adjacency[from].binary_search(&to) {
                self.adjacency[from].insert(pos, to);
            }
        }
        true
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.rows.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn coords(&self, id: ChunkId) -> Option<&[f32]> {
        self.rows.get(&id).map(|&row| self.row(row))
    }

    /// Current coordinates, mobility and displacement since the run started.
    pub fn iter(&self) -> impl Iterator<Item = (ChunkId, &[f32], Mobility, Vec<f32>)> + '_ {
        self.ids.iter().enumerate().map(|(row, id)| {
            let current = self.row(row);
            let start = &self.start[row * self.dim..(row + 1) * self.dim];
            let delta = current.iter().zip(start).map(|(c, s)| c - s).collect();
            (*id, current, self.mobility[row], delta)
        })
    }

    fn row(&self, row: usize) -> &[f32] {
        &self.coords[row * self.dim..(row + 1) * self.dim]
    }

    fn is_adjacent(&self, a: usize, b: usize) -> bool {
        self.adjacency[a].binary_search(&b).is_ok()
    }

    fn movable(&self, row: usize) -> bool {
        self.mobility[row] != Mobility::Fixed
    }

    /// Pulls a bounded row back inside its ball around the anchor.
    fn contain(&mut self, row: usize) {
        let Mobility::Bounded { radius } = self.mobility[row] else {
            return;
        };
        let span = row * self.dim..(row + 1) * self.dim;
        let norm = self.coords[span.clone()]
            .iter()
            .zip(&self.anchors[span.clone()])
            .map(|(c, a)| (c - a) * (c - a))
            .sum::<f32>()
            .sqrt();
        if norm > radius && norm.is_finite() {
            let scale = radius / norm;
            for i in span {
                self.coords[i] = self.anchors[i] + (self.coords[i] - self.anchors[i]) * scale;
            }
        }
    }

    /// Bounded rows go back to where they started so containment still holds.
    fn reset_row(&mut self, row: usize) {
        let span = row * self.dim..(row + 1) * self.dim;
        let source = match self.mobility[row] {
            Mobility::Bounded { .. } => &self.start,
            _ => &self.initial,
        };
        let target: Vec<f32> = source[span.clone()].to_vec();
        self.coords[span].copy_from_slice(&target);
    }
}

fn fit_dim(coords: &[f32], dim: usize) -> impl Iterator<Item = f32> + '_ {
    (0..dim).map(move |i| coords.get(i).copied().unwrap_or(0.0))
}

/// Per-sample schedule of the next positive and negative updates.
#[derive(Debug, Clone)]
struct Schedule {
    epochs_per_sample: Vec<f32>,
    next_sample: Vec<f32>,
    epochs_per_negative: Vec<f32>,
    next_negative: Vec<f32>,
}

impl Schedule {
    fn new(weights: &[f32], negative_rate: usize) -> Self {
        let max_weight = weights.iter().copied().fold(0.0f32, f32::max);
        let epochs_per_sample: Vec<f32> = weights
            .iter()
            .map(|&w| if w > 0.0 { max_weight / w } else { f32::INFINITY })
            .collect();
        let epochs_per_negative: Vec<f32> = epochs_per_sample
            .iter()
            .map(|&e| {
                if negative_rate == 0 {
                    f32::INFINITY
                } else {
                    e / negative_rate as f32
                }
            })
            .collect();
        Self {
            next_sample: epochs_per_sample.clone(),
            next_negative: epochs_per_negative.clone(),
            epochs_per_sample,
            epochs_per_negative,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Optimizer {
    params: OptimizerParams,
}

impl Optimizer {
    pub fn new(params: OptimizerParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &OptimizerParams {
        &self.params
    }

    /// Runs exactly `epochs` epochs over `ws`.
    pub fn run(&self, ws: &mut Workspace, epochs: usize) -> OptimizeReport {
        let mut report = OptimizeReport {
            epochs,
            edges: ws.edges.len(),
            ..OptimizeReport::default()
        };
        if ws.is_empty() || epochs == 0 {
            return report;
        }

        // Both orientations of every edge, so each endpoint gets to be the head
        let samples: Vec<(usize, usize)> = ws
            .edges
            .iter()
            .flat_map(|&(a, b, _)| [(a, b), (b, a)])
            .collect();
        let weights: Vec<f32> = ws.edges.iter().flat_map(|&(_, _, w)| [w, w]).collect();
        let mut schedule = Schedule::new(&weights, self.params.negative_sample_rate);
        let mut rng = StdRng::seed_from_u64(self.params.seed);

        for epoch in 0..epochs {
            let alpha = self.params.learning_rate * (1.0 - epoch as f32 / epochs as f32);
            let checkpoint = (ws.coords.clone(), schedule.clone());

            self.epoch(ws, &samples, &mut schedule, epoch as f32, alpha, &mut rng);

            let diverged = self.diverged_rows(ws);
            if diverged.is_empty() {
                continue;
            }

            warn!(
                epoch,
                points = diverged.len(),
                "layout diverged, resetting points and retrying epoch"
            );
            ws.coords = checkpoint.0;
            schedule = checkpoint.1;
            for &row in &diverged {
                ws.reset_row(row);
            }

            self.epoch(ws, &samples, &mut schedule, epoch as f32, alpha, &mut rng);

            let still = self.diverged_rows(ws);
            for &row in &still {
                ws.reset_row(row);
                ws.mobility[row] = Mobility::Fixed;
                report.corrupted.push(ws.ids[row]);
            }
            for &row in &diverged {
                if !still.contains(&row) {
                    report.recovered.push(ws.ids[row]);
                }
            }
        }

        report.corrupted.sort();
        report.corrupted.dedup();
        report.recovered.sort();
        report.recovered.dedup();
        report.recovered.retain(|id| !report.corrupted.contains(id));
        debug!(
            epochs,
            rows = ws.len(),
            edges = report.edges,
            recovered = report.recovered.len(),
            corrupted = report.corrupted.len(),
            "optimizer run finished"
        );
        report
    }

    fn diverged_rows(&self, ws: &Workspace) -> Vec<usize> {
        let bound = self.params.coordinate_bound;
        (0..ws.len())
            .filter(|&row| ws.movable(row))
            .filter(|&row| ws.row(row).iter().any(|c| !c.is_finite() || c.abs() > bound))
            .collect()
    }

    fn epoch(
        &self,
        ws: &mut Workspace,
        samples: &[(usize, usize)],
        schedule: &mut Schedule,
        epoch: f32,
        alpha: f32,
        rng: &mut StdRng,
    ) {
        let CurveShape { a, b } = self.params.shape;
        let gamma = self.params.repulsion_strength;
        let max_step = self.params.max_step;
        let dim = ws.dim;
        let n_rows = ws.len();
        let mut grad = vec![0.0f32; dim];

        for (s, &(head, tail)) in samples.iter().enumerate() {
            if schedule.next_sample[s] > epoch {
                continue;
            }
            schedule.next_sample[s] += schedule.epochs_per_sample[s];

            let head_moves = ws.movable(head);
            let tail_moves = ws.movable(tail);
            if !head_moves && !tail_moves {
                continue;
            }

            // Attraction
            let dist_sq = squared_distance(ws.row(head), ws.row(tail));
            let coeff = if dist_sq > 0.0 {
                (-2.0 * a * b * dist_sq.powf(b - 1.0)) / (a * dist_sq.powf(b) + 1.0)
            } else {
                0.0
            };
            for (d, g) in grad.iter_mut().enumerate() {
                let diff = ws.coords[head * dim + d] - ws.coords[tail * dim + d];
                *g = (coeff * diff).clamp(-max_step, max_step);
            }
            for (d, g) in grad.iter().enumerate() {
                if head_moves {
                    ws.coords[head * dim + d] += g * alpha;
                }
                if tail_moves {
                    ws.coords[tail * dim + d] -= g * alpha;
                }
            }
            ws.contain(head);
            ws.contain(tail);

            if !head_moves {
                continue;
            }

            // Repulsion from random non-neighbors
            let pending = ((epoch - schedule.next_negative[s]) / schedule.epochs_per_negative[s])
                .floor()
                .max(0.0);
            let n_negative = if pending.is_finite() { pending as usize } else { 0 };
            schedule.next_negative[s] += n_negative as f32 * schedule.epochs_per_negative[s];

            for _ in 0..n_negative {
                let other = rng.random_range(0..n_rows);
                if other == head || ws.is_adjacent(head, other) {
                    continue;
                }
                let dist_sq = squared_distance(ws.row(head), ws.row(other));
                let coeff = if dist_sq > 0.0 {
                    2.0 * gamma * b / ((REPULSION_EPSILON + dist_sq) * (a * dist_sq.powf(b) + 1.0))
                } else {
                    0.0
                };
                for d in 0..dim {
                    let diff = ws.coords[head * dim + d] - ws.coords[other * dim + d];
                    let g = if coeff > 0.0 {
                        (coeff * diff).clamp(-max_step, max_step)
                    } else {
                        max_step
                    };
                    ws.coords[head * dim + d] += g * alpha;
                }
                ws.contain(head);
            }
        }
    }
}

#[inline]
fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
