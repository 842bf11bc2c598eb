//! Global settles and the background worker that runs them.
//!
//! A global settle copies the layout and the symmetrized graph, optimizes
//! the copy without holding any lock, then swaps the result in. Local
//! settles that commit while it runs are recorded as drift and re-applied on
//! top of the optimized coordinates. A reset during the run bumps the
//! generation and the result is discarded.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex, RwLockUpgradableReadGuard};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{CorpusError, CorpusResult};
use crate::graph::NeighborGraph;
use crate::layout::{LayoutState, OptimizeReport, Optimizer, Workspace};
use crate::types::ChunkId;

use super::{CorpusState, Drift, Shared};

/// Summary of a finished global settle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SettleOutcome {
    pub points: usize,
    pub edges: usize,
    pub epochs: usize,
    pub recovered: Vec<ChunkId>,
    pub corrupted: Vec<ChunkId>,
    pub elapsed_ms: u64,
}

/// Runs the optimizer over the whole layout.
pub(super) fn optimize(
    layout: &LayoutState,
    graph: &NeighborGraph,
    optimizer: &Optimizer,
    epochs: usize,
) -> (Workspace, OptimizeReport) {
    let edges = graph.symmetric_edges();
    let mut ws = Workspace::from_layout(layout, &edges);
    let report = optimizer.run(&mut ws, epochs);
    (ws, report)
}

/// Copies optimized coordinates into `state`, re-applying drift.
pub(super) fn apply_settled(
    state: &mut CorpusState,
    ws: &Workspace,
    report: &OptimizeReport,
    drift: &Drift,
) {
    for (id, coords, _, _) in ws.iter() {
        if drift.replaced.contains(&id) || !state.layout.contains(id) {
            continue;
        }
        state.layout.set_coords(id, coords);
        if let Some(delta) = drift.displacements.get(&id) {
            state.layout.displace(id, delta);
        }
        if report.corrupted.binary_search(&id).is_err() {
            state.layout.mark_settled(id);
        }
    }
    for id in &report.corrupted {
        warn!(%id, "point diverged during global settle, frozen at initial position");
    }
}

/// One global settle with snapshot-and-swap.
///
/// Returns [`CorpusError::SettleAbandoned`] when the corpus was reset while
/// the optimizer was running.
pub(super) fn run_global(shared: &Shared) -> CorpusResult<SettleOutcome> {
    let _gate = shared.settle_gate.lock();
    let started = Instant::now();

    let (generation, mut ws) = begin(shared);
    let report = shared.optimizer.run(&mut ws, shared.config.layout.epochs);
    commit(shared, generation, &ws, &report)?;

    let outcome = SettleOutcome {
        points: ws.len(),
        edges: report.edges,
        epochs: report.epochs,
        recovered: report.recovered,
        corrupted: report.corrupted,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        points = outcome.points,
        edges = outcome.edges,
        elapsed_ms = outcome.elapsed_ms,
        "global settle finished"
    );
    Ok(outcome)
}

/// Copies the layout and starts recording drift.
fn begin(shared: &Shared) -> (u64, Workspace) {
    let state = shared.state.upgradable_read();
    let edges = state.graph.symmetric_edges();
    let ws = Workspace::from_layout(&state.layout, &edges);
    let generation = state.generation;

    let mut state = RwLockUpgradableReadGuard::upgrade(state);
    state.drift = Some(Drift::default());
    state.inserts_since_settle = 0;
    (generation, ws)
}

/// Swaps optimized coordinates in unless the generation moved on.
fn commit(
    shared: &Shared,
    generation: u64,
    ws: &Workspace,
    report: &OptimizeReport,
) -> CorpusResult<()> {
    {
        let mut state = shared.state.write();
        let drift = state.drift.take().unwrap_or_default();
        if state.generation != generation {
            info!(
                started_generation = generation,
                current_generation = state.generation,
                "global settle abandoned after reset"
            );
            return Err(CorpusError::SettleAbandoned);
        }
        apply_settled(&mut state, ws, report, &drift);
    }
    shared.persist()
}

enum SettleRequest {
    Run,
    Shutdown,
}

/// Count of requests sent but not yet handled.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self, handled: usize) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(handled);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Dedicated thread running global settles off the ingest path.
pub(super) struct SettleWorker {
    sender: Sender<SettleRequest>,
    pending: Arc<Pending>,
    handle: Option<JoinHandle<()>>,
}

impl SettleWorker {
    pub(super) fn spawn(shared: Arc<Shared>) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let pending = Arc::new(Pending::default());
        let worker_pending = Arc::clone(&pending);
        let handle = std::thread::Builder::new()
            .name("atlas-settle".to_string())
            .spawn(move || worker_loop(&shared, &receiver, &worker_pending))?;
        Ok(Self {
            sender,
            pending,
            handle: Some(handle),
        })
    }

    pub(super) fn request(&self) {
        self.pending.add();
        if self.sender.send(SettleRequest::Run).is_err() {
            self.pending.finish(1);
        }
    }

    pub(super) fn wait_idle(&self) {
        self.pending.wait();
    }

    pub(super) fn shutdown(mut self) {
        let _ = self.sender.send(SettleRequest::Shutdown);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("settle worker panicked");
        }
    }
}

fn worker_loop(shared: &Shared, receiver: &Receiver<SettleRequest>, pending: &Pending) {
    while let Ok(SettleRequest::Run) = receiver.recv() {
        // Requests that piled up during the previous run collapse into this one
        let mut handled = 1;
        let mut shutdown = false;
        loop {
            match receiver.try_recv() {
                Ok(SettleRequest::Run) => handled += 1,
                Ok(SettleRequest::Shutdown) | Err(TryRecvError::Disconnected) => {
                    shutdown = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        if !shutdown {
            match run_global(shared) {
                Ok(_) | Err(CorpusError::SettleAbandoned) => {}
                Err(e) => error!(error = %e, "background settle failed"),
            }
        }
        pending.finish(handled);
        if shutdown {
            break;
        }
    }
    pending.finish(usize::MAX);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{Corpus, CorpusConfig};
    use crate::store::NewChunk;
    use tempfile::TempDir;

    fn config(background: bool) -> CorpusConfig {
        let mut config = CorpusConfig::default();
        config.graph.n_neighbors = 3;
        config.settle.background = background;
        config.settle.global_every = 0;
        config.layout.epochs = 30;
        config
    }

    fn fill(corpus: &Corpus, n: u32) {
        for i in 0..n {
            let angle = i as f32 * 0.4;
            corpus
                .insert(NewChunk::new("doc", i, "text", vec![angle.cos(), angle.sin(), 0.2]))
                .unwrap();
        }
    }

    #[test]
    fn test_background_settle_completes() {
        let temp_dir = TempDir::new().unwrap();
        let corpus = Corpus::open_at(temp_dir.path(), config(true)).unwrap();
        fill(&corpus, 8);

        corpus.request_settle().unwrap();
        corpus.request_settle().unwrap();
        corpus.wait_for_settle();

        assert_eq!(corpus.stats().settled, 8);
    }

    #[test]
    fn test_settle_abandoned_when_generation_changes() {
        let temp_dir = TempDir::new().unwrap();
        let corpus = Corpus::open_at(temp_dir.path(), config(false)).unwrap();
        fill(&corpus, 5);

        let shared = &corpus.shared;
        let (generation, mut ws) = begin(shared);
        let report = shared.optimizer.run(&mut ws, 5);
        corpus.reset().unwrap();
        fill(&corpus, 2);

        let err = commit(shared, generation, &ws, &report).unwrap_err();
        assert!(matches!(err, CorpusError::SettleAbandoned));

        let state = shared.state.read();
        assert_eq!(state.layout.len(), 2);
        assert!(state.drift.is_none());
        assert!(
            state
                .layout
                .iter()
                .all(|(_, p)| p.state == crate::types::ChunkState::LocallyPlaced)
        );
    }

    #[test]
    fn test_local_inserts_during_settle_are_kept() {
        let temp_dir = TempDir::new().unwrap();
        let corpus = Corpus::open_at(temp_dir.path(), config(false)).unwrap();
        fill(&corpus, 5);

        let shared = &corpus.shared;
        let (generation, mut ws) = begin(shared);
        let report = shared.optimizer.run(&mut ws, 5);
        let late = corpus
            .insert(NewChunk::new("late", 0, "text", vec![0.3, 0.3, 0.9]))
            .unwrap();
        commit(shared, generation, &ws, &report).unwrap();

        let state = shared.state.read();
        assert_eq!(state.layout.len(), 6);
        let placement = state.layout.get(late.id).unwrap();
        assert_eq!(placement.state, crate::types::ChunkState::LocallyPlaced);
        assert_eq!(state.inserts_since_settle, 1);
    }

    #[test]
    fn test_drift_is_reapplied_after_swap() {
        let temp_dir = TempDir::new().unwrap();
        let corpus = Corpus::open_at(temp_dir.path(), config(false)).unwrap();
        fill(&corpus, 4);
        let target = ChunkId::new_unchecked(1);

        let (ws, report) = {
            let state = corpus.shared.state.read();
            optimize(&state.layout, &state.graph, &corpus.shared.optimizer, 10)
        };
        let optimized = ws.coords(target).unwrap().to_vec();

        let mut drift = Drift::default();
        drift.displacements.insert(target, vec![0.25, -0.5]);
        let mut state = corpus.shared.state.write();
        apply_settled(&mut state, &ws, &report, &drift);

        let placement = state.layout.get(target).unwrap();
        assert!((placement.coords[0] - (optimized[0] + 0.25)).abs() < 1e-6);
        assert!((placement.coords[1] - (optimized[1] - 0.5)).abs() < 1e-6);
        assert_eq!(placement.settled.as_deref(), Some(placement.coords.as_slice()));
    }
}
