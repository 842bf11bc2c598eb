//! The corpus aggregate: store, neighbor graph and layout behind one lock.
//!
//! Writers are serialized by a dedicated mutex. An insert computes its effect
//! against a read-locked view (neighbor search, placement and local settle)
//! and then takes the write lock only to commit it, so a reader never sees a
//! chunk without neighbors or coordinates. Global settles optimize a copy of
//! the layout without holding any lock and swap the result in afterwards,
//! unless the corpus was reset in the meantime.
//!
//! Disk writes never happen under the state lock: record-log appends run
//! between the read-locked projection and the commit, and snapshots are
//! encoded under a read lock and written after it is released.

pub(crate) mod projector;
mod settle;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{GraphConfig, LayoutConfig, Metric, SettleConfig, Settings};
use crate::error::{CorpusError, CorpusResult, StorageContext};
use crate::graph::{GraphBuilder, Neighbor, NeighborGraph};
use crate::layout::{LayoutState, Optimizer, OptimizerParams, init};
use crate::query::{self, ProjectionMethod, SearchHit};
use crate::store::{
    CorpusMetadata, LogWriter, NewChunk, VectorStore, encode_snapshot, read_snapshot,
    write_snapshot_payload,
};
use crate::types::{ChunkId, ChunkState, LayoutDims};

use projector::Projection;
use settle::SettleWorker;

pub use settle::SettleOutcome;

/// The parts of [`Settings`] the corpus engine needs.
#[derive(Debug, Clone, Default)]
pub struct CorpusConfig {
    pub graph: GraphConfig,
    pub layout: LayoutConfig,
    pub settle: SettleConfig,
}

impl From<&Settings> for CorpusConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            graph: settings.graph.clone(),
            layout: settings.layout.clone(),
            settle: settings.settle.clone(),
        }
    }
}

/// Result of a single successful insert.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub id: ChunkId,
    /// An existing chunk with the same source and index was overwritten
    pub replaced: bool,
    pub neighbors: usize,
    /// Existing points moved by the local settle
    pub displaced: usize,
    /// Points frozen at their initial position after diverging twice
    pub corrupted: Vec<ChunkId>,
}

/// A chunk that could not be ingested.
#[derive(Debug)]
pub struct ChunkFailure {
    pub source: String,
    pub chunk_index: u32,
    pub error: CorpusError,
}

/// Per-batch ingestion summary. One bad chunk never aborts the batch.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub ingested: Vec<ChunkId>,
    pub failures: Vec<ChunkFailure>,
    /// Stored chunks whose coordinates were frozen after diverging
    pub corrupted: Vec<ChunkId>,
}

impl IngestReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.corrupted.is_empty()
    }

    pub fn merge(&mut self, other: IngestReport) {
        self.ingested.extend(other.ingested);
        self.failures.extend(other.failures);
        self.corrupted.extend(other.corrupted);
    }
}

/// A placed chunk, as exported for plotting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointView {
    pub id: ChunkId,
    pub coords: Vec<f32>,
    pub state: ChunkState,
    pub source: String,
    pub chunk_index: u32,
    pub preview: String,
}

/// Everything known about one chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkView {
    pub id: ChunkId,
    pub source: String,
    pub chunk_index: u32,
    pub text: String,
    pub coords: Vec<f32>,
    pub state: ChunkState,
    pub neighbors: Vec<Neighbor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorpusStats {
    pub chunks: usize,
    pub dimension: Option<usize>,
    pub metric: Metric,
    pub layout_dims: usize,
    pub generation: u64,
    pub settled: usize,
    pub locally_placed: usize,
    pub edges: usize,
    pub inserts_since_settle: usize,
    pub settle_in_progress: bool,
}

/// Local displacements recorded while a global settle is in flight.
#[derive(Debug, Default)]
struct Drift {
    displacements: BTreeMap<ChunkId, Vec<f32>>,
    /// Chunks overwritten after the settle copied the layout
    replaced: BTreeSet<ChunkId>,
}

/// Derived state persisted in the snapshot file.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    generation: u64,
    /// Store sequence covered by this snapshot
    last_sequence: u64,
    inserts_since_settle: usize,
    inserts_since_rebuild: usize,
    graph: &'a NeighborGraph,
    layout: &'a LayoutState,
}

#[derive(Deserialize)]
struct Snapshot {
    generation: u64,
    last_sequence: u64,
    inserts_since_settle: usize,
    inserts_since_rebuild: usize,
    graph: NeighborGraph,
    layout: LayoutState,
}

/// Consistent view of the corpus. Obtained through [`Corpus::read`].
#[derive(Debug)]
pub struct CorpusState {
    store: VectorStore,
    graph: NeighborGraph,
    layout: LayoutState,
    builder: GraphBuilder,
    metadata: CorpusMetadata,
    generation: u64,
    inserts_since_settle: usize,
    inserts_since_rebuild: usize,
    drift: Option<Drift>,
}

impl CorpusState {
    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    pub fn graph(&self) -> &NeighborGraph {
        &self.graph
    }

    pub fn layout(&self) -> &LayoutState {
        &self.layout
    }

    pub fn builder(&self) -> &GraphBuilder {
        &self.builder
    }

    /// Incremented by every reset.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// The `top_n` chunks closest to `query`, best first.
    pub fn search(&self, query: &[f32], top_n: usize) -> CorpusResult<Vec<SearchHit>> {
        query::search(self, query, top_n)
    }

    /// Commits a projection for a chunk already present in the store.
    fn apply_projection(&mut self, projection: Projection, embedding: &[f32]) {
        let Projection {
            id,
            replaced,
            neighbors,
            offers,
            initial,
            coords,
            displacements,
            ..
        } = projection;
        let k = self.builder.n_neighbors();

        projector::link(&mut self.graph, id, replaced, &neighbors, &offers, k);
        if replaced {
            self.builder.untrack(id);
            self.layout.remove(id);
        }
        self.builder.track(id, embedding);
        self.layout.place(id, initial, ChunkState::LocallyPlaced);
        self.layout.set_coords(id, &coords);

        for (other, delta) in &displacements {
            self.layout.displace(*other, delta);
        }
        if let Some(drift) = self.drift.as_mut() {
            for (other, delta) in displacements {
                let total = drift
                    .displacements
                    .entry(other)
                    .or_insert_with(|| vec![0.0; delta.len()]);
                for (t, d) in total.iter_mut().zip(&delta) {
                    *t += d;
                }
            }
            if replaced {
                drift.replaced.insert(id);
            }
        }
    }

    /// Encodes the snapshot and metadata in memory.
    fn checkpoint(&self) -> CorpusResult<Checkpoint> {
        let payload = encode_snapshot(&SnapshotRef {
            generation: self.generation,
            last_sequence: self.store.last_sequence(),
            inserts_since_settle: self.inserts_since_settle,
            inserts_since_rebuild: self.inserts_since_rebuild,
            graph: &self.graph,
            layout: &self.layout,
        })?;
        let mut metadata = self.metadata.clone();
        metadata.update(
            self.store.dimension().map(|d| d.get()),
            self.store.len(),
            self.generation,
        );
        Ok(Checkpoint {
            dir: self.store.dir().to_path_buf(),
            payload,
            metadata,
        })
    }

    fn stats(&self, settle_in_progress: bool) -> CorpusStats {
        let (settled, locally_placed) =
            self.layout
                .iter()
                .fold((0, 0), |(s, l), (_, placement)| match placement.state {
                    ChunkState::Settled => (s + 1, l),
                    ChunkState::LocallyPlaced => (s, l + 1),
                    ChunkState::Ingested => (s, l),
                });
        CorpusStats {
            chunks: self.store.len(),
            dimension: self.store.dimension().map(|d| d.get()),
            metric: self.builder.metric(),
            layout_dims: self.layout.dims().get(),
            generation: self.generation,
            settled,
            locally_placed,
            edges: self.graph.symmetric_edges().len(),
            inserts_since_settle: self.inserts_since_settle,
            settle_in_progress,
        }
    }
}

/// Snapshot and metadata encoded under a lock, written after it is released.
struct Checkpoint {
    dir: PathBuf,
    payload: Vec<u8>,
    metadata: CorpusMetadata,
}

impl Checkpoint {
    fn write(self) -> CorpusResult<()> {
        write_snapshot_payload(&self.dir, &self.payload)?;
        self.metadata.save(&self.dir)
    }
}

pub(crate) struct Shared {
    config: CorpusConfig,
    optimizer: Optimizer,
    state: RwLock<CorpusState>,
    /// Serializes inserts, removals and resets
    writer: Mutex<()>,
    /// At most one global settle at a time
    settle_gate: Mutex<()>,
    /// Keeps checkpoints landing on disk in the order they were taken
    persist_gate: Mutex<()>,
}

impl Shared {
    /// Writes the snapshot and metadata files. Only the in-memory encoding
    /// holds the read lock.
    fn persist(&self) -> CorpusResult<()> {
        let _gate = self.persist_gate.lock();
        let checkpoint = self.state.read().checkpoint()?;
        checkpoint.write()
    }
}

/// A persistent, incrementally projected corpus of document chunks.
///
/// Safe to share between threads: searches run in parallel with each other
/// and with ingestion, writers are serialized.
pub struct Corpus {
    shared: Arc<Shared>,
    dir: PathBuf,
    worker: Option<SettleWorker>,
}

impl Corpus {
    /// Opens the corpus in `settings.data_path`.
    pub fn open(settings: &Settings) -> CorpusResult<Self> {
        Self::open_at(&settings.data_path, CorpusConfig::from(settings))
    }

    /// Opens (or creates) the corpus in `dir`, recovering derived state from
    /// the snapshot and replaying any chunks stored after it.
    pub fn open_at(dir: impl AsRef<Path>, config: CorpusConfig) -> CorpusResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).at_path(&dir)?;

        let metadata = match CorpusMetadata::load(&dir)? {
            Some(metadata) => {
                check_fixed_choices(&metadata, &config)?;
                metadata
            }
            None => CorpusMetadata::new(config.graph.metric, config.layout.dims),
        };

        let store = VectorStore::open(&dir)?;
        let mut builder = GraphBuilder::new(&config.graph, config.layout.seed);
        for record in store.list_all() {
            builder.track(record.id, &record.embedding);
        }

        let snapshot = match read_snapshot::<Snapshot>(&dir) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "discarding unreadable snapshot, rebuilding derived state");
                None
            }
        };

        let mut state = CorpusState {
            store,
            graph: NeighborGraph::new(config.graph.mix_ratio),
            layout: LayoutState::new(config.layout.dims),
            builder,
            generation: metadata.generation,
            metadata,
            inserts_since_settle: 0,
            inserts_since_rebuild: 0,
            drift: None,
        };
        let optimizer = Optimizer::new(OptimizerParams::from_config(&config.layout));
        recover(&mut state, snapshot, &config, &optimizer)?;
        state.checkpoint()?.write()?;

        info!(
            path = %dir.display(),
            chunks = state.len(),
            generation = state.generation,
            "opened corpus"
        );

        let background = config.settle.background;
        let shared = Arc::new(Shared {
            config,
            optimizer,
            state: RwLock::new(state),
            writer: Mutex::new(()),
            settle_gate: Mutex::new(()),
            persist_gate: Mutex::new(()),
        });
        let worker = if background {
            Some(SettleWorker::spawn(Arc::clone(&shared)).at_path(&dir)?)
        } else {
            None
        };

        Ok(Self {
            shared,
            dir,
            worker,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &CorpusConfig {
        &self.shared.config
    }

    /// Read access to a consistent view. Holding it blocks writers.
    pub fn read(&self) -> RwLockReadGuard<'_, CorpusState> {
        self.shared.state.read()
    }

    /// Stores a chunk, links it into the graph and places it in the layout.
    ///
    /// A chunk whose `(source, chunk_index)` matches a stored one keeps that
    /// chunk's identifier and replaces it. The chunk is durable when this
    /// returns; the snapshot catches up on [`persist`](Self::persist).
    pub fn insert(&self, chunk: NewChunk) -> CorpusResult<InsertOutcome> {
        let _writer = self.shared.writer.lock();
        let outcome = self.insert_locked(chunk)?;
        self.maintain()?;
        Ok(outcome)
    }

    /// Inserts every chunk, collecting per-chunk failures, then persists.
    pub fn insert_batch(
        &self,
        chunks: impl IntoIterator<Item = NewChunk>,
    ) -> CorpusResult<IngestReport> {
        let mut report = IngestReport::default();
        for chunk in chunks {
            let source = chunk.source.clone();
            let chunk_index = chunk.chunk_index;
            match self.insert(chunk) {
                Ok(outcome) => {
                    report.ingested.push(outcome.id);
                    report.corrupted.extend(outcome.corrupted);
                }
                Err(error) if error.is_per_chunk() => {
                    warn!(%source, chunk_index, %error, "skipping chunk");
                    report.failures.push(ChunkFailure {
                        source,
                        chunk_index,
                        error,
                    });
                }
                Err(error) => {
                    self.persist()?;
                    return Err(error);
                }
            }
        }
        self.persist()?;
        Ok(report)
    }

    fn insert_locked(&self, chunk: NewChunk) -> CorpusResult<InsertOutcome> {
        validate_embedding(&chunk.embedding)?;
        let embedding = chunk.embedding.clone();

        let (projection, staged, log) = {
            let state = self.shared.state.read();
            let existing = chunk
                .id
                .or_else(|| state.store.lookup_key(&chunk.key()));
            let (chunk, replaced) = match existing {
                Some(id) if state.store.contains(id) => (chunk.with_id(id), true),
                Some(id) => return Err(CorpusError::NotFound { id }),
                None => (chunk, false),
            };
            let staged = state.store.stage(chunk)?;
            let projection = projector::project(
                &state,
                &self.shared.config,
                &self.shared.optimizer,
                staged.id(),
                &embedding,
                replaced,
            );
            (projection, staged, state.store.log_writer())
        };

        // Durable before it becomes visible, with no state lock held
        log.write_put(&staged)?;

        let mut state = self.shared.state.write();
        let id = state.store.commit(staged);
        debug_assert_eq!(id, projection.id);

        let outcome = InsertOutcome {
            id,
            replaced: projection.replaced,
            neighbors: projection.neighbors.len(),
            displaced: projection.displacements.len(),
            corrupted: projection.report.corrupted.clone(),
        };
        for corrupted in &outcome.corrupted {
            warn!(id = %corrupted, "point diverged during local settle, frozen at initial position");
        }
        state.apply_projection(projection, &embedding);
        state.inserts_since_settle += 1;
        state.inserts_since_rebuild += 1;

        drop(state);

        debug!(
            %id,
            neighbors = outcome.neighbors,
            displaced = outcome.displaced,
            replaced = outcome.replaced,
            "placed chunk"
        );
        self.compact_log(&log)?;
        Ok(outcome)
    }

    /// Rewrites the record log once dead frames dominate. The live records
    /// are copied under the read lock and written after it is released.
    fn compact_log(&self, log: &LogWriter) -> CorpusResult<()> {
        let live = self.shared.state.read().store.compaction_due();
        if let Some(live) = live {
            log.compact(&live)?;
            debug!(chunks = live.len(), "compacted record log");
        }
        Ok(())
    }

    /// Periodic graph rebuilds and global settles. Called with the writer lock held.
    fn maintain(&self) -> CorpusResult<()> {
        let (rebuild_due, settle_due) = {
            let state = self.shared.state.read();
            let rebuild = state.builder.needs_rebuild(
                state.inserts_since_rebuild,
                state.store.len(),
                self.shared.config.graph.rebuild_ratio,
            );
            let every = self.shared.config.settle.global_every;
            (rebuild, every > 0 && state.inserts_since_settle >= every)
        };

        if rebuild_due {
            let graph = {
                let state = self.shared.state.read();
                state
                    .builder
                    .rebuild(&state.store, self.shared.config.graph.mix_ratio)
            };
            let mut state = self.shared.state.write();
            state.graph = graph;
            state.inserts_since_rebuild = 0;
        }

        if settle_due {
            match &self.worker {
                Some(worker) => worker.request(),
                None => match settle::run_global(&self.shared) {
                    Ok(_) | Err(CorpusError::SettleAbandoned) => {}
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }

    /// Removes a chunk and repairs the neighbor lists that referenced it.
    pub fn remove(&self, id: ChunkId) -> CorpusResult<()> {
        let _writer = self.shared.writer.lock();

        let (repaired, log) = {
            let state = self.shared.state.read();
            if !state.store.contains(id) {
                return Err(CorpusError::NotFound { id });
            }
            let k = state.builder.n_neighbors();
            let mut repaired = Vec::new();
            for owner in state.graph.owners(id) {
                let record = state.store.get(owner)?;
                let raw: Vec<(ChunkId, f32)> = state
                    .builder
                    .nearest(&state.store, &record.embedding, k + 1, Some(owner))
                    .into_iter()
                    .filter(|(other, _)| *other != id)
                    .take(k)
                    .collect();
                repaired.push((owner, raw));
            }
            (repaired, state.store.log_writer())
        };

        log.write_removal(id)?;

        let mut state = self.shared.state.write();
        state.store.commit_removal(id);
        state.graph.remove(id);
        state.builder.untrack(id);
        state.layout.remove(id);
        for (owner, raw) in repaired {
            state.graph.set_neighbors(owner, &raw);
        }
        if let Some(drift) = state.drift.as_mut() {
            drift.displacements.remove(&id);
        }
        drop(state);
        info!(%id, "removed chunk");
        self.compact_log(&log)
    }

    /// Drops every chunk, neighbor list and coordinate. A global settle in
    /// flight is abandoned.
    pub fn reset(&self) -> CorpusResult<()> {
        let _writer = self.shared.writer.lock();
        let log = {
            let mut state = self.shared.state.write();
            state.generation += 1;
            state.graph.clear();
            state.layout.clear();
            state.builder.clear();
            state.store.clear_index();
            state.drift = None;
            state.inserts_since_settle = 0;
            state.inserts_since_rebuild = 0;
            state.store.log_writer()
        };

        // Derived state first: a crash before the log is cleared leaves an
        // empty snapshot that recovery simply repopulates
        self.shared.persist()?;
        log.clear()?;

        info!(generation = self.read().generation, "corpus reset");
        Ok(())
    }

    /// Runs a global settle now, on the calling thread.
    pub fn settle_now(&self) -> CorpusResult<SettleOutcome> {
        settle::run_global(&self.shared)
    }

    /// Queues a global settle on the background worker, or runs it inline
    /// when background settles are disabled.
    pub fn request_settle(&self) -> CorpusResult<()> {
        match &self.worker {
            Some(worker) => {
                worker.request();
                Ok(())
            }
            None => self.settle_now().map(|_| ()),
        }
    }

    /// Blocks until every queued background settle has finished.
    pub fn wait_for_settle(&self) {
        if let Some(worker) = &self.worker {
            worker.wait_idle();
        }
        drop(self.shared.settle_gate.lock());
    }

    /// Nearest chunks to `query`, evaluated against one consistent view.
    pub fn search(&self, query: &[f32], top_n: usize) -> CorpusResult<Vec<SearchHit>> {
        self.read().search(query, top_n)
    }

    /// Nearest chunks to `query` with coordinates from `method` in `dims`.
    pub fn search_projected(
        &self,
        query: &[f32],
        top_n: usize,
        method: ProjectionMethod,
        dims: LayoutDims,
    ) -> CorpusResult<Vec<SearchHit>> {
        query::search_projected(&self.read(), query, top_n, method, dims)
    }

    pub fn get(&self, id: ChunkId) -> CorpusResult<ChunkView> {
        let state = self.read();
        let record = state.store.get(id)?;
        let placement = state.layout.get(id);
        Ok(ChunkView {
            id,
            source: record.source.clone(),
            chunk_index: record.chunk_index,
            text: record.text.clone(),
            coords: placement.map(|p| p.coords.clone()).unwrap_or_default(),
            state: placement.map_or(ChunkState::Ingested, |p| p.state),
            neighbors: state.graph.neighbors(id).unwrap_or_default().to_vec(),
        })
    }

    /// Every placed chunk in identifier order.
    pub fn points(&self) -> Vec<PointView> {
        let state = self.read();
        state
            .store
            .list_all()
            .filter_map(|record| {
                let placement = state.layout.get(record.id)?;
                Some(PointView {
                    id: record.id,
                    coords: placement.coords.clone(),
                    state: placement.state,
                    source: record.source.clone(),
                    chunk_index: record.chunk_index,
                    preview: query::preview(&record.text, query::PREVIEW_CHARS),
                })
            })
            .collect()
    }

    pub fn stats(&self) -> CorpusStats {
        let settling = self.shared.settle_gate.is_locked();
        self.read().stats(settling)
    }

    /// Writes the snapshot and metadata files.
    pub fn persist(&self) -> CorpusResult<()> {
        self.shared.persist()
    }
}

impl Drop for Corpus {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist corpus snapshot on close");
        }
    }
}

impl std::fmt::Debug for Corpus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Corpus")
            .field("dir", &self.dir)
            .field("background_settle", &self.worker.is_some())
            .finish()
    }
}

fn validate_embedding(embedding: &[f32]) -> CorpusResult<()> {
    if embedding.is_empty() {
        return Err(CorpusError::EmbeddingUnavailable {
            reason: "embedding is empty".to_string(),
        });
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(CorpusError::EmbeddingUnavailable {
            reason: "embedding contains non-finite values".to_string(),
        });
    }
    Ok(())
}

fn check_fixed_choices(metadata: &CorpusMetadata, config: &CorpusConfig) -> CorpusResult<()> {
    if metadata.metric != config.graph.metric {
        return Err(CorpusError::Config {
            reason: format!(
                "corpus was built with the {} metric, configuration asks for {}",
                metadata.metric, config.graph.metric
            ),
        });
    }
    if metadata.layout_dims != config.layout.dims {
        return Err(CorpusError::Config {
            reason: format!(
                "corpus layout has {} dimensions, configuration asks for {}",
                metadata.layout_dims.get(),
                config.layout.dims.get()
            ),
        });
    }
    Ok(())
}

/// Restores graph and layout from `snapshot`, then brings them in line
/// with the store.
fn recover(
    state: &mut CorpusState,
    snapshot: Option<Snapshot>,
    config: &CorpusConfig,
    optimizer: &Optimizer,
) -> CorpusResult<()> {
    // A snapshot ahead of the log belongs to a history that was reset
    let snapshot = snapshot.filter(|s| {
        s.last_sequence <= state.store.last_sequence() && s.layout.dims() == config.layout.dims
    });

    let Some(snapshot) = snapshot else {
        if !state.store.is_empty() {
            rebuild_from_store(state, config, optimizer);
        }
        return Ok(());
    };

    let last_sequence = snapshot.last_sequence;
    state.generation = state.generation.max(snapshot.generation);
    state.inserts_since_settle = snapshot.inserts_since_settle;
    state.inserts_since_rebuild = snapshot.inserts_since_rebuild;
    state.graph = snapshot.graph;
    state.graph.rebuild_reverse();
    state.layout = snapshot.layout;
    state.layout.rebuild_roster();

    // Chunks removed after the snapshot was written
    let stale: BTreeSet<ChunkId> = state
        .graph
        .ids()
        .chain(state.layout.ids())
        .filter(|id| !state.store.contains(*id))
        .collect();
    let mut dirty = BTreeSet::new();
    for id in &stale {
        dirty.extend(state.graph.remove(*id));
        state.layout.remove(*id);
    }
    let k = state.builder.n_neighbors();
    for owner in dirty.difference(&stale) {
        let raw = state.builder.build_neighbors(&state.store, *owner, k)?;
        state.graph.set_neighbors(*owner, &raw);
    }

    // Chunks stored or overwritten after the snapshot was written
    let pending: Vec<(ChunkId, bool)> = state
        .store
        .list_all()
        .filter(|r| r.sequence > last_sequence || !state.layout.contains(r.id))
        .map(|r| (r.id, state.layout.contains(r.id)))
        .collect();
    for (id, replaced) in &pending {
        let embedding = state.store.get(*id)?.embedding.clone();
        let projection = projector::project(state, config, optimizer, *id, &embedding, *replaced);
        state.apply_projection(projection, &embedding);
        state.inserts_since_settle += 1;
        state.inserts_since_rebuild += 1;
    }

    if !stale.is_empty() || !pending.is_empty() {
        info!(
            dropped = stale.len(),
            replayed = pending.len(),
            "reconciled snapshot with record log"
        );
    }
    Ok(())
}

/// Full rebuild when no usable snapshot exists.
fn rebuild_from_store(state: &mut CorpusState, config: &CorpusConfig, optimizer: &Optimizer) {
    warn!(
        chunks = state.store.len(),
        "no usable snapshot, rebuilding neighbor graph and layout"
    );
    state.graph = state
        .builder
        .rebuild(&state.store, config.graph.mix_ratio);

    let dims: LayoutDims = config.layout.dims;
    let mut layout = LayoutState::new(dims);
    for record in state.store.list_all() {
        let coords = init::scatter(record.id, dims, config.layout.seed, config.layout.init_radius);
        layout.place(record.id, coords, ChunkState::LocallyPlaced);
    }
    state.layout = layout;

    let (ws, report) =
        settle::optimize(&state.layout, &state.graph, optimizer, config.layout.epochs);
    settle::apply_settled(state, &ws, &report, &Drift::default());
    state.inserts_since_settle = 0;
    state.inserts_since_rebuild = 0;
}
