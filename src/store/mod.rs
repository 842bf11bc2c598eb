//! Durable keyed storage of document chunks.
//!
//! The [`VectorStore`] is the single source of truth for chunk identifiers.
//! Every mutation is appended to the [`RecordLog`](log::RecordLog) and synced
//! before the call returns; the in-memory map is updated only after the write
//! succeeded, so a failed write leaves the store unchanged.
//!
//! Mutations come in three steps for callers that share the store behind a
//! lock: [`VectorStore::stage`] validates, a [`LogWriter`] makes the change
//! durable, [`VectorStore::commit`] updates the index.

pub mod log;
pub mod snapshot;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{CorpusError, CorpusResult};
use crate::types::{ChunkId, EmbeddingDimension};

pub use log::{LogEntry, RecordLog};
pub use snapshot::{
    CorpusMetadata, encode_snapshot, read_snapshot, write_snapshot, write_snapshot_payload,
};

/// File name of the record log inside the data directory.
pub const LOG_FILE: &str = "chunks.log";

/// Minimum number of dead frames before compaction is considered.
const COMPACTION_FLOOR: usize = 64;

/// A stored document chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    /// Stable identity derived from `(source, chunk_index)`
    pub key: String,
    pub source: String,
    pub chunk_index: u32,
    pub text: String,
    pub embedding: Vec<f32>,
    /// Monotonic insertion sequence number
    pub sequence: u64,
    /// Unix timestamp in milliseconds
    pub inserted_at: i64,
}

/// A chunk on its way into the store.
#[derive(Debug, Clone)]
pub struct NewChunk {
    /// Existing identifier to overwrite; `None` assigns a fresh one
    pub id: Option<ChunkId>,
    pub source: String,
    pub chunk_index: u32,
    pub text: String,
    pub embedding: Vec<f32>,
}

impl NewChunk {
    pub fn new(
        source: impl Into<String>,
        chunk_index: u32,
        text: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: None,
            source: source.into(),
            chunk_index,
            text: text.into(),
            embedding,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: ChunkId) -> Self {
        self.id = Some(id);
        self
    }

    /// Stable key of this chunk's origin.
    #[must_use]
    pub fn key(&self) -> String {
        chunk_key(&self.source, self.chunk_index)
    }
}

/// SHA-256 of `source` and `chunk_index`, hex encoded.
#[must_use]
pub fn chunk_key(source: &str, chunk_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(chunk_index.to_le_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A validated chunk write that has not reached the log yet.
///
/// Produced by [`VectorStore::stage`], made durable through a [`LogWriter`]
/// and finally applied with [`VectorStore::commit`].
#[derive(Debug, Clone)]
pub struct StagedPut {
    record: ChunkRecord,
    /// Identifier after this one when the write assigns a fresh id
    next_id: Option<ChunkId>,
}

impl StagedPut {
    #[must_use]
    pub fn id(&self) -> ChunkId {
        self.record.id
    }
}

/// Shared handle on the record log.
///
/// Lets the durable half of a mutation run without borrowing the store, so a
/// caller can sync to disk while other threads keep reading the in-memory
/// index. Callers serialize mutations themselves; the handle only guards the
/// file.
#[derive(Debug, Clone)]
pub struct LogWriter {
    log: Arc<Mutex<RecordLog>>,
}

impl LogWriter {
    pub fn write_put(&self, staged: &StagedPut) -> CorpusResult<()> {
        self.log.lock().append(&LogEntry::Put(staged.record.clone()))
    }

    pub fn write_removal(&self, id: ChunkId) -> CorpusResult<()> {
        self.log.lock().append(&LogEntry::Remove(id))
    }

    /// Rewrites the log from `live`, dropping superseded frames.
    pub fn compact(&self, live: &[ChunkRecord]) -> CorpusResult<()> {
        self.log.lock().compact(live)
    }

    pub fn clear(&self) -> CorpusResult<()> {
        self.log.lock().clear()
    }

    #[cfg(test)]
    pub(crate) fn hold(&self) -> parking_lot::MutexGuard<'_, RecordLog> {
        self.log.lock()
    }
}

#[derive(Debug)]
pub struct VectorStore {
    dir: PathBuf,
    log: LogWriter,
    records: BTreeMap<ChunkId, ChunkRecord>,
    keys: HashMap<String, ChunkId>,
    dimension: Option<EmbeddingDimension>,
    next_id: ChunkId,
    next_sequence: u64,
}

impl VectorStore {
    /// Opens (or creates) the store in `dir`, replaying its record log.
    pub fn open(dir: impl AsRef<Path>) -> CorpusResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let (log, replay) = RecordLog::open(dir.join(LOG_FILE))?;

        let mut store = Self {
            dir,
            log: LogWriter {
                log: Arc::new(Mutex::new(log)),
            },
            records: BTreeMap::new(),
            keys: HashMap::new(),
            dimension: replay.dimension.map(EmbeddingDimension::new).transpose()?,
            next_id: ChunkId::new_unchecked(1),
            next_sequence: 1,
        };

        for entry in replay.entries {
            match entry {
                LogEntry::Put(record) => store.apply_put(record),
                LogEntry::Remove(id) => store.unindex(id),
            }
        }

        info!(
            path = %store.dir.display(),
            chunks = store.records.len(),
            "opened vector store"
        );
        Ok(store)
    }

    fn apply_put(&mut self, record: ChunkRecord) {
        if let Some(next) = record.id.next()
            && next > self.next_id
        {
            self.next_id = next;
        }
        self.next_sequence = self.next_sequence.max(record.sequence + 1);
        self.index_record(record);
    }

    fn index_record(&mut self, record: ChunkRecord) {
        let key = record.key.clone();
        self.keys.insert(key.clone(), record.id);
        if let Some(old) = self.records.insert(record.id, record)
            && old.key != key
            && self.keys.get(&old.key) == Some(&old.id)
        {
            self.keys.remove(&old.key);
        }
    }

    fn unindex(&mut self, id: ChunkId) {
        if let Some(record) = self.records.remove(&id) {
            self.keys.remove(&record.key);
        }
    }

    /// Writes a chunk durably and returns its identifier.
    ///
    /// A fresh identifier is assigned when none is supplied. Supplying an
    /// identifier overwrites that record, which must exist.
    pub fn put(&mut self, chunk: NewChunk) -> CorpusResult<ChunkId> {
        let staged = self.stage(chunk)?;
        self.log.write_put(&staged)?;
        let id = self.commit(staged);
        if let Some(live) = self.compaction_due() {
            self.log.compact(&live)?;
        }
        Ok(id)
    }

    /// Validates `chunk` and resolves its identifier without writing anything.
    pub fn stage(&self, chunk: NewChunk) -> CorpusResult<StagedPut> {
        if let Some(dimension) = self.dimension {
            dimension.validate(&chunk.embedding)?;
        }

        let key = chunk.key();
        let (id, next_id) = match chunk.id {
            Some(id) if self.records.contains_key(&id) => (id, None),
            Some(id) => return Err(CorpusError::NotFound { id }),
            None => {
                let next = self.next_id.next().ok_or(CorpusError::ChunkIdExhausted)?;
                (self.next_id, Some(next))
            }
        };

        Ok(StagedPut {
            record: ChunkRecord {
                id,
                key,
                source: chunk.source,
                chunk_index: chunk.chunk_index,
                text: chunk.text,
                embedding: chunk.embedding,
                sequence: self.next_sequence,
                inserted_at: chrono::Utc::now().timestamp_millis(),
            },
            next_id,
        })
    }

    /// Applies a staged write that already reached the log. No I/O.
    pub fn commit(&mut self, staged: StagedPut) -> ChunkId {
        let StagedPut { record, next_id } = staged;
        let id = record.id;
        if self.dimension.is_none() {
            self.dimension = EmbeddingDimension::new(record.embedding.len()).ok();
        }
        if let Some(next) = next_id {
            self.next_id = next;
        }
        self.next_sequence += 1;
        self.index_record(record);
        debug!(%id, "stored chunk");
        id
    }

    pub fn get(&self, id: ChunkId) -> CorpusResult<&ChunkRecord> {
        self.records.get(&id).ok_or(CorpusError::NotFound { id })
    }

    /// All chunks in ascending identifier order.
    pub fn list_all(&self) -> impl Iterator<Item = &ChunkRecord> {
        self.records.values()
    }

    pub fn remove(&mut self, id: ChunkId) -> CorpusResult<()> {
        if !self.records.contains_key(&id) {
            return Err(CorpusError::NotFound { id });
        }
        self.log.write_removal(id)?;
        self.commit_removal(id);
        if let Some(live) = self.compaction_due() {
            self.log.compact(&live)?;
        }
        Ok(())
    }

    /// Drops `id` from the index after its removal reached the log. No I/O.
    pub fn commit_removal(&mut self, id: ChunkId) {
        self.unindex(id);
        debug!(%id, "removed chunk");
    }

    /// Removes every chunk. Identifiers restart from 1.
    pub fn clear(&mut self) -> CorpusResult<()> {
        self.log.clear()?;
        self.clear_index();
        Ok(())
    }

    /// Forgets every chunk in memory, leaving the log to the caller.
    pub fn clear_index(&mut self) {
        self.records.clear();
        self.keys.clear();
        self.dimension = None;
        self.next_id = ChunkId::new_unchecked(1);
        self.next_sequence = 1;
    }

    /// Handle for writing to this store's log without borrowing the store.
    #[must_use]
    pub fn log_writer(&self) -> LogWriter {
        self.log.clone()
    }

    /// Live records to rewrite the log from, once superseded frames
    /// outnumber them.
    #[must_use]
    pub fn compaction_due(&self) -> Option<Vec<ChunkRecord>> {
        let frames = self.log.log.lock().frames() as usize;
        let dead = frames.saturating_sub(self.records.len());
        (dead >= COMPACTION_FLOOR && dead > self.records.len())
            .then(|| self.records.values().cloned().collect())
    }

    /// Identifier of the chunk previously stored for `key`, if any.
    #[must_use]
    pub fn lookup_key(&self, key: &str) -> Option<ChunkId> {
        self.keys.get(key).copied()
    }

    #[must_use]
    pub fn contains(&self, id: ChunkId) -> bool {
        self.records.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sequence number of the most recent write, 0 for an empty log.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Identifier the next fresh chunk will receive.
    #[must_use]
    pub fn next_id(&self) -> ChunkId {
        self.next_id
    }

    /// Dimensionality established by the first stored chunk.
    #[must_use]
    pub fn dimension(&self) -> Option<EmbeddingDimension> {
        self.dimension
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
