//! Snapshot files persisted next to the record log.
//!
//! `snapshot.bin` carries derived state (neighbor graph, layout, generation)
//! and is always replaced atomically through a temp file in the same
//! directory. `metadata.json` is a human-readable summary of the corpus,
//! replaced the same way.

use std::io::Write;
use std::path::Path;

use bincode::serde::{decode_from_slice, encode_to_vec};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::config::Metric;
use crate::error::{CorpusError, CorpusResult, StorageContext};
use crate::types::LayoutDims;

pub const SNAPSHOT_FILE: &str = "snapshot.bin";
pub const METADATA_FILE: &str = "metadata.json";

const SNAPSHOT_MAGIC: &[u8; 4] = b"ATSN";
const SNAPSHOT_VERSION: u32 = 1;

/// Writes `value` to `dir/snapshot.bin`, replacing any previous snapshot atomically.
pub fn write_snapshot<T: Serialize>(dir: &Path, value: &T) -> CorpusResult<()> {
    write_snapshot_payload(dir, &encode_snapshot(value)?)
}

/// Bincode payload of a snapshot, for writing later without holding `value`.
pub fn encode_snapshot<T: Serialize>(value: &T) -> CorpusResult<Vec<u8>> {
    Ok(encode_to_vec(value, bincode::config::standard())?)
}

/// Writes a payload produced by [`encode_snapshot`].
pub fn write_snapshot_payload(dir: &Path, payload: &[u8]) -> CorpusResult<()> {
    write_atomic(
        dir,
        SNAPSHOT_FILE,
        &[SNAPSHOT_MAGIC, &SNAPSHOT_VERSION.to_le_bytes(), payload],
    )
}

/// Replaces `dir/name` with `parts` through a synced temp file in `dir`.
fn write_atomic(dir: &Path, name: &str, parts: &[&[u8]]) -> CorpusResult<()> {
    std::fs::create_dir_all(dir).at_path(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).at_path(dir)?;
    for part in parts {
        tmp.write_all(part).at_path(tmp.path())?;
    }
    tmp.as_file().sync_data().at_path(tmp.path())?;

    let target = dir.join(name);
    tmp.persist(&target).map_err(|e| e.error).at_path(&target)?;
    Ok(())
}

/// Reads `dir/snapshot.bin`. Returns `Ok(None)` when no snapshot exists yet.
pub fn read_snapshot<T: DeserializeOwned>(dir: &Path) -> CorpusResult<Option<T>> {
    let path = dir.join(SNAPSHOT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path).at_path(&path)?;
    if bytes.len() < 8 || &bytes[0..4] != SNAPSHOT_MAGIC {
        return Err(CorpusError::InvalidFormat {
            reason: format!("{} is not a corpus snapshot", path.display()),
        });
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != SNAPSHOT_VERSION {
        return Err(CorpusError::VersionMismatch {
            expected: SNAPSHOT_VERSION,
            actual: version,
        });
    }
    let (value, _) = decode_from_slice(&bytes[8..], bincode::config::standard())?;
    Ok(Some(value))
}

/// Human-readable summary of a corpus, kept in `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusMetadata {
    /// Version of the metadata format
    pub version: u32,

    /// Embedding dimension, once established
    pub dimension: Option<usize>,

    pub metric: Metric,

    pub layout_dims: LayoutDims,

    pub chunk_count: usize,

    /// Incremented by every reset
    pub generation: u64,

    /// RFC 3339 timestamp when created
    pub created_at: String,

    /// RFC 3339 timestamp when last updated
    pub updated_at: String,
}

impl CorpusMetadata {
    const CURRENT_VERSION: u32 = 1;

    pub fn new(metric: Metric, layout_dims: LayoutDims) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            version: Self::CURRENT_VERSION,
            dimension: None,
            metric,
            layout_dims,
            chunk_count: 0,
            generation: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Refresh counts and the update timestamp
    pub fn update(&mut self, dimension: Option<usize>, chunk_count: usize, generation: u64) {
        self.dimension = dimension;
        self.chunk_count = chunk_count;
        self.generation = generation;
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }

    pub fn save(&self, dir: &Path) -> CorpusResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(dir, METADATA_FILE, &[json.as_bytes()])
    }

    pub fn load(dir: &Path) -> CorpusResult<Option<Self>> {
        let path = dir.join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path).at_path(&path)?;
        let metadata: Self = serde_json::from_str(&json)?;

        if metadata.version > Self::CURRENT_VERSION {
            return Err(CorpusError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                actual: metadata.version,
            });
        }

        Ok(Some(metadata))
    }
}
