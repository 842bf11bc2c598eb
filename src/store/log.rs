//! Append-only record log backing the vector store.
//!
//! # Storage Format
//!
//! - Header (16 bytes): magic `ATLS`, format version, embedding dimension
//!   (0 until the first record establishes it), frame count
//! - Frames: `u32` little-endian payload length followed by a bincode-encoded
//!   [`LogEntry`]
//!
//! Appends go through a regular file handle and are `sync_data`'d before
//! returning. Replay memory-maps the file and walks the frames; a torn frame
//! at the tail (crash during append) is truncated away.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bincode::serde::{decode_from_slice, encode_to_vec};
use memmap2::MmapOptions;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CorpusError, CorpusResult, StorageContext};
use crate::store::ChunkRecord;
use crate::types::ChunkId;

/// Current log format version.
pub const LOG_VERSION: u32 = 1;

/// Size of the log header in bytes.
const HEADER_SIZE: usize = 16;

/// Magic bytes to identify record log files.
const MAGIC_BYTES: &[u8; 4] = b"ATLS";

/// Bytes of the per-frame length prefix.
const FRAME_PREFIX: usize = 4;

/// One durable mutation of the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogEntry {
    Put(ChunkRecord),
    Remove(ChunkId),
}

/// Result of replaying a log from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub dimension: Option<usize>,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug)]
pub struct RecordLog {
    path: PathBuf,
    file: File,
    dimension: Option<usize>,
    frames: u32,
}

impl RecordLog {
    /// Opens the log at `path`, creating an empty one if missing, and replays it.
    pub fn open(path: impl AsRef<Path>) -> CorpusResult<(Self, Replay)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).at_path(parent)?;
        }

        if !path.exists() || std::fs::metadata(&path).at_path(&path)?.len() == 0 {
            let log = Self::create(&path, None)?;
            return Ok((log, Replay::default()));
        }

        let replay = Self::replay(&path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .at_path(&path)?;
        let frames = replay.entries.len() as u32;
        let mut log = Self {
            path,
            file,
            dimension: replay.dimension,
            frames,
        };
        log.write_header()?;
        Ok((log, replay))
    }

    /// Truncates (or creates) the log with a fresh header.
    fn create(path: &Path, dimension: Option<usize>) -> CorpusResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .at_path(path)?;
        let mut log = Self {
            path: path.to_path_buf(),
            file,
            dimension,
            frames: 0,
        };
        log.write_header()?;
        Ok(log)
    }

    fn replay(path: &Path) -> CorpusResult<Replay> {
        let file = File::open(path).at_path(path)?;
        // SAFETY: the log is only mutated by this process through the writer path,
        // which is not active while replaying.
        let mmap = unsafe { MmapOptions::new().map(&file) }.at_path(path)?;

        let (version, dimension, _count) = read_header(&mmap)?;
        if version != LOG_VERSION {
            return Err(CorpusError::VersionMismatch {
                expected: LOG_VERSION,
                actual: version,
            });
        }

        let mut entries = Vec::new();
        let mut offset = HEADER_SIZE;
        let mut valid_end = HEADER_SIZE;
        while offset + FRAME_PREFIX <= mmap.len() {
            let len = u32::from_le_bytes([
                mmap[offset],
                mmap[offset + 1],
                mmap[offset + 2],
                mmap[offset + 3],
            ]) as usize;
            let start = offset + FRAME_PREFIX;
            let Some(end) = start.checked_add(len).filter(|end| *end <= mmap.len()) else {
                break;
            };
            match decode_from_slice::<LogEntry, _>(&mmap[start..end], bincode::config::standard()) {
                Ok((entry, _)) => entries.push(entry),
                Err(e) => {
                    warn!(offset, error = %e, "undecodable frame in record log");
                    break;
                }
            }
            offset = end;
            valid_end = end;
        }

        let file_len = mmap.len();
        drop(mmap);
        if valid_end < file_len {
            warn!(
                path = %path.display(),
                dropped_bytes = file_len - valid_end,
                "truncating torn tail of record log"
            );
            let file = OpenOptions::new().write(true).open(path).at_path(path)?;
            file.set_len(valid_end as u64).at_path(path)?;
            file.sync_data().at_path(path)?;
        }

        debug!(path = %path.display(), frames = entries.len(), "replayed record log");
        Ok(Replay {
            dimension: (dimension != 0).then_some(dimension as usize),
            entries,
        })
    }

    /// Appends one entry and makes it durable before returning.
    pub fn append(&mut self, entry: &LogEntry) -> CorpusResult<()> {
        if let LogEntry::Put(record) = entry
            && self.dimension.is_none()
        {
            self.dimension = Some(record.embedding.len());
        }

        let payload = encode_to_vec(entry, bincode::config::standard())?;
        let len = u32::try_from(payload.len()).map_err(|_| CorpusError::InvalidFormat {
            reason: format!("record of {} bytes exceeds frame limit", payload.len()),
        })?;

        let mut frame = Vec::with_capacity(FRAME_PREFIX + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);

        self.file.seek(SeekFrom::End(0)).at_path(&self.path)?;
        self.file.write_all(&frame).at_path(&self.path)?;
        self.frames = self.frames.saturating_add(1);
        self.write_header()?;
        self.file.sync_data().at_path(&self.path)?;
        Ok(())
    }

    /// Rewrites the log so it contains exactly `records`, atomically replacing the old file.
    pub fn compact<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a ChunkRecord>,
    ) -> CorpusResult<()> {
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).at_path(&dir)?;

        let mut frames = 0u32;
        let mut body = Vec::new();
        for record in records {
            let payload =
                encode_to_vec(LogEntry::Put(record.clone()), bincode::config::standard())?;
            body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            body.extend_from_slice(&payload);
            frames += 1;
        }

        let header = encode_header(self.dimension.unwrap_or(0) as u32, frames);
        tmp.write_all(&header).at_path(tmp.path())?;
        tmp.write_all(&body).at_path(tmp.path())?;
        tmp.as_file().sync_data().at_path(tmp.path())?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .at_path(&self.path)?;

        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .at_path(&self.path)?;
        self.frames = frames;
        debug!(path = %self.path.display(), frames, "compacted record log");
        Ok(())
    }

    /// Drops every record and forgets the established dimension.
    pub fn clear(&mut self) -> CorpusResult<()> {
        *self = Self::create(&self.path, None)?;
        self.file.sync_data().at_path(&self.path)?;
        Ok(())
    }

    #[must_use]
    pub fn frames(&self) -> u32 {
        self.frames
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&mut self) -> CorpusResult<()> {
        let header = encode_header(self.dimension.unwrap_or(0) as u32, self.frames);
        self.file.seek(SeekFrom::Start(0)).at_path(&self.path)?;
        self.file.write_all(&header).at_path(&self.path)?;
        Ok(())
    }
}

fn encode_header(dimension: u32, frames: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(MAGIC_BYTES);
    header[4..8].copy_from_slice(&LOG_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&dimension.to_le_bytes());
    header[12..16].copy_from_slice(&frames.to_le_bytes());
    header
}

fn read_header(bytes: &[u8]) -> CorpusResult<(u32, u32, u32)> {
    if bytes.len() < HEADER_SIZE {
        return Err(CorpusError::InvalidFormat {
            reason: "record log too small to contain header".to_string(),
        });
    }
    if &bytes[0..4] != MAGIC_BYTES {
        return Err(CorpusError::InvalidFormat {
            reason: "invalid magic bytes in record log".to_string(),
        });
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let dimension = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let count = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    Ok((version, dimension, count))
}
