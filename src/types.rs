//! Type-safe wrappers and core types shared by every layer of the corpus.
//!
//! Identifiers, dimensions and scores are newtypes so that a chunk id can
//! never be confused with a row index inside the optimizer, and so that
//! dimension checks happen in exactly one place.

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

use crate::error::CorpusError;

/// Stable identifier of a document chunk.
///
/// Uses `NonZeroU32` internally so that zero can never denote a real chunk
/// and `Option<ChunkId>` stays four bytes wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(NonZeroU32);

impl ChunkId {
    /// Creates a new `ChunkId` from a non-zero u32.
    ///
    /// Returns `None` if the provided ID is zero.
    #[must_use]
    pub fn new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(Self)
    }

    /// Creates a new `ChunkId`, panicking if zero.
    ///
    /// # Panics
    /// Panics if `id` is zero. Use `new()` for fallible construction.
    #[must_use]
    pub fn new_unchecked(id: u32) -> Self {
        Self(NonZeroU32::new(id).expect("ChunkId cannot be zero"))
    }

    /// Returns the underlying u32 value.
    #[must_use]
    pub fn get(&self) -> u32 {
        self.0.get()
    }

    /// Returns the identifier that follows this one.
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        self.0.get().checked_add(1).and_then(Self::new)
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dimensionality of the high-dimensional embedding space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingDimension(usize);

impl EmbeddingDimension {
    /// Creates a new dimension, rejecting zero.
    pub fn new(dim: usize) -> Result<Self, CorpusError> {
        if dim == 0 {
            return Err(CorpusError::Config {
                reason: "embedding dimension cannot be zero".to_string(),
            });
        }
        Ok(Self(dim))
    }

    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate(&self, vector: &[f32]) -> Result<(), CorpusError> {
        if vector.len() != self.0 {
            return Err(CorpusError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// Number of coordinates of the visual layout. Only 2-D and 3-D are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub enum LayoutDims {
    Two,
    Three,
}

impl LayoutDims {
    #[must_use]
    pub const fn get(&self) -> usize {
        match self {
            Self::Two => 2,
            Self::Three => 3,
        }
    }
}

impl TryFrom<usize> for LayoutDims {
    type Error = CorpusError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            other => Err(CorpusError::Config {
                reason: format!("layout dims must be 2 or 3, got {other}"),
            }),
        }
    }
}

impl From<LayoutDims> for usize {
    fn from(dims: LayoutDims) -> usize {
        dims.get()
    }
}

/// Relevance score in the range [0.0, 1.0].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(f32);

impl Score {
    /// Creates a new `Score`, rejecting NaN and values outside [0.0, 1.0].
    pub fn new(value: f32) -> Result<Self, CorpusError> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            return Err(CorpusError::InvalidScore { value });
        }
        Ok(Self(value))
    }

    /// Converts a non-negative distance to a score via `exp(-distance)`.
    #[must_use]
    pub fn from_distance(distance: f32) -> Self {
        let d = if distance.is_nan() { f32::INFINITY } else { distance.max(0.0) };
        Self((-d).exp().clamp(0.0, 1.0))
    }

    #[must_use]
    pub fn get(&self) -> f32 {
        self.0
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Lifecycle of a chunk. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    /// Embedding stored, no neighbors yet.
    Ingested,
    /// Neighbors computed and a provisional coordinate assigned.
    LocallyPlaced,
    /// Included in at least one global optimization pass.
    Settled,
}

impl ChunkState {
    /// Returns the later of the two states.
    #[must_use]
    pub fn advance(self, to: ChunkState) -> ChunkState {
        self.max(to)
    }
}
