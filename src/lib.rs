//! Incremental semantic projection of a growing text corpus.
//!
//! Chunks are stored durably with their embeddings, linked into a fuzzy
//! k-nearest-neighbor graph and placed in a 2-D or 3-D layout that is
//! refined locally on every insert and globally in the background.

pub mod chunking;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod graph;
#[cfg(feature = "http-server")]
pub mod http;
pub mod io;
pub mod layout;
pub mod logging;
pub mod query;
pub mod service;
pub mod store;
pub mod types;

// Explicit exports for better API clarity
pub use chunking::Chunker;
pub use config::Settings;
pub use corpus::{
    ChunkFailure, ChunkView, Corpus, CorpusConfig, CorpusStats, IngestReport, InsertOutcome,
    PointView, SettleOutcome,
};
pub use embedding::{EmbeddingGenerator, HashingEmbedder, MockEmbeddingGenerator};
pub use error::{CorpusError, CorpusResult};
pub use query::{ProjectionMethod, SearchHit};
pub use service::CorpusService;
pub use store::{ChunkRecord, NewChunk, VectorStore};
pub use types::{ChunkId, ChunkState, EmbeddingDimension, LayoutDims, Score};
