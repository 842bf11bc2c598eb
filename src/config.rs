//! Configuration module for the corpus engine.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `ATLAS_` and use double underscores
//! to separate nested levels:
//! - `ATLAS_LAYOUT__EPOCHS=300` sets `layout.epochs`
//! - `ATLAS_GRAPH__N_NEIGHBORS=10` sets `graph.n_neighbors`
//! - `ATLAS_SETTLE__BACKGROUND=false` sets `settle.background`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::LayoutDims;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding the record log and snapshot files
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub graph: GraphConfig,

    #[serde(default)]
    pub layout: LayoutConfig,

    #[serde(default)]
    pub settle: SettleConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    /// "hashing", or a fastembed model name when built with the `fastembed` feature
    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkStrategy {
    TokenOverlap,
    Sentences,
    Paragraphs,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_strategy")]
    pub strategy: ChunkStrategy,

    #[serde(default = "default_tokens_per_chunk")]
    pub tokens_per_chunk: usize,

    /// Tokens shared between consecutive windows
    #[serde(default = "default_overlap")]
    pub overlap: usize,

    /// Sentences per chunk for the `sentences` strategy
    #[serde(default = "default_sentence_window")]
    pub sentence_window: usize,
}

/// Distance function used for neighbors and search. Fixed for the life of a corpus.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    Euclidean,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Cosine => write!(f, "cosine"),
            Metric::Euclidean => write!(f, "euclidean"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GraphConfig {
    #[serde(default = "default_n_neighbors")]
    pub n_neighbors: usize,

    #[serde(default = "default_metric")]
    pub metric: Metric,

    /// Corpus size above which neighbor lookups use random-projection buckets
    #[serde(default = "default_approximate_threshold")]
    pub approximate_threshold: usize,

    #[serde(default = "default_projection_tables")]
    pub projection_tables: usize,

    #[serde(default = "default_projection_bits")]
    pub projection_bits: usize,

    /// Fraction of incremental inserts (relative to corpus size) that triggers a full rebuild
    #[serde(default = "default_rebuild_ratio")]
    pub rebuild_ratio: f32,

    /// Blend between fuzzy union (1.0) and fuzzy intersection (0.0)
    #[serde(default = "default_mix_ratio")]
    pub mix_ratio: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LayoutConfig {
    #[serde(default = "default_dims")]
    pub dims: LayoutDims,

    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Epochs for the local settle after a single insert
    #[serde(default = "default_local_epochs")]
    pub local_epochs: usize,

    #[serde(default = "default_min_dist")]
    pub min_dist: f32,

    #[serde(default = "default_spread")]
    pub spread: f32,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    #[serde(default = "default_negative_sample_rate")]
    pub negative_sample_rate: usize,

    #[serde(default = "default_repulsion_strength")]
    pub repulsion_strength: f32,

    /// Per-coordinate clip applied to every gradient step
    #[serde(default = "default_max_step")]
    pub max_step: f32,

    /// Radius of the initial random scatter
    #[serde(default = "default_init_radius")]
    pub init_radius: f32,

    /// Coordinates beyond this magnitude count as diverged
    #[serde(default = "default_coordinate_bound")]
    pub coordinate_bound: f32,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SettleConfig {
    /// Run a global settle after this many inserts; 0 disables automatic settles
    #[serde(default = "default_global_every")]
    pub global_every: usize,

    /// Run automatic global settles on the background worker
    #[serde(default = "default_true")]
    pub background: bool,

    /// Maximum displacement of a settled point during a local settle
    #[serde(default = "default_containment_bound")]
    pub containment_bound: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum number of requests processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Directory of static assets served at `/`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_data_path() -> PathBuf {
    PathBuf::from(".atlas/corpus")
}
fn default_embedding_model() -> String {
    "hashing".to_string()
}
fn default_dimension() -> usize {
    512
}
fn default_chunk_strategy() -> ChunkStrategy {
    ChunkStrategy::TokenOverlap
}
fn default_tokens_per_chunk() -> usize {
    1000
}
fn default_overlap() -> usize {
    300
}
fn default_sentence_window() -> usize {
    5
}
fn default_n_neighbors() -> usize {
    15
}
fn default_metric() -> Metric {
    Metric::Cosine
}
fn default_approximate_threshold() -> usize {
    2048
}
fn default_projection_tables() -> usize {
    4
}
fn default_projection_bits() -> usize {
    8
}
fn default_rebuild_ratio() -> f32 {
    0.5
}
fn default_mix_ratio() -> f32 {
    1.0
}
fn default_dims() -> LayoutDims {
    LayoutDims::Two
}
fn default_epochs() -> usize {
    200
}
fn default_local_epochs() -> usize {
    30
}
fn default_min_dist() -> f32 {
    0.1
}
fn default_spread() -> f32 {
    1.0
}
fn default_learning_rate() -> f32 {
    1.0
}
fn default_negative_sample_rate() -> usize {
    5
}
fn default_repulsion_strength() -> f32 {
    1.0
}
fn default_max_step() -> f32 {
    4.0
}
fn default_init_radius() -> f32 {
    10.0
}
fn default_coordinate_bound() -> f32 {
    1e4
}
fn default_seed() -> u64 {
    42
}
fn default_global_every() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_containment_bound() -> f32 {
    0.5
}
fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_workers() -> usize {
    num_cpus::get()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_path: default_data_path(),
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            graph: GraphConfig::default(),
            layout: LayoutConfig::default(),
            settle: SettleConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimension: default_dimension(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_chunk_strategy(),
            tokens_per_chunk: default_tokens_per_chunk(),
            overlap: default_overlap(),
            sentence_window: default_sentence_window(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            n_neighbors: default_n_neighbors(),
            metric: default_metric(),
            approximate_threshold: default_approximate_threshold(),
            projection_tables: default_projection_tables(),
            projection_bits: default_projection_bits(),
            rebuild_ratio: default_rebuild_ratio(),
            mix_ratio: default_mix_ratio(),
        }
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            dims: default_dims(),
            epochs: default_epochs(),
            local_epochs: default_local_epochs(),
            min_dist: default_min_dist(),
            spread: default_spread(),
            learning_rate: default_learning_rate(),
            negative_sample_rate: default_negative_sample_rate(),
            repulsion_strength: default_repulsion_strength(),
            max_step: default_max_step(),
            init_radius: default_init_radius(),
            coordinate_bound: default_coordinate_bound(),
            seed: default_seed(),
        }
    }
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            global_every: default_global_every(),
            background: default_true(),
            containment_bound: default_containment_bound(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            workers: default_workers(),
            static_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

const CONFIG_DIR: &str = ".atlas";
const CONFIG_FILE: &str = "settings.toml";

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));
        Self::figment(config_path).extract().map_err(Box::new)
    }

    /// Load configuration from a specific file, still honoring environment overrides
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(path.as_ref().to_path_buf())
            .extract()
            .map_err(Box::new)
    }

    fn figment(config_path: PathBuf) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_path))
            // Double underscore separates nested levels; single underscores stay in field names
            .merge(Env::prefixed("ATLAS_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
    }

    /// Find `.atlas/settings.toml` from the current directory upward
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE));
            }
        }

        None
    }

    /// Check if configuration is properly initialized
    pub fn check_init() -> Result<(), String> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));

        if !config_path.exists() {
            return Err("No configuration file found".to_string());
        }

        match std::fs::read_to_string(&config_path) {
            Ok(content) => {
                if let Err(e) = toml::from_str::<Settings>(&content) {
                    return Err(format!(
                        "Configuration file is corrupted: {e}\nRun 'atlas init --force' to regenerate."
                    ));
                }
            }
            Err(e) => {
                return Err(format!("Cannot read configuration file: {e}"));
            }
        }

        Ok(())
    }

    /// Save current configuration to file
    pub fn save(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file with helpful comments
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let template = format!(
            r#"# Corpus Atlas Configuration File

# Version of the configuration schema
version = 1

# Directory holding chunks.log, snapshot.bin and metadata.json
data_path = ".atlas/corpus"

[embedding]
# "hashing" is deterministic and offline. With the `fastembed` feature,
# "AllMiniLML6V2" loads a sentence-transformer model (dimension 384).
model = "hashing"
dimension = 512

[chunking]
# "token-overlap", "sentences" or "paragraphs"
strategy = "token-overlap"
tokens_per_chunk = 1000
overlap = 300
sentence_window = 5

[graph]
n_neighbors = 15
# "cosine" or "euclidean". Fixed once the corpus has data.
metric = "cosine"
# Above this many chunks, neighbor lookups use random-projection buckets
approximate_threshold = 2048
projection_tables = 4
projection_bits = 8
# Rebuild every neighbor list once incremental inserts exceed this share of the corpus
rebuild_ratio = 0.5
mix_ratio = 1.0

[layout]
# 2 or 3
dims = 2
epochs = 200
local_epochs = 30
min_dist = 0.1
spread = 1.0
learning_rate = 1.0
negative_sample_rate = 5
repulsion_strength = 1.0
max_step = 4.0
init_radius = 10.0
coordinate_bound = 10000.0
seed = 42

[settle]
# Global settle after this many inserts (0 = only on demand)
global_every = 100
background = true
# Maximum distance a settled point may move during a local settle
containment_bound = 0.5

[server]
bind = "127.0.0.1:8080"
workers = {workers}
# static_dir = "web/dist"

[logging]
# Overridden by RUST_LOG
level = "info"
"#,
            workers = default_workers()
        );

        std::fs::write(&config_path, template)?;

        Ok(config_path)
    }
}
