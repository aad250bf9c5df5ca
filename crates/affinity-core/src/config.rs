use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AffinityError, Result};

/// Top-level configuration for the Affinity matching engine.
///
/// Loaded from `~/.affinity/config.toml` by default. Each section corresponds
/// to one stage of the ingest/search path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AffinityConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl AffinityConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AffinityConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AffinityError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.encoder.dimensions == 0 {
            return Err(AffinityError::Config(
                "encoder.dimensions must be positive".to_string(),
            ));
        }
        if self.index.m < 2 {
            return Err(AffinityError::Config("index.m must be at least 2".to_string()));
        }
        if self.index.max_layers == 0 {
            return Err(AffinityError::Config(
                "index.max_layers must be positive".to_string(),
            ));
        }
        if self.ingest.batch_size == 0 {
            return Err(AffinityError::Config(
                "ingest.batch_size must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.search.similarity_threshold) {
            return Err(AffinityError::Config(
                "search.similarity_threshold must be within [0, 1]".to_string(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(AffinityError::Config(
                "cache.similarity_threshold must be within [-1, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory holding the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.affinity/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Directory with `model.onnx` and `tokenizer.json`. When unset the
    /// feature-hashing encoder is used.
    pub model_dir: Option<String>,
    /// Model name, informational.
    pub model_name: String,
    /// Published output dimension `D`.
    pub dimensions: usize,
    /// Number of recent raw inputs whose vectors are memoized.
    pub memo_capacity: u64,
    /// Concurrent encode slots. 0 means one per available core.
    pub workers: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            model_name: "all-MiniLM-L6-v2".to_string(),
            dimensions: 384,
            memo_capacity: 1000,
            workers: 0,
        }
    }
}

/// HNSW index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Neighbors per node on upper layers.
    pub m: usize,
    /// Neighbors per node on layer 0 (typically `2 * m`).
    pub m_max0: usize,
    /// Candidate list size while building.
    pub ef_construction: usize,
    /// Candidate list size while searching.
    pub ef_search: usize,
    /// Upper bound on the number of graph layers.
    pub max_layers: usize,
    /// Seed for layer assignment, so rebuilds are reproducible.
    pub seed: u64,
    /// Only bulk-load records of verified owners at startup.
    pub verified_only_bulk_load: bool,
    /// Stale/total ratio above which a compaction rebuild is recommended.
    pub compaction_stale_ratio: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: 32,
            m_max0: 64,
            ef_construction: 40,
            ef_search: 16,
            max_layers: 16,
            seed: 0x5eed,
            verified_only_bulk_load: true,
            compaction_stale_ratio: 0.25,
        }
    }
}

/// Ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Items encoded and written per batch.
    pub batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { batch_size: 32 }
    }
}

/// Match search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Page size used when the caller does not give one.
    pub default_page_size: usize,
    /// Largest page size a caller may request.
    pub max_page_size: usize,
    /// ANN candidates fetched per requested result.
    pub overfetch_factor: usize,
    /// Lower bound on ANN candidates fetched per query.
    pub min_candidates: usize,
    /// Default floor on the `[0, 1]` similarity score.
    pub similarity_threshold: f64,
    /// Deadline for the encode and store-lookup steps of a query.
    pub query_timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_page_size: 10,
            max_page_size: 100,
            overfetch_factor: 8,
            min_candidates: 100,
            similarity_threshold: 0.0,
            query_timeout_ms: 5_000,
        }
    }
}

/// Semantic query cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cosine similarity at or above which two queries share a cache entry.
    pub similarity_threshold: f32,
    /// Entry lifetime in seconds.
    pub ttl_secs: u64,
    /// Maximum number of cached queries.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.95,
            ttl_secs: 24 * 60 * 60,
            capacity: 1024,
        }
    }
}
