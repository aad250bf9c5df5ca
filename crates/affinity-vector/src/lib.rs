//! Affinity Vector crate - encoders, HNSW index, ingestion pipeline,
//! semantic query cache, and the match engine.
//!
//! Provides an ONNX sentence encoder plus a deterministic feature-hash
//! encoder for tests and model-less deployments, an in-memory HNSW graph
//! behind an explicit [`IndexHandle`], and the [`MatchEngine`] that ranks
//! eligible owners by semantic similarity.

pub mod cache;
pub mod embedding;
pub mod hnsw;
pub mod index;
pub mod pipeline;
pub mod search;
pub mod service;

pub use cache::{CachePartition, CacheStats, SemanticCache};
pub use embedding::{Encoder, FeatureHashEncoder, OnnxTextEncoder};
pub use index::{IndexHandle, IndexStats, IndexedRecord, ScoredRecord};
pub use pipeline::{IngestRequest, IngestStatus, IngestionPipeline, ItemStatus};
pub use search::{
    EngineStats, Match, MatchEngine, MatchMeta, MatchResponse, OwnerComparison, SearchRequest,
    SimilarOwner,
};
pub use service::{EncoderService, MemoStats};
