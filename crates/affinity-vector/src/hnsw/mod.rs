//! Hierarchical Navigable Small World (HNSW) approximate nearest neighbor graph.
//!
//! Vectors are L2-normalized before insertion, so the inner product equals
//! cosine similarity and distance is `1 - <a, b>`.

/// Graph storage and configuration.
pub mod graph;
/// Insertion with bidirectional links and heuristic pruning.
pub mod insert;
/// Layer search, KNN, and exhaustive scan.
pub mod search;
/// Generation-stamped visited set.
pub mod visited;

pub use graph::{HnswConfig, HnswGraph};
pub use search::{exact_search, knn_search, knn_search_filtered};
