//! HNSW graph storage and configuration.
//!
//! The graph uses a struct-of-arrays layout: vectors live contiguously in one
//! arena, with parallel arrays for neighbor lists, layer assignments, and
//! validity markers. Nodes are never physically removed; invalid nodes keep
//! routing traffic but are excluded from results.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use affinity_core::config::IndexConfig;
use affinity_core::types::dot;

use crate::hnsw::visited::VisitedSet;

/// Tuning parameters of an HNSW graph.
#[derive(Debug, Clone, PartialEq)]
pub struct HnswConfig {
    /// Links per node on upper layers.
    pub m: usize,
    /// Links per node on layer 0.
    pub m_max0: usize,
    /// Candidate list size during construction.
    pub ef_construction: usize,
    /// Candidate list size during search.
    pub ef_search: usize,
    /// Maximum number of layers.
    pub max_layers: usize,
    /// Seed for the layer generator.
    pub seed: u64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self::from(&IndexConfig::default())
    }
}

impl From<&IndexConfig> for HnswConfig {
    fn from(config: &IndexConfig) -> Self {
        Self {
            m: config.m.max(2),
            m_max0: config.m_max0.max(config.m),
            ef_construction: config.ef_construction.max(1),
            ef_search: config.ef_search.max(1),
            max_layers: config.max_layers.clamp(1, u8::MAX as usize),
            seed: config.seed,
        }
    }
}

/// HNSW graph over L2-normalized vectors, using inner-product distance
/// (`1 - <a, b>`).
#[derive(Debug)]
pub struct HnswGraph {
    pub config: HnswConfig,
    vectors: Vec<f32>,
    /// `[node][layer][neighbor]`
    pub(crate) neighbors: Vec<Vec<Vec<u32>>>,
    layers: Vec<u8>,
    valid: Vec<bool>,
    pub(crate) entry_point: Option<u32>,
    pub(crate) max_layer: usize,
    dimension: usize,
    rng: StdRng,
    /// Reused across inserts so construction does not reallocate per node.
    pub(crate) build_visited: VisitedSet,
}

impl HnswGraph {
    pub fn new(dimension: usize, config: HnswConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            vectors: Vec::new(),
            neighbors: Vec::new(),
            layers: Vec::new(),
            valid: Vec::new(),
            entry_point: None,
            max_layer: 0,
            dimension,
            rng,
            build_visited: VisitedSet::default(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of nodes, valid or not.
    pub fn node_count(&self) -> usize {
        self.layers.len()
    }

    /// Number of valid nodes.
    pub fn live_count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn max_layer(&self) -> usize {
        self.max_layer
    }

    /// Draw a layer from the exponential distribution with `mL = 1 / ln(M)`.
    pub(crate) fn random_level(&mut self) -> usize {
        let ml = 1.0 / (self.config.m as f64).ln();
        // In (0, 1], so the log is finite.
        let r: f64 = 1.0 - self.rng.random::<f64>();
        let level = (-r.ln() * ml).floor() as usize;
        level.min(self.config.max_layers - 1)
    }

    #[inline]
    pub fn vector(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    /// Distance from an arbitrary query to a node.
    #[inline]
    pub fn distance(&self, query: &[f32], id: u32) -> f32 {
        1.0 - dot(query, self.vector(id))
    }

    /// Distance between two nodes.
    #[inline]
    pub(crate) fn node_distance(&self, a: u32, b: u32) -> f32 {
        1.0 - dot(self.vector(a), self.vector(b))
    }

    #[inline]
    pub fn is_valid(&self, id: u32) -> bool {
        self.valid.get(id as usize).copied().unwrap_or(false)
    }

    /// Mark a node invalid. Returns `false` if it was unknown or already
    /// invalid.
    pub fn invalidate(&mut self, id: u32) -> bool {
        match self.valid.get_mut(id as usize) {
            Some(slot) if *slot => {
                *slot = false;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn push_node(&mut self, vector: &[f32], level: usize, links: Vec<Vec<u32>>) -> u32 {
        let id = self.layers.len() as u32;
        self.vectors.extend_from_slice(vector);
        self.neighbors.push(links);
        self.layers.push(level as u8);
        self.valid.push(true);
        id
    }

    /// Iterate over the ids of valid nodes.
    pub fn valid_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.valid
            .iter()
            .enumerate()
            .filter(|(_, v)| **v)
            .map(|(i, _)| i as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_index_config() {
        let config = HnswConfig::from(&IndexConfig::default());
        assert_eq!(config.m, 32);
        assert_eq!(config.m_max0, 64);
        assert_eq!(config.ef_construction, 40);
        assert_eq!(config.ef_search, 16);
    }

    #[test]
    fn test_random_level_is_bounded_and_seeded() {
        let config = HnswConfig {
            m: 2,
            max_layers: 4,
            ..Default::default()
        };
        let mut a = HnswGraph::new(2, config.clone());
        let mut b = HnswGraph::new(2, config);
        for _ in 0..1000 {
            let level = a.random_level();
            assert!(level < 4);
            assert_eq!(level, b.random_level());
        }
    }

    #[test]
    fn test_invalidate() {
        let mut graph = HnswGraph::new(2, HnswConfig::default());
        let id = graph.push_node(&[1.0, 0.0], 0, vec![Vec::new()]);
        assert!(graph.is_valid(id));
        assert_eq!(graph.live_count(), 1);
        assert!(graph.invalidate(id));
        assert!(!graph.invalidate(id));
        assert!(!graph.invalidate(42));
        assert_eq!(graph.live_count(), 0);
        assert_eq!(graph.node_count(), 1);
        assert!((graph.distance(&[1.0, 0.0], id)).abs() < 1e-6);
    }
}
