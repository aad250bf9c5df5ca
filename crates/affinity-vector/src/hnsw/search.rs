//! HNSW search: single-layer beam search and multi-layer KNN.
//!
//! A predicate `Fn(u32) -> bool` may restrict results. Nodes rejected by the
//! predicate, and invalid nodes, are still used for navigation but never
//! returned.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;

use crate::hnsw::graph::HnswGraph;
use crate::hnsw::visited::VisitedSet;

thread_local! {
    static SEARCH_VISITED: RefCell<VisitedSet> = RefCell::new(VisitedSet::new(0));
}

/// Candidate ordered so the max-heap pops the closest node first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    neg_distance: OrderedFloat<f32>,
    id: u32,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.neg_distance.cmp(&other.neg_distance)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result ordered so the max-heap pops the farthest node first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResultEntry {
    distance: OrderedFloat<f32>,
    id: u32,
}

impl Ord for ResultEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.cmp(&other.distance)
    }
}

impl PartialOrd for ResultEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Beam search over one layer. Returns up to `ef` `(distance, id)` pairs of
/// valid nodes accepted by `filter`, closest first.
///
/// `include_invalid` lets construction link through invalid nodes.
#[allow(clippy::too_many_arguments)]
pub(crate) fn search_layer<F: Fn(u32) -> bool>(
    graph: &HnswGraph,
    query: &[f32],
    entry_points: &[u32],
    ef: usize,
    layer: usize,
    visited: &mut VisitedSet,
    filter: &F,
    include_invalid: bool,
) -> Vec<(f32, u32)> {
    visited.clear();
    let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<ResultEntry> = BinaryHeap::with_capacity(ef + 1);
    let mut worst = f32::MAX;
    let accept = |id: u32| (include_invalid || graph.is_valid(id)) && filter(id);

    for &ep in entry_points {
        if visited.insert(ep) {
            let dist = graph.distance(query, ep);
            candidates.push(Candidate {
                neg_distance: OrderedFloat(-dist),
                id: ep,
            });
            if accept(ep) {
                results.push(ResultEntry {
                    distance: OrderedFloat(dist),
                    id: ep,
                });
                if results.len() > ef {
                    results.pop();
                }
                if results.len() >= ef {
                    worst = results.peek().map_or(f32::MAX, |r| r.distance.0);
                }
            }
        }
    }

    while let Some(candidate) = candidates.pop() {
        let c_dist = -candidate.neg_distance.0;
        if results.len() >= ef && c_dist > worst {
            break;
        }

        let node = candidate.id as usize;
        let Some(links) = graph.neighbors[node].get(layer) else {
            continue;
        };

        for &neighbor in links {
            if !visited.insert(neighbor) {
                continue;
            }
            let dist = graph.distance(query, neighbor);
            if results.len() < ef || dist < worst {
                candidates.push(Candidate {
                    neg_distance: OrderedFloat(-dist),
                    id: neighbor,
                });
                if accept(neighbor) {
                    results.push(ResultEntry {
                        distance: OrderedFloat(dist),
                        id: neighbor,
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                    if results.len() >= ef {
                        worst = results.peek().map_or(f32::MAX, |r| r.distance.0);
                    }
                }
            }
        }
    }

    results
        .into_sorted_vec()
        .into_iter()
        .map(|r| (r.distance.0, r.id))
        .collect()
}

/// K nearest valid nodes, closest first.
pub fn knn_search(graph: &HnswGraph, query: &[f32], k: usize) -> Vec<(f32, u32)> {
    knn_search_filtered(graph, query, k, &|_: u32| true)
}

/// K nearest valid nodes accepted by `filter`, closest first.
///
/// Layer 0 is searched with `max(ef_search, k)`; if the filter leaves fewer
/// than `k` results the beam is doubled, up to four times the base width.
pub fn knn_search_filtered<F: Fn(u32) -> bool>(
    graph: &HnswGraph,
    query: &[f32],
    k: usize,
    filter: &F,
) -> Vec<(f32, u32)> {
    let Some(entry_point) = graph.entry_point else {
        return Vec::new();
    };
    if k == 0 {
        return Vec::new();
    }

    SEARCH_VISITED.with(|cell| {
        let mut visited = cell.borrow_mut();
        visited.ensure_capacity(graph.node_count());

        let no_filter = |_: u32| true;
        let mut current = entry_point;
        for layer in (1..=graph.max_layer).rev() {
            let nearest = search_layer(
                graph,
                query,
                std::slice::from_ref(&current),
                1,
                layer,
                &mut *visited,
                &no_filter,
                true,
            );
            if let Some(&(_, id)) = nearest.first() {
                current = id;
            }
        }

        let base_ef = graph.config.ef_search.max(k);
        let max_ef = (base_ef * 4).min(graph.node_count()).max(base_ef);
        let mut ef = base_ef;
        let mut results;
        loop {
            results = search_layer(
                graph,
                query,
                std::slice::from_ref(&current),
                ef,
                0,
                &mut *visited,
                filter,
                false,
            );
            if results.len() >= k || ef >= max_ef {
                break;
            }
            ef = (ef * 2).min(max_ef);
        }

        results.truncate(k);
        results
    })
}

/// Exhaustive scan over every valid node accepted by `filter`, closest first.
pub fn exact_search<F: Fn(u32) -> bool>(
    graph: &HnswGraph,
    query: &[f32],
    k: usize,
    filter: &F,
) -> Vec<(f32, u32)> {
    let mut scored: Vec<(f32, u32)> = graph
        .valid_ids()
        .filter(|&id| filter(id))
        .map(|id| (graph.distance(query, id), id))
        .collect();
    scored.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::graph::HnswConfig;

    fn unit(v: &[f32]) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    fn circle_graph(n: usize) -> HnswGraph {
        let mut graph = HnswGraph::new(
            2,
            HnswConfig {
                m: 4,
                m_max0: 8,
                ef_construction: 32,
                ef_search: 8,
                max_layers: 4,
                seed: 7,
            },
        );
        for i in 0..n {
            let angle = i as f32 / n as f32 * std::f32::consts::TAU;
            graph.insert(&[angle.cos(), angle.sin()]);
        }
        graph
    }

    #[test]
    fn test_empty_graph_returns_nothing() {
        let graph = HnswGraph::new(2, HnswConfig::default());
        assert!(knn_search(&graph, &[1.0, 0.0], 5).is_empty());
    }

    #[test]
    fn test_knn_finds_nearest_on_circle() {
        let graph = circle_graph(200);
        let query = unit(&[1.0, 0.001]);
        let results = knn_search(&graph, &query, 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].1, 0);
        for pair in results.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
    }

    #[test]
    fn test_invalid_nodes_are_skipped() {
        let mut graph = circle_graph(50);
        graph.invalidate(0);
        let results = knn_search(&graph, &[1.0, 0.0], 5);
        assert!(results.iter().all(|&(_, id)| id != 0));
        assert_eq!(results.len(), 5);
    }

    #[test]
    fn test_filter_restricts_results() {
        let graph = circle_graph(100);
        let even = |id: u32| id % 2 == 0;
        let results = knn_search_filtered(&graph, &[1.0, 0.0], 10, &even);
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|&(_, id)| id % 2 == 0));
    }

    #[test]
    fn test_hnsw_agrees_with_exact_scan() {
        let graph = circle_graph(300);
        let query = unit(&[0.3, -0.7]);
        let approx: Vec<u32> = knn_search(&graph, &query, 5).into_iter().map(|r| r.1).collect();
        let exact: Vec<u32> = exact_search(&graph, &query, 5, &|_| true)
            .into_iter()
            .map(|r| r.1)
            .collect();
        assert_eq!(approx[0], exact[0]);
        let overlap = approx.iter().filter(|id| exact.contains(id)).count();
        assert!(overlap >= 4, "recall too low: {:?} vs {:?}", approx, exact);
    }
}
