//! HNSW insertion with bidirectional links and heuristic neighbor pruning.

use std::collections::HashSet;

use crate::hnsw::graph::HnswGraph;
use crate::hnsw::search::search_layer;

impl HnswGraph {
    /// Insert a normalized vector and return its node id.
    ///
    /// The caller guarantees `vector.len() == self.dimension()`.
    pub fn insert(&mut self, vector: &[f32]) -> u32 {
        let level = self.random_level();

        let Some(entry_point) = self.entry_point else {
            let id = self.push_node(vector, level, vec![Vec::new(); level + 1]);
            self.entry_point = Some(id);
            self.max_layer = level;
            return id;
        };

        let mut visited = std::mem::take(&mut self.build_visited);
        visited.ensure_capacity(self.node_count() + 1);
        let any = |_: u32| true;

        // Phase 1: greedy descent to the new node's top layer.
        let mut current = entry_point;
        for layer in (level + 1..=self.max_layer).rev() {
            let nearest = search_layer(
                self,
                vector,
                std::slice::from_ref(&current),
                1,
                layer,
                &mut visited,
                &any,
                true,
            );
            if let Some(&(_, id)) = nearest.first() {
                current = id;
            }
        }

        // Phase 2: pick neighbors on every layer the node lives on.
        let top = level.min(self.max_layer);
        let mut links: Vec<Vec<u32>> = vec![Vec::new(); level + 1];
        let mut layer_eps = vec![current];
        for layer in (0..=top).rev() {
            let candidates = search_layer(
                self,
                vector,
                &layer_eps,
                self.config.ef_construction,
                layer,
                &mut visited,
                &any,
                true,
            );
            let selected = select_neighbors_heuristic(self, &candidates, self.max_links(layer));
            links[layer] = selected.iter().map(|&(_, id)| id).collect();

            layer_eps.clear();
            layer_eps.extend(candidates.iter().map(|&(_, id)| id));
            if layer_eps.is_empty() {
                layer_eps.push(entry_point);
            }
        }

        let id = self.push_node(vector, level, links);

        // Phase 3: back-links, pruning neighbors that went over capacity.
        for layer in 0..=top {
            let m_max = self.max_links(layer);
            let mine = self.neighbors[id as usize][layer].clone();
            for neighbor in mine {
                let nid = neighbor as usize;
                while self.neighbors[nid].len() <= layer {
                    self.neighbors[nid].push(Vec::new());
                }
                self.neighbors[nid][layer].push(id);

                if self.neighbors[nid][layer].len() > m_max {
                    let candidates: Vec<(f32, u32)> = self.neighbors[nid][layer]
                        .iter()
                        .map(|&cid| (self.node_distance(neighbor, cid), cid))
                        .collect();
                    let pruned = select_neighbors_heuristic(self, &candidates, m_max);
                    self.neighbors[nid][layer] = pruned.iter().map(|&(_, cid)| cid).collect();
                }
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(id);
        }
        self.build_visited = visited;
        id
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m_max0
        } else {
            self.config.m
        }
    }
}

/// Neighbor selection heuristic (algorithm 4 of the HNSW paper).
///
/// A candidate is kept only if it is closer to the base than to every
/// neighbor already kept. Remaining slots are filled with the closest
/// leftovers.
fn select_neighbors_heuristic(
    graph: &HnswGraph,
    candidates: &[(f32, u32)],
    m: usize,
) -> Vec<(f32, u32)> {
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut selected: Vec<(f32, u32)> = Vec::with_capacity(m);
    for &(dist_to_base, cid) in &sorted {
        if selected.len() >= m {
            break;
        }
        let diverse = selected
            .iter()
            .all(|&(_, sid)| dist_to_base <= graph.node_distance(cid, sid));
        if diverse {
            selected.push((dist_to_base, cid));
        }
    }

    if selected.len() < m {
        let chosen: HashSet<u32> = selected.iter().map(|&(_, id)| id).collect();
        for &(dist, cid) in &sorted {
            if selected.len() >= m {
                break;
            }
            if !chosen.contains(&cid) {
                selected.push((dist, cid));
            }
        }
    }

    selected
}
