use super::{squared_l2, EmbeddingMatrix};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// Hard cap on sampled node levels; the geometric distribution makes higher
/// levels astronomically unlikely anyway.
const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct HnswParams {
    /// Maximum out-degree per node above layer 0 (layer 0 allows `2 * m`).
    pub m: usize,
    /// Beam width while inserting.
    pub ef_construction: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 32,
            ef_construction: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct DistEntry {
    dist: f32,
    id: usize,
}

impl Eq for DistEntry {}

impl Ord for DistEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for DistEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// HNSW-style approximate-nearest-neighbor graph over the embedding matrix,
/// squared-L2 distance. The graph stores adjacency only; vectors stay in the
/// matrix, which callers pass back in at query time.
///
/// Node levels derive from a hash of the ordinal, so rebuilding over the same
/// matrix reproduces the same graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswIndex {
    m: usize,
    m0: usize,
    ef_construction: usize,
    entry_point: Option<usize>,
    max_level: usize,
    levels: Vec<usize>,
    /// `neighbors[node][layer]` holds the node's adjacency at that layer.
    neighbors: Vec<Vec<Vec<usize>>>,
}

impl HnswIndex {
    pub fn build(matrix: &EmbeddingMatrix, params: HnswParams) -> Self {
        let mut index = Self {
            m: params.m,
            m0: params.m * 2,
            ef_construction: params.ef_construction,
            entry_point: None,
            max_level: 0,
            levels: Vec::with_capacity(matrix.len()),
            neighbors: Vec::with_capacity(matrix.len()),
        };

        for id in 0..matrix.len() {
            index.insert(matrix, id);
        }

        index
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// The `k` approximate nearest neighbors of `query`, ascending by squared
    /// L2 distance. `ef` bounds the layer-0 beam and is clamped to at least `k`.
    pub fn search(
        &self,
        matrix: &EmbeddingMatrix,
        query: &[f32],
        k: usize,
        ef: usize,
    ) -> Vec<(usize, f32)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };

        let mut current = entry;
        for layer in (1..=self.max_level).rev() {
            current = self.greedy_closest(matrix, query, current, layer);
        }

        let mut nearest = self.search_layer(matrix, query, current, 0, ef.max(k));
        nearest.truncate(k);
        nearest.into_iter().map(|entry| (entry.id, entry.dist)).collect()
    }

    fn insert(&mut self, matrix: &EmbeddingMatrix, id: usize) {
        let level = sampled_level(id, self.m);
        self.levels.push(level);
        self.neighbors.push(vec![Vec::new(); level + 1]);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_level = level;
            return;
        };

        let query = matrix.row(id).to_vec();
        let mut current = entry;
        for layer in (level + 1..=self.max_level).rev() {
            current = self.greedy_closest(matrix, &query, current, layer);
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates =
                self.search_layer(matrix, &query, current, layer, self.ef_construction);
            let cap = if layer == 0 { self.m0 } else { self.m };

            let selected: Vec<usize> = candidates.iter().take(self.m).map(|c| c.id).collect();
            for &neighbor in &selected {
                self.neighbors[id][layer].push(neighbor);
                self.neighbors[neighbor][layer].push(id);
                if self.neighbors[neighbor][layer].len() > cap {
                    self.prune(matrix, neighbor, layer, cap);
                }
            }

            if let Some(closest) = candidates.first() {
                current = closest.id;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(id);
        }
    }

    /// Hill-climb to the locally closest node on one layer.
    fn greedy_closest(
        &self,
        matrix: &EmbeddingMatrix,
        query: &[f32],
        start: usize,
        layer: usize,
    ) -> usize {
        let mut current = start;
        let mut best = squared_l2(query, matrix.row(current));

        loop {
            let mut improved = false;
            for &neighbor in &self.neighbors[current][layer] {
                let dist = squared_l2(query, matrix.row(neighbor));
                if dist < best {
                    best = dist;
                    current = neighbor;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one layer; returns up to `ef` entries ascending by
    /// distance.
    fn search_layer(
        &self,
        matrix: &EmbeddingMatrix,
        query: &[f32],
        entry: usize,
        layer: usize,
        ef: usize,
    ) -> Vec<DistEntry> {
        let start = DistEntry {
            dist: squared_l2(query, matrix.row(entry)),
            id: entry,
        };

        let mut visited: HashSet<usize> = HashSet::from([entry]);
        let mut candidates: BinaryHeap<std::cmp::Reverse<DistEntry>> =
            BinaryHeap::from([std::cmp::Reverse(start)]);
        let mut results: BinaryHeap<DistEntry> = BinaryHeap::from([start]);

        while let Some(std::cmp::Reverse(nearest)) = candidates.pop() {
            let furthest = results
                .peek()
                .map(|entry| entry.dist)
                .unwrap_or(f32::INFINITY);
            if nearest.dist > furthest && results.len() >= ef {
                break;
            }

            for &neighbor in &self.neighbors[nearest.id][layer] {
                if !visited.insert(neighbor) {
                    continue;
                }
                let dist = squared_l2(query, matrix.row(neighbor));
                let furthest = results
                    .peek()
                    .map(|entry| entry.dist)
                    .unwrap_or(f32::INFINITY);
                if results.len() < ef || dist < furthest {
                    let entry = DistEntry { dist, id: neighbor };
                    candidates.push(std::cmp::Reverse(entry));
                    results.push(entry);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    /// Keeps the `cap` nearest links of a node on one layer.
    fn prune(&mut self, matrix: &EmbeddingMatrix, node: usize, layer: usize, cap: usize) {
        let anchor = matrix.row(node).to_vec();
        let mut links: Vec<DistEntry> = self.neighbors[node][layer]
            .iter()
            .map(|&id| DistEntry {
                dist: squared_l2(&anchor, matrix.row(id)),
                id,
            })
            .collect();
        links.sort();
        links.truncate(cap);
        self.neighbors[node][layer] = links.into_iter().map(|entry| entry.id).collect();
    }
}

/// Geometric level from a splitmix64 hash of the ordinal: deterministic
/// across rebuilds of the same corpus.
fn sampled_level(id: usize, m: usize) -> usize {
    let mut state = (id as u64).wrapping_add(0x9e3779b97f4a7c15);
    state = (state ^ (state >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    state = (state ^ (state >> 27)).wrapping_mul(0x94d049bb133111eb);
    state ^= state >> 31;

    let uniform = ((state >> 11) as f64 + 1.0) / ((1u64 << 53) as f64 + 1.0);
    let scale = 1.0 / (m.max(2) as f64).ln();
    ((-uniform.ln() * scale) as usize).min(MAX_LEVEL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::EmbeddingMatrix;

    fn grid_matrix() -> EmbeddingMatrix {
        // 5x5 grid of 2-d points, ordinal = y * 5 + x.
        let rows: Vec<Vec<f32>> = (0..25)
            .map(|i| vec![(i % 5) as f32, (i / 5) as f32])
            .collect();
        EmbeddingMatrix::from_rows(rows).expect("uniform rows")
    }

    #[test]
    fn search_finds_the_exact_nearest_on_a_small_grid() {
        let matrix = grid_matrix();
        let index = HnswIndex::build(&matrix, HnswParams { m: 8, ef_construction: 50 });

        let hits = index.search(&matrix, &[2.1, 3.2], 3, 50);

        assert_eq!(hits.len(), 3);
        // (2, 3) is ordinal 17.
        assert_eq!(hits[0].0, 17);
        assert!(hits[0].1 <= hits[1].1 && hits[1].1 <= hits[2].1);
    }

    #[test]
    fn build_is_deterministic() {
        let matrix = grid_matrix();
        let params = HnswParams::default();

        let first = HnswIndex::build(&matrix, params);
        let second = HnswIndex::build(&matrix, params);

        assert_eq!(first, second);
    }

    #[test]
    fn empty_matrix_builds_an_empty_index() {
        let matrix = EmbeddingMatrix::empty();
        let index = HnswIndex::build(&matrix, HnswParams::default());

        assert!(index.is_empty());
        assert!(index.search(&matrix, &[1.0, 2.0], 5, 50).is_empty());
    }

    #[test]
    fn single_vector_index_returns_it() {
        let matrix = EmbeddingMatrix::from_rows(vec![vec![1.0, 1.0]]).expect("one row");
        let index = HnswIndex::build(&matrix, HnswParams::default());

        let hits = index.search(&matrix, &[0.0, 0.0], 5, 50);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 0);
        assert_eq!(hits[0].1, 2.0);
    }

    #[test]
    fn serialization_round_trips_search_results() {
        let matrix = grid_matrix();
        let index = HnswIndex::build(&matrix, HnswParams { m: 8, ef_construction: 50 });

        let encoded = serde_json::to_string(&index).expect("serializes");
        let decoded: HnswIndex = serde_json::from_str(&encoded).expect("deserializes");

        assert_eq!(
            index.search(&matrix, &[4.0, 0.3], 4, 50),
            decoded.search(&matrix, &[4.0, 0.3], 4, 50)
        );
    }
}
