//! In-memory HNSW kernel for approximate nearest-neighbor search.
//!
//! A layered small-world graph: every vector lands on layer 0, each higher
//! layer keeps an exponentially thinning subset. Search descends greedily
//! from the top layer's entry point, then runs a beam search on layer 0.
//! Distances are Euclidean; vector columns normalize to unit length on
//! insert by default, which makes this equivalent to cosine ranking.
//!
//! The graph is ephemeral: it lives beside the catalog's index definition
//! (root page 0) and is rebuilt from table data when the index is created,
//! never persisted.

use crate::db::schema::HnswParams;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BinaryHeap;

struct Node {
    rowid: u64,
    vec: Vec<f32>,
    /// Neighbor lists, one per layer the node participates in.
    neighbors: Vec<Vec<usize>>,
}

pub struct HnswIndex {
    params: HnswParams,
    nodes: Vec<Node>,
    entry: Option<usize>,
    max_layer: usize,
    rng: StdRng,
    /// Level multiplier `1 / ln(M)`.
    ml: f64,
}

fn l2(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (*x - *y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Max-heap entry ordered by distance; used to keep the k closest.
#[derive(PartialEq)]
struct Candidate {
    dist: f64,
    node: usize,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist.partial_cmp(&other.dist).unwrap_or(std::cmp::Ordering::Equal)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl HnswIndex {
    pub fn new(params: HnswParams) -> Self {
        let ml = 1.0 / (params.m.max(2) as f64).ln();
        HnswIndex {
            params,
            nodes: Vec::new(),
            entry: None,
            max_layer: 0,
            // Deterministic level draws keep rebuilds reproducible.
            rng: StdRng::seed_from_u64(0x6d69_6361),
            ml,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn draw_level(&mut self) -> usize {
        let u: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        (-u.ln() * self.ml) as usize
    }

    pub fn insert(&mut self, rowid: u64, vec: Vec<f32>) {
        let level = self.draw_level();
        let id = self.nodes.len();
        self.nodes.push(Node {
            rowid,
            vec,
            neighbors: vec![Vec::new(); level + 1],
        });

        let Some(mut cursor) = self.entry else {
            self.entry = Some(id);
            self.max_layer = level;
            return;
        };

        // Greedy descent through layers above the new node's level.
        let query = self.nodes[id].vec.clone();
        for layer in (level + 1..=self.max_layer).rev() {
            cursor = self.greedy_step(&query, cursor, layer);
        }

        // Connect on each shared layer, beam-searching for neighbors.
        for layer in (0..=level.min(self.max_layer)).rev() {
            let found = self.search_layer(&query, cursor, layer, self.params.ef_construction);
            let m = if layer == 0 { self.params.m * 2 } else { self.params.m };
            for &Candidate { node, .. } in found.iter().take(m) {
                self.link(id, node, layer, m);
                self.link(node, id, layer, m);
            }
            if let Some(best) = found.first() {
                cursor = best.node;
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry = Some(id);
        }
    }

    fn link(&mut self, from: usize, to: usize, layer: usize, m: usize) {
        if from == to {
            return;
        }
        let from_vec = self.nodes[from].vec.clone();
        let list = &mut self.nodes[from].neighbors[layer];
        if list.contains(&to) {
            return;
        }
        list.push(to);
        if list.len() > m {
            // Keep the m closest neighbors.
            let mut scored: Vec<(f64, usize)> = self.nodes[from].neighbors[layer]
                .iter()
                .map(|&n| (l2(&from_vec, &self.nodes[n].vec), n))
                .collect();
            scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(m);
            self.nodes[from].neighbors[layer] = scored.into_iter().map(|(_, n)| n).collect();
        }
    }

    fn greedy_step(&self, query: &[f32], mut cursor: usize, layer: usize) -> usize {
        let mut best = l2(query, &self.nodes[cursor].vec);
        loop {
            let mut improved = false;
            if layer < self.nodes[cursor].neighbors.len() {
                for &n in &self.nodes[cursor].neighbors[layer] {
                    let d = l2(query, &self.nodes[n].vec);
                    if d < best {
                        best = d;
                        cursor = n;
                        improved = true;
                    }
                }
            }
            if !improved {
                return cursor;
            }
        }
    }

    /// Beam search on one layer; returns up to `ef` candidates sorted by
    /// ascending distance.
    fn search_layer(&self, query: &[f32], start: usize, layer: usize, ef: usize) -> Vec<Candidate> {
        let mut visited = vec![false; self.nodes.len()];
        visited[start] = true;
        let start_dist = l2(query, &self.nodes[start].vec);

        // `frontier` is a min-heap (via Reverse), `best` a max-heap capped at ef.
        let mut frontier = BinaryHeap::new();
        frontier.push(std::cmp::Reverse(Candidate {
            dist: start_dist,
            node: start,
        }));
        let mut best: BinaryHeap<Candidate> = BinaryHeap::new();
        best.push(Candidate {
            dist: start_dist,
            node: start,
        });

        while let Some(std::cmp::Reverse(Candidate { dist, node })) = frontier.pop() {
            let worst = best.peek().map(|c| c.dist).unwrap_or(f64::INFINITY);
            if dist > worst && best.len() >= ef {
                break;
            }
            if layer < self.nodes[node].neighbors.len() {
                for &n in &self.nodes[node].neighbors[layer] {
                    if visited[n] {
                        continue;
                    }
                    visited[n] = true;
                    let d = l2(query, &self.nodes[n].vec);
                    if best.len() < ef || d < best.peek().map(|c| c.dist).unwrap_or(f64::INFINITY) {
                        frontier.push(std::cmp::Reverse(Candidate { dist: d, node: n }));
                        best.push(Candidate { dist: d, node: n });
                        if best.len() > ef {
                            best.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<Candidate> = best.into_vec();
        out.sort_by(|a, b| a.dist.partial_cmp(&b.dist).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// K nearest neighbors as `(rowid, distance)` in ascending distance.
    pub fn search_knn(&self, query: &[f32], k: usize) -> Vec<(u64, f64)> {
        let Some(mut cursor) = self.entry else {
            return Vec::new();
        };
        for layer in (1..=self.max_layer).rev() {
            cursor = self.greedy_step(query, cursor, layer);
        }
        let ef = self.params.ef_construction.max(k);
        self.search_layer(query, cursor, 0, ef)
            .into_iter()
            .take(k)
            .map(|c| (self.nodes[c.node].rowid, c.dist))
            .collect()
    }
}
