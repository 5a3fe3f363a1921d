//! Hierarchical Navigable Small World (HNSW) index over chunk embeddings.
//!
//! Vectors are L2-normalized on insert so cosine distance reduces to
//! `1 - dot`. Removed nodes stay in the graph for navigation but never
//! appear in results, until they outnumber the live ones and the graph is
//! rebuilt from the live vectors. Level assignment uses a seeded RNG, so the
//! same insertion order always produces the same graph.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ulid::Ulid;

use ragfuse_core::{IndexConfig, RagError, Result};

/// Build-time parameters of the graph.
#[derive(Debug, Clone)]
pub struct HnswParams {
    /// Links per node above layer 0.
    pub m: usize,
    /// Links per node at layer 0 (2 * m).
    pub m_max0: usize,
    /// Candidate list size during construction.
    pub ef_construction: usize,
    /// Upper bound on the number of layers.
    pub max_layers: usize,
    /// Seed for level assignment.
    pub seed: u64,
}

impl From<&IndexConfig> for HnswParams {
    fn from(config: &IndexConfig) -> Self {
        Self {
            m: config.m,
            m_max0: config.m * 2,
            ef_construction: config.ef_construction,
            max_layers: 16,
            seed: config.seed,
        }
    }
}

impl Default for HnswParams {
    fn default() -> Self {
        Self::from(&IndexConfig::default())
    }
}

/// Tombstones tolerated before a removal may trigger a rebuild.
const COMPACT_MIN_TOMBSTONES: usize = 64;

/// (distance, internal id) ordered by distance.
type Scored = (OrderedFloat<f32>, u32);

/// In-memory HNSW graph keyed by chunk id.
#[derive(Debug)]
pub struct HnswIndex {
    params: HnswParams,
    dimension: usize,
    // Normalized vectors, `dimension` floats per node.
    vectors: Vec<f32>,
    ids: Vec<Ulid>,
    lookup: HashMap<Ulid, u32>,
    // [node][layer][neighbor]
    neighbors: Vec<Vec<Vec<u32>>>,
    deleted: Vec<bool>,
    entry_point: Option<u32>,
    max_layer: usize,
    rng: StdRng,
}

impl HnswIndex {
    pub fn new(dimension: usize, params: HnswParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            params,
            dimension,
            vectors: Vec::new(),
            ids: Vec::new(),
            lookup: HashMap::new(),
            neighbors: Vec::new(),
            deleted: Vec::new(),
            entry_point: None,
            max_layer: 0,
            rng,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of live (not removed) vectors.
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    /// Removed nodes still held by the graph.
    pub fn tombstones(&self) -> usize {
        self.ids.len() - self.lookup.len()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.lookup.contains_key(id)
    }

    /// Ids of all live vectors, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = &Ulid> {
        self.lookup.keys()
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn vector(&self, node: u32) -> &[f32] {
        let start = node as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    fn distance(&self, query: &[f32], node: u32) -> f32 {
        let dot: f32 = query
            .iter()
            .zip(self.vector(node))
            .map(|(a, b)| a * b)
            .sum();
        1.0 - dot
    }

    fn random_level(&mut self) -> usize {
        let ml = 1.0 / (self.params.m as f64).ln();
        let r: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        let level = (-r.ln() * ml).floor() as usize;
        level.min(self.params.max_layers - 1)
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m_max0
        } else {
            self.params.m
        }
    }

    /// Insert a vector under `id`. Re-inserting an id replaces its vector.
    pub fn insert(&mut self, id: Ulid, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector)?;
        self.remove(&id);
        self.insert_normalized(id, normalize(vector));
        Ok(())
    }

    fn insert_normalized(&mut self, id: Ulid, normalized: Vec<f32>) {
        let node = self.ids.len() as u32;
        let level = self.random_level();

        let entry_point = match self.entry_point {
            Some(ep) => ep,
            None => {
                self.push_node(id, &normalized, vec![Vec::new(); level + 1]);
                self.entry_point = Some(node);
                self.max_layer = level;
                return;
            }
        };

        // Greedy descent through the layers above the new node's level.
        let mut current = entry_point;
        for layer in (level + 1..=self.max_layer).rev() {
            if let Some(&(_, nearest)) = self
                .search_layer(&normalized, &[current], 1, layer, &|_| true)
                .first()
            {
                current = nearest;
            }
        }

        let top = level.min(self.max_layer);
        let mut links: Vec<Vec<u32>> = vec![Vec::new(); level + 1];
        let mut layer_eps = vec![current];
        for layer in (0..=top).rev() {
            let candidates = self.search_layer(
                &normalized,
                &layer_eps,
                self.params.ef_construction,
                layer,
                &|_| true,
            );
            let selected = self.select_neighbors(&candidates, self.max_links(layer));
            links[layer] = selected.iter().map(|&(_, n)| n).collect();

            layer_eps = candidates.iter().map(|&(_, n)| n).collect();
            if layer_eps.is_empty() {
                layer_eps.push(entry_point);
            }
        }

        self.push_node(id, &normalized, links);

        // Bidirectional links, pruning neighbors that went over capacity.
        for layer in 0..=top {
            let m_max = self.max_links(layer);
            let mine = self.neighbors[node as usize][layer].clone();
            for neighbor in mine {
                let n = neighbor as usize;
                while self.neighbors[n].len() <= layer {
                    self.neighbors[n].push(Vec::new());
                }
                self.neighbors[n][layer].push(node);

                if self.neighbors[n][layer].len() > m_max {
                    let base = self.vector(neighbor).to_vec();
                    let candidates: Vec<Scored> = self.neighbors[n][layer]
                        .iter()
                        .map(|&c| (OrderedFloat(self.distance(&base, c)), c))
                        .collect();
                    let pruned = self.select_neighbors(&candidates, m_max);
                    self.neighbors[n][layer] = pruned.iter().map(|&(_, c)| c).collect();
                }
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(node);
        }
    }

    fn push_node(&mut self, id: Ulid, normalized: &[f32], links: Vec<Vec<u32>>) {
        let node = self.ids.len() as u32;
        self.vectors.extend_from_slice(normalized);
        self.ids.push(id);
        self.lookup.insert(id, node);
        self.neighbors.push(links);
        self.deleted.push(false);
    }

    /// Remove `id` from results. Returns whether it was present.
    pub fn remove(&mut self, id: &Ulid) -> bool {
        let Some(node) = self.lookup.remove(id) else {
            return false;
        };
        self.deleted[node as usize] = true;

        let tombstones = self.tombstones();
        if tombstones >= COMPACT_MIN_TOMBSTONES && tombstones > self.lookup.len() {
            self.compact();
        }
        true
    }

    /// Rebuild the graph from the live vectors in their original insertion
    /// order, dropping every tombstone.
    pub fn compact(&mut self) {
        let live: Vec<(Ulid, Vec<f32>)> = (0..self.ids.len() as u32)
            .filter(|&node| !self.deleted[node as usize])
            .map(|node| (self.ids[node as usize], self.vector(node).to_vec()))
            .collect();

        *self = Self::new(self.dimension, self.params.clone());
        for (id, vector) in live {
            self.insert_normalized(id, vector);
        }
    }

    /// Approximate k-nearest-neighbor search.
    ///
    /// Returns up to `k` `(chunk id, cosine similarity)` pairs ordered by
    /// similarity descending, ties by ascending id. `accept` restricts which
    /// nodes may appear in the results; rejected nodes are still traversed.
    pub fn search<F>(&self, query: &[f32], k: usize, ef_search: usize, accept: F) -> Result<Vec<(Ulid, f32)>>
    where
        F: Fn(&Ulid) -> bool,
    {
        self.check_dimension(query)?;

        let entry_point = match self.entry_point {
            Some(ep) if k > 0 && !self.is_empty() => ep,
            _ => return Ok(Vec::new()),
        };

        let query = normalize(query);

        let mut current = entry_point;
        for layer in (1..=self.max_layer).rev() {
            if let Some(&(_, nearest)) = self
                .search_layer(&query, &[current], 1, layer, &|_| true)
                .first()
            {
                current = nearest;
            }
        }

        // Widen ef when a selective filter leaves too few results.
        // Neither k nor ef can usefully exceed the node count
        let nodes = self.ids.len();
        let k = k.min(self.len());
        let accept_node = |node: u32| accept(&self.ids[node as usize]);
        let base_ef = ef_search.max(k).min(nodes);
        let max_ef = base_ef.saturating_mul(4).min(nodes).max(base_ef);
        let mut ef = base_ef;
        let mut results = loop {
            let found = self.search_layer(&query, &[current], ef, 0, &accept_node);
            if found.len() >= k || ef >= max_ef {
                break found;
            }
            ef = ef.saturating_mul(2).min(max_ef);
        };

        results.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| self.ids[a.1 as usize].cmp(&self.ids[b.1 as usize]))
        });
        results.truncate(k);

        Ok(results
            .into_iter()
            .map(|(d, node)| (self.ids[node as usize], 1.0 - d.0))
            .collect())
    }

    /// Search one layer, returning up to `ef` accepted live nodes sorted by distance.
    fn search_layer<F>(&self, query: &[f32], entry_points: &[u32], ef: usize, layer: usize, accept: &F) -> Vec<Scored>
    where
        F: Fn(u32) -> bool,
    {
        let ef = ef.min(self.ids.len()).max(1);
        let mut visited: HashSet<u32> = HashSet::with_capacity(ef.saturating_mul(4).min(self.ids.len()));
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if visited.insert(ep) {
                let dist = OrderedFloat(self.distance(query, ep));
                candidates.push(Reverse((dist, ep)));
                if !self.deleted[ep as usize] && accept(ep) {
                    results.push((dist, ep));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        while let Some(Reverse((c_dist, node))) = candidates.pop() {
            if results.len() >= ef {
                if let Some(&(worst, _)) = results.peek() {
                    if c_dist > worst {
                        break;
                    }
                }
            }

            let Some(links) = self.neighbors[node as usize].get(layer) else {
                continue;
            };

            for &neighbor in links {
                if !visited.insert(neighbor) {
                    continue;
                }

                let dist = OrderedFloat(self.distance(query, neighbor));
                let worst = results.peek().map(|&(d, _)| d);
                if results.len() < ef || worst.map_or(true, |w| dist < w) {
                    candidates.push(Reverse((dist, neighbor)));
                    if !self.deleted[neighbor as usize] && accept(neighbor) {
                        results.push((dist, neighbor));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    /// Heuristic neighbor selection: keep a candidate only if it is closer to
    /// the base than to every neighbor already kept, then top up with the
    /// closest leftovers.
    fn select_neighbors(&self, candidates: &[Scored], m: usize) -> Vec<Scored> {
        let mut sorted = candidates.to_vec();
        sorted.sort();

        let mut selected: Vec<Scored> = Vec::with_capacity(m);
        for &(dist_to_base, c) in &sorted {
            if selected.len() >= m {
                break;
            }
            let diverse = selected
                .iter()
                .all(|&(_, s)| dist_to_base.0 <= self.distance(self.vector(c), s));
            if diverse {
                selected.push((dist_to_base, c));
            }
        }

        if selected.len() < m {
            let chosen: HashSet<u32> = selected.iter().map(|&(_, n)| n).collect();
            for &(dist, c) in &sorted {
                if selected.len() >= m {
                    break;
                }
                if !chosen.contains(&c) {
                    selected.push((dist, c));
                }
            }
        }

        selected
    }
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}
