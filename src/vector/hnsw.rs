//! Hierarchical Navigable Small World index.
//!
//! A multi-layer proximity graph. Layer 0 holds every vector; each upper
//! layer holds a geometric sample (a node reaches layer ℓ with probability
//! `(1/M)^ℓ`). Search greedy-descends from the entry point through the
//! upper layers, then runs a bounded best-first expansion at layer 0.
//! Insertion collects `ef_construction` candidates per layer and links up
//! to `M` neighbors (`2M` at layer 0) chosen by the diversity-pruning
//! heuristic rather than raw closeness.
//!
//! # Concurrency
//!
//! The outer `RwLock` guards the node table and entry point; searches hold
//! the read side for their duration, insertions take the write side only
//! for the brief node-append and entry swap. Neighbor lists live behind
//! per-node `RwLock`s taken in internal-id order by writers, so a reader
//! observes either the pre- or post-insertion list of a node, never a torn
//! one.
//!
//! # Deletes
//!
//! Soft-delete sets a tombstone bit; the node keeps routing searches but
//! is skipped in results. Deleting the entry point elects a successor
//! before the tombstone lands, so concurrent searches never observe a
//! missing entry point. Tombstoned nodes accumulate until
//! [`compact`](crate::Database::compact) rebuilds the graph — delete-heavy
//! workloads should compact periodically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

use super::VectorIndex;
use crate::config::{HnswConfig, Metric};
use crate::distance::distance_unchecked;
use crate::error::{NousError, Result, ValidationError};
use crate::task::CancelToken;
use crate::types::{EntityId, Vector};

/// Hard cap on layer assignment; keeps descent bounded for any corpus.
pub(crate) const MAX_LEVEL: usize = 16;

/// f32 distance with a total order, for use in heaps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Dist(pub f32);

impl Eq for Dist {}

impl PartialOrd for Dist {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dist {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// One graph node. Vector and level are immutable after creation;
/// neighbor lists and the tombstone bit are the mutable parts.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) entity: EntityId,
    pub(crate) vector: Vector,
    pub(crate) level: usize,
    /// One neighbor list per layer, index 0 = layer 0.
    pub(crate) neighbors: Vec<RwLock<Vec<u32>>>,
    pub(crate) deleted: AtomicBool,
}

impl Node {
    fn new(entity: EntityId, vector: Vector, level: usize) -> Self {
        let neighbors = (0..=level).map(|_| RwLock::new(Vec::new())).collect();
        Self {
            entity,
            vector,
            level,
            neighbors,
            deleted: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub(crate) struct GraphState {
    pub(crate) nodes: Vec<Arc<Node>>,
    /// Entity → current internal node. An updated entity points at its
    /// newest node; superseded nodes stay tombstoned in the graph.
    pub(crate) by_entity: HashMap<EntityId, u32>,
    pub(crate) entry: Option<u32>,
}

/// The HNSW index.
pub struct HnswIndex {
    dimension: usize,
    metric: Metric,
    config: HnswConfig,
    /// `1 / ln(M)`: the multiplier for geometric layer sampling.
    level_mult: f64,
    pub(crate) state: RwLock<GraphState>,
}

impl HnswIndex {
    /// Creates a new empty index.
    pub fn new(dimension: usize, metric: Metric, config: HnswConfig) -> Self {
        let level_mult = 1.0 / (config.m.max(2) as f64).ln();
        Self {
            dimension,
            metric,
            config,
            level_mult,
            state: RwLock::new(GraphState {
                nodes: Vec::new(),
                by_entity: HashMap::new(),
                entry: None,
            }),
        }
    }

    /// Rebuilds an index from scratch over a set of vectors.
    ///
    /// Used on open when no snapshot exists or the snapshot failed
    /// validation, and by `compact()` to shed tombstoned nodes.
    pub fn rebuild(
        dimension: usize,
        metric: Metric,
        config: HnswConfig,
        vectors: Vec<super::IdVector>,
    ) -> Result<Self> {
        let index = Self::new(dimension, metric, config);
        for (id, vector) in vectors {
            index.insert(id, &vector)?;
        }
        Ok(index)
    }

    /// Configured per-layer neighbor target.
    pub fn m(&self) -> usize {
        self.config.m
    }

    /// Index dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Total node count including tombstones (the physical graph size).
    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Number of tombstoned nodes awaiting compaction.
    pub fn tombstone_count(&self) -> usize {
        let state = self.state.read();
        state.nodes.iter().filter(|n| n.is_deleted()).count()
    }

    fn cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m * 2
        } else {
            self.config.m
        }
    }

    fn sample_level(&self) -> usize {
        let uniform: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
        ((-uniform.ln() * self.level_mult) as usize).min(MAX_LEVEL)
    }

    fn dist(&self, a: &[f32], b: &[f32]) -> f32 {
        distance_unchecked(a, b, self.metric)
    }

    /// Greedy move at one layer: hop to the closest neighbor until no
    /// neighbor improves on the current node.
    fn greedy_step(&self, state: &GraphState, query: &[f32], start: u32, layer: usize) -> u32 {
        let mut current = start;
        let mut current_dist = self.dist(query, &state.nodes[current as usize].vector);
        loop {
            let mut improved = false;
            let links = {
                let node = &state.nodes[current as usize];
                if layer > node.level {
                    return current;
                }
                node.neighbors[layer].read().clone()
            };
            for next in links {
                let d = self.dist(query, &state.nodes[next as usize].vector);
                if d < current_dist {
                    current = next;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Bounded best-first expansion at one layer.
    ///
    /// Returns up to `ef` candidates as `(dist, node)` sorted ascending.
    /// Tombstoned nodes participate (they still route); result filtering
    /// happens in [`search`](Self::search).
    fn search_layer(
        &self,
        state: &GraphState,
        query: &[f32],
        entry: u32,
        ef: usize,
        layer: usize,
    ) -> Vec<(Dist, u32)> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        let mut visited: HashSet<u32> = HashSet::new();
        visited.insert(entry);

        let entry_dist = Dist(self.dist(query, &state.nodes[entry as usize].vector));
        // Min-heap of nodes to expand.
        let mut candidates: BinaryHeap<Reverse<(Dist, u32)>> = BinaryHeap::new();
        candidates.push(Reverse((entry_dist, entry)));
        // Max-heap of the best `ef` found so far.
        let mut found: BinaryHeap<(Dist, u32)> = BinaryHeap::new();
        found.push((entry_dist, entry));

        while let Some(Reverse((dist, node))) = candidates.pop() {
            let worst = found.peek().map(|(d, _)| *d).unwrap_or(Dist(f32::INFINITY));
            if dist > worst && found.len() >= ef {
                break;
            }
            let links = {
                let node = &state.nodes[node as usize];
                if layer > node.level {
                    continue;
                }
                node.neighbors[layer].read().clone()
            };
            for next in links {
                if !visited.insert(next) {
                    continue;
                }
                let d = Dist(self.dist(query, &state.nodes[next as usize].vector));
                let worst = found.peek().map(|(d, _)| *d).unwrap_or(Dist(f32::INFINITY));
                if found.len() < ef || d < worst {
                    candidates.push(Reverse((d, next)));
                    found.push((d, next));
                    if found.len() > ef {
                        found.pop();
                    }
                }
            }
        }

        let mut result = found.into_vec();
        result.sort();
        result
    }

    /// The diversity-pruning neighbor selection rule.
    ///
    /// Walks candidates closest-first and keeps one only when it is closer
    /// to the query than to every already-kept neighbor. This favors
    /// spread directions over a tight cluster of mutually-close nodes.
    fn select_neighbors(
        &self,
        state: &GraphState,
        candidates: &[(Dist, u32)],
        m: usize,
    ) -> Vec<u32> {
        let mut selected: Vec<(Dist, u32)> = Vec::with_capacity(m);
        for &(dist, candidate) in candidates {
            if selected.len() >= m {
                break;
            }
            let vector = &state.nodes[candidate as usize].vector;
            let diverse = selected.iter().all(|&(_, kept)| {
                let to_kept = self.dist(vector, &state.nodes[kept as usize].vector);
                dist.0 < to_kept
            });
            if diverse {
                selected.push((dist, candidate));
            }
        }
        // Backfill with skipped candidates when diversity left slots open.
        if selected.len() < m {
            for &(dist, candidate) in candidates {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|&(_, kept)| kept == candidate) {
                    selected.push((dist, candidate));
                }
            }
        }
        selected.into_iter().map(|(_, n)| n).collect()
    }

    /// Re-prunes a node's neighbor list after it exceeded capacity.
    ///
    /// Caller holds the node's layer lock.
    fn reprune(&self, state: &GraphState, node: u32, layer: usize, links: &mut Vec<u32>) {
        let cap = self.cap(layer);
        if links.len() <= cap {
            return;
        }
        let vector = &state.nodes[node as usize].vector;
        let mut candidates: Vec<(Dist, u32)> = links
            .iter()
            .map(|&n| (Dist(self.dist(vector, &state.nodes[n as usize].vector)), n))
            .collect();
        candidates.sort();
        *links = self.select_neighbors(state, &candidates, cap);
    }

    /// Links a freshly appended node into every layer up to its level.
    fn link(&self, state: &GraphState, new_internal: u32) {
        let new_node = &state.nodes[new_internal as usize];
        let Some(entry) = state.entry else {
            return;
        };
        if entry == new_internal {
            return;
        }

        let entry_level = state.nodes[entry as usize].level;
        let mut current = entry;

        // Descend through layers above the new node's level.
        for layer in ((new_node.level + 1)..=entry_level).rev() {
            current = self.greedy_step(state, &new_node.vector, current, layer);
        }

        // Collect, select, and wire at each shared layer.
        for layer in (0..=new_node.level.min(entry_level)).rev() {
            let candidates = self.search_layer(
                state,
                &new_node.vector,
                current,
                self.config.ef_construction,
                layer,
            );
            current = candidates.first().map(|&(_, n)| n).unwrap_or(current);

            let selected = self.select_neighbors(state, &candidates, self.cap(layer));
            for neighbor in selected {
                if neighbor == new_internal {
                    continue;
                }
                // Lock the two endpoint lists in internal-id order.
                let (first, second) = if new_internal < neighbor {
                    (new_internal, neighbor)
                } else {
                    (neighbor, new_internal)
                };
                let first_guard = state.nodes[first as usize].neighbors[layer].write();
                let second_guard = state.nodes[second as usize].neighbors[layer].write();
                let (mut new_links, mut peer_links) = if first == new_internal {
                    (first_guard, second_guard)
                } else {
                    (second_guard, first_guard)
                };

                if !new_links.contains(&neighbor) {
                    new_links.push(neighbor);
                }
                if !peer_links.contains(&new_internal) {
                    peer_links.push(new_internal);
                    self.reprune(state, neighbor, layer, &mut peer_links);
                }
            }
        }
    }
}

impl VectorIndex for HnswIndex {
    fn insert(&self, id: EntityId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(ValidationError::dimension_mismatch(self.dimension, vector.len()).into());
        }

        let level = self.sample_level();
        let new_internal;
        {
            let mut state = self.state.write();
            if let Some(&existing) = state.by_entity.get(&id) {
                let node = &state.nodes[existing as usize];
                if !node.is_deleted() {
                    // Idempotent re-insert of a live id.
                    return Ok(());
                }
            }

            if state.nodes.len() > u32::MAX as usize - 1 {
                return Err(NousError::vector("index is full"));
            }
            new_internal = state.nodes.len() as u32;
            state
                .nodes
                .push(Arc::new(Node::new(id, vector.to_vec(), level)));
            state.by_entity.insert(id, new_internal);

            // First node (or first after total deletion) becomes the entry
            // point and is searchable in the same call.
            let entry_gone = match state.entry {
                None => true,
                Some(e) => state.nodes[e as usize].is_deleted(),
            };
            if entry_gone {
                state.entry = Some(new_internal);
                return Ok(());
            }
        }

        // Wire under the shared lock; searches proceed concurrently.
        let state = self.state.read();
        self.link(&state, new_internal);

        // A node taller than the entry point becomes the new entry.
        let needs_promotion = state
            .entry
            .is_some_and(|e| level > state.nodes[e as usize].level);
        drop(state);
        if needs_promotion {
            let mut state = self.state.write();
            let promote = state
                .entry
                .is_some_and(|e| level > state.nodes[e as usize].level);
            if promote {
                state.entry = Some(new_internal);
            }
        }
        Ok(())
    }

    fn remove(&self, id: EntityId) -> Result<bool> {
        let mut state = self.state.write();
        let Some(&internal) = state.by_entity.get(&id) else {
            return Ok(false);
        };
        if state.nodes[internal as usize].is_deleted() {
            return Ok(false);
        }

        // Elect a successor before the entry's tombstone becomes visible.
        if state.entry == Some(internal) {
            let successor = state
                .nodes
                .iter()
                .enumerate()
                .filter(|(i, n)| *i != internal as usize && !n.is_deleted())
                .max_by_key(|(_, n)| n.level)
                .map(|(i, _)| i as u32);
            state.entry = successor.or(Some(internal));
            if successor.is_some() {
                debug!(entity = %id, "Elected successor entry point before delete");
            }
        }

        state.nodes[internal as usize]
            .deleted
            .store(true, Ordering::Release);
        Ok(true)
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        filter: Option<&(dyn Fn(EntityId) -> bool + Sync)>,
        token: &CancelToken,
    ) -> Result<Vec<(EntityId, f32)>> {
        if query.len() != self.dimension {
            return Err(ValidationError::dimension_mismatch(self.dimension, query.len()).into());
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let ef = ef.unwrap_or(self.config.ef_search).max(k);

        let state = self.state.read();
        let Some(entry) = state.entry else {
            return Ok(Vec::new());
        };
        if state.nodes[entry as usize].is_deleted() && state.nodes.len() == 1 {
            return Ok(Vec::new());
        }

        // Greedy descent through the upper layers.
        let mut current = entry;
        let entry_level = state.nodes[entry as usize].level;
        for layer in (1..=entry_level).rev() {
            token.check()?;
            current = self.greedy_step(&state, query, current, layer);
        }
        token.check()?;

        // Bounded best-first at layer 0, then filter tombstones and the
        // caller's predicate out of the candidate heap.
        let candidates = self.search_layer(&state, query, current, ef, 0);
        let mut results = Vec::with_capacity(k);
        for (dist, internal) in candidates {
            if results.len() == k {
                break;
            }
            let node = &state.nodes[internal as usize];
            if node.is_deleted() {
                continue;
            }
            // A superseded node (entity remapped by an update) must not
            // surface under its old vector.
            if state.by_entity.get(&node.entity) != Some(&internal) {
                continue;
            }
            if let Some(accept) = filter {
                if !accept(node.entity) {
                    continue;
                }
            }
            results.push((node.entity, dist.0));
        }
        Ok(results)
    }

    fn contains(&self, id: EntityId) -> bool {
        let state = self.state.read();
        state
            .by_entity
            .get(&id)
            .is_some_and(|&i| !state.nodes[i as usize].is_deleted())
    }

    fn len(&self) -> usize {
        let state = self.state.read();
        state
            .by_entity
            .values()
            .filter(|&&i| !state.nodes[i as usize].is_deleted())
            .count()
    }

    fn snapshot(&self, sequence: u64) -> Vec<u8> {
        let state = self.state.read();
        super::snapshot::encode(self, &state, sequence)
    }
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dimension", &self.dimension)
            .field("metric", &self.metric)
            .field("nodes", &self.node_count())
            .finish()
    }
}

// Crate-internal constructors used by snapshot decoding.
impl HnswIndex {
    pub(crate) fn from_parts(
        dimension: usize,
        metric: Metric,
        config: HnswConfig,
        state: GraphState,
    ) -> Self {
        let level_mult = 1.0 / (config.m.max(2) as f64).ln();
        Self {
            dimension,
            metric,
            config,
            level_mult,
            state: RwLock::new(state),
        }
    }
}
