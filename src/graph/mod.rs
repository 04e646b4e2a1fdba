//! Graph adjacency layer: bidirectional edge lookup and BFS traversal.
//!
//! Adjacency is stored as two maps keyed by entity id: one for outgoing
//! edges and one for incoming. Lookup is O(1) amortized; the source of
//! truth for edge records is the registry — this layer holds only the
//! `(edge_id, peer_id, verb, weight)` tuples needed for traversal.
//!
//! Traversal is breadth-first with a visited set. A node discovered at
//! depth `d` from a start with path weight `w` receives graph score
//! `w * decay^d` (decay defaults to 0.8).

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::entity::Edge;
use crate::error::{QueryError, Result};
use crate::task::CancelToken;
use crate::types::{Direction, EdgeId, EntityId, Verb};

/// Default traversal depth when the caller omits one.
pub const DEFAULT_DEPTH: usize = 2;

/// Absolute traversal depth cap; exceeding it returns `DepthLimit`.
pub const MAX_DEPTH: usize = 16;

/// One adjacency entry: an edge as seen from one of its endpoints.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    /// The edge's id.
    pub edge_id: EdgeId,
    /// The entity on the other end.
    pub peer_id: EntityId,
    /// The edge's relationship kind.
    pub verb: Verb,
    /// The edge's weight in [0, 1].
    pub weight: f32,
}

/// A node discovered by traversal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Visit {
    /// The discovered entity.
    pub id: EntityId,
    /// BFS depth at which it was first reached (0 = start node).
    pub depth: usize,
    /// Product of edge weights along the discovery path.
    pub path_weight: f32,
    /// `path_weight * decay^depth`.
    pub score: f32,
}

/// In-memory adjacency over the live edge set.
///
/// A reader-writer lock per direction map keeps neighbor reads shared;
/// edge insertion and removal take the exclusive side briefly.
pub struct AdjacencyGraph {
    out: RwLock<HashMap<EntityId, Vec<Neighbor>>>,
    inc: RwLock<HashMap<EntityId, Vec<Neighbor>>>,
}

impl Default for AdjacencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl AdjacencyGraph {
    /// Creates an empty adjacency graph.
    pub fn new() -> Self {
        Self {
            out: RwLock::new(HashMap::new()),
            inc: RwLock::new(HashMap::new()),
        }
    }

    /// Adds an edge to both endpoint maps.
    pub fn add_edge(&self, edge: &Edge) {
        let out_entry = Neighbor {
            edge_id: edge.id,
            peer_id: edge.target_id,
            verb: edge.verb,
            weight: edge.weight,
        };
        let in_entry = Neighbor {
            edge_id: edge.id,
            peer_id: edge.source_id,
            verb: edge.verb,
            weight: edge.weight,
        };
        {
            let mut out = self.out.write();
            let list = out.entry(edge.source_id).or_default();
            if !list.iter().any(|n| n.edge_id == edge.id) {
                list.push(out_entry);
            }
        }
        {
            let mut inc = self.inc.write();
            let list = inc.entry(edge.target_id).or_default();
            if !list.iter().any(|n| n.edge_id == edge.id) {
                list.push(in_entry);
            }
        }
    }

    /// Removes an edge from both endpoint maps.
    pub fn remove_edge(&self, edge: &Edge) {
        let mut out = self.out.write();
        if let Some(list) = out.get_mut(&edge.source_id) {
            list.retain(|n| n.edge_id != edge.id);
            if list.is_empty() {
                out.remove(&edge.source_id);
            }
        }
        drop(out);

        let mut inc = self.inc.write();
        if let Some(list) = inc.get_mut(&edge.target_id) {
            list.retain(|n| n.edge_id != edge.id);
            if list.is_empty() {
                inc.remove(&edge.target_id);
            }
        }
    }

    /// Drops all adjacency state.
    pub fn clear(&self) {
        self.out.write().clear();
        self.inc.write().clear();
    }

    /// Total number of edges tracked.
    pub fn edge_count(&self) -> usize {
        self.out.read().values().map(Vec::len).sum()
    }

    /// Number of incident edges (out + in) for an entity.
    pub fn incident_count(&self, id: EntityId) -> usize {
        let out = self.out.read().get(&id).map_or(0, Vec::len);
        let inc = self.inc.read().get(&id).map_or(0, Vec::len);
        out + inc
    }

    /// Enumerates an entity's edges in the given direction.
    pub fn neighbors(&self, id: EntityId, direction: Direction) -> Vec<Neighbor> {
        let mut result = Vec::new();
        if matches!(direction, Direction::Out | Direction::Both) {
            if let Some(list) = self.out.read().get(&id) {
                result.extend_from_slice(list);
            }
        }
        if matches!(direction, Direction::In | Direction::Both) {
            if let Some(list) = self.inc.read().get(&id) {
                result.extend_from_slice(list);
            }
        }
        result
    }

    /// Breadth-first traversal from a set of start nodes.
    ///
    /// Returns one [`Visit`] per reachable node, including the start nodes
    /// at depth 0 with path weight 1. `path_weight` is the product of edge
    /// weights along the shortest discovered path; among equal-depth
    /// discoveries of the same node the heavier path wins, ties broken by
    /// lower peer id (BFS order guarantees the shallower depth wins
    /// first). Results are ordered by depth, then descending score, then
    /// id.
    ///
    /// # Errors
    ///
    /// - `DepthLimit` when `max_depth` exceeds [`MAX_DEPTH`]
    /// - `Cancelled` / `Timeout` through the token
    pub fn traverse(
        &self,
        start_ids: &[EntityId],
        direction: Direction,
        max_depth: Option<usize>,
        verb_filter: Option<&[Verb]>,
        decay: f32,
        token: &CancelToken,
    ) -> Result<Vec<Visit>> {
        let max_depth = max_depth.unwrap_or(DEFAULT_DEPTH);
        if max_depth > MAX_DEPTH {
            return Err(QueryError::DepthLimit {
                requested: max_depth,
                max: MAX_DEPTH,
            }
            .into());
        }

        let mut best: HashMap<EntityId, (usize, f32)> = HashMap::new();
        let mut queue: VecDeque<(EntityId, usize, f32)> = VecDeque::new();

        for &id in start_ids {
            if best.insert(id, (0, 1.0)).is_none() {
                queue.push_back((id, 0, 1.0));
            }
        }

        while let Some((id, depth, weight)) = queue.pop_front() {
            token.check()?;
            // A heavier same-depth path may have superseded this tuple
            // after it was queued; the corrected tuple is queued too, so
            // the stale copy must not expand with the lighter weight.
            if best.get(&id) != Some(&(depth, weight)) {
                continue;
            }
            if depth == max_depth {
                continue;
            }
            for neighbor in self.neighbors(id, direction) {
                if let Some(verbs) = verb_filter {
                    if !verbs.contains(&neighbor.verb) {
                        continue;
                    }
                }
                let next_weight = weight * neighbor.weight;
                match best.get(&neighbor.peer_id).copied() {
                    // First discovery: BFS order makes this the shallowest.
                    None => {
                        best.insert(neighbor.peer_id, (depth + 1, next_weight));
                        queue.push_back((neighbor.peer_id, depth + 1, next_weight));
                    }
                    // Same-depth rediscovery: keep the heavier path and
                    // re-queue so downstream products follow it.
                    Some((d, w)) if d == depth + 1 && next_weight > w => {
                        best.insert(neighbor.peer_id, (d, next_weight));
                        queue.push_back((neighbor.peer_id, d, next_weight));
                    }
                    Some(_) => {}
                }
            }
        }

        let mut visits: Vec<Visit> = best
            .into_iter()
            .map(|(id, (depth, path_weight))| Visit {
                id,
                depth,
                path_weight,
                score: path_weight * decay.powi(depth as i32),
            })
            .collect();
        visits.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then(b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.id.cmp(&b.id))
        });
        Ok(visits)
    }
}

impl std::fmt::Debug for AdjacencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdjacencyGraph")
            .field("edges", &self.edge_count())
            .finish()
    }
}
