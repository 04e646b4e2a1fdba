//! Query planner: choose a routing strategy per query shape.
//!
//! Routing is by signal count: zero signals list ids, one signal calls its
//! component directly and bypasses fusion, multiple signals produce an
//! ordered multi-step plan. Steps run in ascending estimated selectivity —
//! a selective field filter first, then graph when its start set is small,
//! then vector, with non-selective field filters deferred until after the
//! vector step. The vector step over-fetches 3× the limit to give fusion
//! room.
//!
//! Plans are cached by a structural hash of the query **shape** (signals
//! present, filter fields and operators, kinds, fusion mode — never
//! values) in a bounded LRU.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use super::FindQuery;
use crate::index::{Filter, MetadataIndex, Op};

/// How many candidates the vector step fetches per requested result.
pub const VECTOR_OVER_FETCH: usize = 3;

/// Start sets up to this size count as "small" for step ordering.
const SMALL_START_SET: usize = 16;

/// The chosen routing strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteKind {
    /// `limit == 0`: return nothing, run nothing.
    Empty,
    /// No signals: page through entity ids.
    ListAll,
    /// Single signal routed directly, native scoring, no fusion.
    Direct(PlanStep),
    /// Multiple signals, fused.
    Fused,
}

/// One signal step of a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlanStep {
    /// Evaluate the metadata filter.
    Field,
    /// Run the graph traversal.
    Graph,
    /// Run the vector search.
    Vector,
}

/// An executable plan.
#[derive(Clone, Debug)]
pub struct Plan {
    /// The routing strategy.
    pub route: RouteKind,
    /// Signal steps in execution order (empty unless `Fused`).
    pub steps: Vec<PlanStep>,
    /// Number of candidates the vector step fetches.
    pub vector_fetch: usize,
    /// Pre-intersect candidates with the kind index.
    pub restrict_kinds: bool,
}

/// Planner with a bounded shape-keyed plan cache.
pub struct Planner {
    cache: Mutex<LruCache<u64, Plan>>,
}

impl Planner {
    /// Creates a planner with the given cache capacity.
    pub fn new(cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).expect("max(1) is non-zero");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the plan for a query, consulting the cache by shape.
    pub fn plan(&self, query: &FindQuery, index: &MetadataIndex) -> Plan {
        if query.limit == 0 {
            return Plan {
                route: RouteKind::Empty,
                steps: Vec::new(),
                vector_fetch: 0,
                restrict_kinds: false,
            };
        }

        let shape = shape_hash(query);
        if let Some(plan) = self.cache.lock().get(&shape) {
            return plan.clone();
        }

        let plan = self.build(query, index);
        self.cache.lock().put(shape, plan.clone());
        plan
    }

    /// Number of cached plans.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    fn build(&self, query: &FindQuery, index: &MetadataIndex) -> Plan {
        let restrict_kinds = query.kinds.as_ref().is_some_and(|k| !k.is_empty());
        let vector_fetch = VECTOR_OVER_FETCH * query.limit + query.offset;

        let route = match query.signal_count() {
            0 => RouteKind::ListAll,
            1 => {
                if query.similar.is_some() {
                    RouteKind::Direct(PlanStep::Vector)
                } else if query.where_.is_some() {
                    RouteKind::Direct(PlanStep::Field)
                } else {
                    RouteKind::Direct(PlanStep::Graph)
                }
            }
            _ => RouteKind::Fused,
        };

        let steps = if route == RouteKind::Fused {
            self.order_steps(query, index)
        } else {
            Vec::new()
        };

        Plan {
            route,
            steps,
            vector_fetch,
            restrict_kinds,
        }
    }

    /// Orders fused steps by ascending estimated selectivity.
    fn order_steps(&self, query: &FindQuery, index: &MetadataIndex) -> Vec<PlanStep> {
        let mut early = Vec::new();
        let mut late = Vec::new();

        if let Some(filter) = &query.where_ {
            if index.is_selective(filter) {
                early.push((index.estimate(filter), PlanStep::Field));
            } else {
                // A pure open range scans wide; run it after the vector
                // step has bounded the candidates.
                late.push(PlanStep::Field);
            }
        }

        if let Some(connected) = &query.connected {
            if connected.from.len() <= SMALL_START_SET {
                // Reachable-set size is bounded by branching; score it as
                // start count for ordering purposes.
                early.push((connected.from.len(), PlanStep::Graph));
            } else {
                late.push(PlanStep::Graph);
            }
        }

        early.sort_by_key(|(estimate, _)| *estimate);

        let mut steps: Vec<PlanStep> = early.into_iter().map(|(_, step)| step).collect();
        if query.similar.is_some() {
            steps.push(PlanStep::Vector);
        }
        steps.extend(late);
        steps
    }
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("cached_plans", &self.cached())
            .finish()
    }
}

/// Hashes the query shape: which signals are present and how they are
/// structured, never the values they carry.
pub fn shape_hash(query: &FindQuery) -> u64 {
    let mut hasher = DefaultHasher::new();

    query.similar.is_some().hash(&mut hasher);
    if let Some(filter) = &query.where_ {
        hash_filter_shape(filter, &mut hasher);
    } else {
        0u8.hash(&mut hasher);
    }
    if let Some(connected) = &query.connected {
        1u8.hash(&mut hasher);
        connected.from.len().hash(&mut hasher);
        connected.depth.hash(&mut hasher);
        connected.verbs.is_some().hash(&mut hasher);
    } else {
        0u8.hash(&mut hasher);
    }
    if let Some(kinds) = &query.kinds {
        1u8.hash(&mut hasher);
        kinds.len().hash(&mut hasher);
    } else {
        0u8.hash(&mut hasher);
    }
    query.limit.hash(&mut hasher);
    query.offset.hash(&mut hasher);
    query.fusion_mode.hash(&mut hasher);

    hasher.finish()
}

fn hash_filter_shape(filter: &Filter, hasher: &mut DefaultHasher) {
    match filter {
        Filter::Leaf(leaf) => {
            2u8.hash(hasher);
            leaf.field.hash(hasher);
            op_tag(&leaf.op).hash(hasher);
        }
        Filter::And(children) => {
            3u8.hash(hasher);
            children.len().hash(hasher);
            for child in children {
                hash_filter_shape(child, hasher);
            }
        }
        Filter::Or(children) => {
            4u8.hash(hasher);
            children.len().hash(hasher);
            for child in children {
                hash_filter_shape(child, hasher);
            }
        }
        Filter::Not(inner) => {
            5u8.hash(hasher);
            hash_filter_shape(inner, hasher);
        }
    }
}

fn op_tag(op: &Op) -> u8 {
    match op {
        Op::Equals(_) => 0,
        Op::NotEquals(_) => 1,
        Op::OneOf(_) => 2,
        Op::Between(_, _) => 3,
        Op::GreaterThan(_) => 4,
        Op::GreaterEqual(_) => 5,
        Op::LessThan(_) => 6,
        Op::LessEqual(_) => 7,
        Op::Contains(_) => 8,
        Op::Exists => 9,
    }
}
