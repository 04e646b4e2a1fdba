//! Query types: the `find` request shape and its results.
//!
//! A query mixes up to three signals — vector similarity (`similar`),
//! metadata predicates (`where_`), and graph reachability (`connected`) —
//! plus a kind restriction. The planner routes single-signal queries
//! directly and fuses multi-signal ones through reciprocal rank fusion.

pub mod exec;
pub mod fusion;
pub mod plan;

pub use fusion::{Boost, FusionMode};
pub use plan::{Plan, PlanStep, RouteKind};

use std::time::Duration;

use crate::entity::Entity;
use crate::index::Filter;
use crate::types::{Direction, EntityId, EntityKind, Vector, Verb};

/// The vector-similarity signal.
#[derive(Clone, Debug)]
pub struct Similar {
    /// Query text, embedded through the configured embedder.
    pub text: Option<String>,
    /// Pre-computed query vector; takes precedence over `text`.
    pub vector: Option<Vector>,
    /// Per-query override of the HNSW search beam.
    pub ef: Option<usize>,
}

impl Similar {
    /// Similarity to a pre-computed vector.
    pub fn vector(vector: Vector) -> Self {
        Self {
            text: None,
            vector: Some(vector),
            ef: None,
        }
    }

    /// Similarity to a text, embedded at query time.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            vector: None,
            ef: None,
        }
    }
}

/// The graph-reachability signal.
#[derive(Clone, Debug)]
pub struct Connected {
    /// Traversal start entities.
    pub from: Vec<EntityId>,
    /// Edge direction to follow. Default: out.
    pub direction: Direction,
    /// Maximum traversal depth. Default 2, hard cap 16.
    pub depth: Option<usize>,
    /// Restrict traversal to these verbs.
    pub verbs: Option<Vec<Verb>>,
    /// Override the per-hop score decay (default from config, 0.8).
    pub decay: Option<f32>,
}

impl Connected {
    /// Outgoing reachability from one entity with default depth.
    pub fn from(id: EntityId) -> Self {
        Self {
            from: vec![id],
            direction: Direction::Out,
            depth: None,
            verbs: None,
            decay: None,
        }
    }

    /// Sets the traversal depth (builder style).
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// A `find` request.
///
/// # Example
/// ```
/// use nousdb::{FindQuery, Filter, Similar};
///
/// let query = FindQuery {
///     similar: Some(Similar::vector(vec![1.0, 0.0, 0.0, 0.0])),
///     where_: Some(Filter::equals("category", "blog")),
///     limit: 10,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct FindQuery {
    /// Vector-similarity signal.
    pub similar: Option<Similar>,
    /// Metadata predicate signal.
    pub where_: Option<Filter>,
    /// Graph-reachability signal.
    pub connected: Option<Connected>,
    /// Restrict results to these entity kinds.
    pub kinds: Option<Vec<EntityKind>>,
    /// Page size. `0` returns nothing and runs no search.
    pub limit: usize,
    /// Results to skip before the page.
    pub offset: usize,
    /// Post-fusion score boosts.
    pub boost: Option<Boost>,
    /// How multi-signal scores are combined. Default: RRF.
    pub fusion_mode: FusionMode,
    /// Attach full entity records to the returned page.
    pub include_entities: bool,
    /// Attach a human-readable explanation per result.
    pub explain: bool,
    /// Per-query deadline; overrides the configured default time budget.
    pub deadline: Option<Duration>,
}

impl Default for FindQuery {
    fn default() -> Self {
        Self {
            similar: None,
            where_: None,
            connected: None,
            kinds: None,
            limit: 10,
            offset: 0,
            boost: None,
            fusion_mode: FusionMode::Rrf,
            include_entities: true,
            explain: false,
            deadline: None,
        }
    }
}

impl FindQuery {
    /// Number of signals present (vector, field, graph).
    pub fn signal_count(&self) -> usize {
        usize::from(self.similar.is_some())
            + usize::from(self.where_.is_some())
            + usize::from(self.connected.is_some())
    }
}

/// One result row of a `find`.
#[derive(Clone, Debug)]
pub struct Match {
    /// The matched entity's id.
    pub id: EntityId,
    /// Final score after fusion and boosts. Higher is better.
    pub score: f32,
    /// Raw vector distance (lower is closer), when the vector signal ran.
    pub vector_score: Option<f32>,
    /// Field-signal score (1.0 when the predicate matched).
    pub field_score: Option<f32>,
    /// Decayed graph score, when the graph signal reached this entity.
    pub graph_score: Option<f32>,
    /// The fusion score before boosts.
    pub fusion_score: f32,
    /// The full record, when `include_entities` was set.
    pub entity: Option<Entity>,
    /// Per-result explanation, when `explain` was set.
    pub explanation: Option<String>,
}

/// The outcome of a `find`.
#[derive(Clone, Debug)]
pub struct FindResults {
    /// The result page, best first.
    pub matches: Vec<Match>,
    /// True when a deadline expired and only completed signals were fused.
    pub partial: bool,
    /// Commit generation captured at query start. Individual component
    /// lookups may observe later commits; compare this value across calls
    /// to detect concurrent movement.
    pub generation: u64,
}

impl FindResults {
    /// The matched ids, in result order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.matches.iter().map(|m| m.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_query() {
        let query = FindQuery::default();
        assert_eq!(query.limit, 10);
        assert_eq!(query.offset, 0);
        assert_eq!(query.signal_count(), 0);
        assert!(query.include_entities);
        assert!(!query.explain);
    }

    #[test]
    fn test_signal_count() {
        let query = FindQuery {
            similar: Some(Similar::vector(vec![0.0; 4])),
            where_: Some(Filter::exists("x")),
            ..Default::default()
        };
        assert_eq!(query.signal_count(), 2);

        let query = FindQuery {
            connected: Some(Connected::from(EntityId::new()).with_depth(3)),
            ..Default::default()
        };
        assert_eq!(query.signal_count(), 1);
        assert_eq!(query.connected.unwrap().depth, Some(3));
    }
}
