//! Execution engine: drive planner steps and assemble the result page.
//!
//! The engine runs the plan's steps in order, feeding intermediate id sets
//! forward (a completed field step narrows the vector step's filter),
//! collects per-signal ranked lists, fuses them, applies boosts across the
//! full fused candidate set, and hydrates full entity records for the
//! final page only. A boosted query additionally reads candidate records
//! to compute multipliers; those reads feed scoring, not the result rows.
//!
//! Every query carries a cancellation token. When a deadline expires
//! mid-plan the engine returns the best partial result computed so far,
//! marked `partial = true`; if no signal completed it fails with
//! `Timeout`.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use super::fusion::{self, Fused, SignalLists};
use super::plan::{Plan, PlanStep, Planner, RouteKind};
use super::{FindQuery, FindResults, Match};
use crate::config::Config;
use crate::entity::Entity;
use crate::error::{ErrorCode, NousError, Result};
use crate::graph::AdjacencyGraph;
use crate::index::MetadataIndex;
use crate::storage::StorageBackend;
use crate::task::CancelToken;
use crate::types::{EntityId, Timestamp, Vector};
use crate::vector::{HnswIndex, VectorIndex};

/// Borrowed view over the components a query needs.
pub(crate) struct Engine<'a> {
    pub config: &'a Config,
    pub storage: &'a dyn StorageBackend,
    pub index: &'a MetadataIndex,
    pub graph: &'a AdjacencyGraph,
    pub vectors: &'a HnswIndex,
    pub planner: &'a Planner,
    /// Commit generation captured at query start.
    pub generation: u64,
}

impl Engine<'_> {
    /// Runs a find query. `query_vector` is the resolved similarity
    /// vector (text already embedded by the caller).
    pub(crate) fn run(
        &self,
        query: &FindQuery,
        query_vector: Option<&Vector>,
        token: &CancelToken,
    ) -> Result<FindResults> {
        if let Some(filter) = &query.where_ {
            filter.validate()?;
        }

        let plan = self.planner.plan(query, self.index);
        debug!(route = ?plan.route, steps = ?plan.steps, "Planned query");

        let restrict = self.kind_restriction(query, &plan);

        let (mut matches, partial) = match plan.route {
            RouteKind::Empty => (Vec::new(), false),
            RouteKind::ListAll => (self.run_list(query, restrict.as_ref()), false),
            RouteKind::Direct(PlanStep::Vector) => (
                self.run_vector_direct(query, query_vector, restrict.as_ref(), token)?,
                false,
            ),
            RouteKind::Direct(PlanStep::Field) => (
                self.run_field_direct(query, restrict.as_ref(), token)?,
                false,
            ),
            RouteKind::Direct(PlanStep::Graph) => (
                self.run_graph_direct(query, restrict.as_ref(), token)?,
                false,
            ),
            RouteKind::Fused => {
                self.run_fused(query, query_vector, &plan, restrict.as_ref(), token)?
            }
        };

        // Page, hydrate, and annotate.
        let page: Vec<&mut Match> = matches
            .iter_mut()
            .skip(query.offset)
            .take(query.limit)
            .collect();
        if query.include_entities || query.explain {
            let ids: Vec<EntityId> = page.iter().map(|m| m.id).collect();
            let mut entities = self.hydrate(&ids)?;
            for m in page {
                if query.explain {
                    m.explanation = Some(explain_match(m, &plan, self.generation));
                }
                if query.include_entities {
                    m.entity = entities.remove(&m.id);
                }
            }
        }

        let matches: Vec<Match> = matches
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect();

        Ok(FindResults {
            matches,
            partial,
            generation: self.generation,
        })
    }

    fn kind_restriction(&self, query: &FindQuery, plan: &Plan) -> Option<BTreeSet<EntityId>> {
        if !plan.restrict_kinds {
            return None;
        }
        query
            .kinds
            .as_ref()
            .map(|kinds| self.index.ids_for_kinds(kinds))
    }

    fn accepts(restrict: Option<&BTreeSet<EntityId>>, id: EntityId) -> bool {
        restrict.is_none_or(|set| set.contains(&id))
    }

    // =========================================================================
    // Single-signal routes
    // =========================================================================

    fn run_list(&self, query: &FindQuery, restrict: Option<&BTreeSet<EntityId>>) -> Vec<Match> {
        let wanted = query.limit + query.offset;
        self.index
            .live_ids()
            .into_iter()
            .filter(|&id| Self::accepts(restrict, id))
            .take(wanted)
            .map(|id| blank_match(id, 0.0))
            .collect()
    }

    fn run_vector_direct(
        &self,
        query: &FindQuery,
        query_vector: Option<&Vector>,
        restrict: Option<&BTreeSet<EntityId>>,
        token: &CancelToken,
    ) -> Result<Vec<Match>> {
        let hits = self.vector_search(
            query,
            query_vector,
            query.limit + query.offset,
            restrict,
            token,
        )?;
        Ok(hits
            .into_iter()
            .map(|(id, distance)| Match {
                vector_score: Some(distance),
                // Native score oriented so that higher is better.
                ..blank_match(id, -distance)
            })
            .collect())
    }

    fn run_field_direct(
        &self,
        query: &FindQuery,
        restrict: Option<&BTreeSet<EntityId>>,
        token: &CancelToken,
    ) -> Result<Vec<Match>> {
        let filter = query
            .where_
            .as_ref()
            .ok_or_else(|| NousError::internal("field route planned without a filter"))?;
        let ids = self.index.ids_for_filter(filter, token)?;
        Ok(ids
            .into_iter()
            .filter(|&id| Self::accepts(restrict, id))
            .map(|id| Match {
                field_score: Some(1.0),
                ..blank_match(id, 1.0)
            })
            .collect())
    }

    fn run_graph_direct(
        &self,
        query: &FindQuery,
        restrict: Option<&BTreeSet<EntityId>>,
        token: &CancelToken,
    ) -> Result<Vec<Match>> {
        let visits = self.traverse(query, token)?;
        let mut matches: Vec<Match> = visits
            .into_iter()
            .filter(|(id, _)| Self::accepts(restrict, *id) && self.index.is_live(*id))
            .map(|(id, score)| Match {
                graph_score: Some(score),
                ..blank_match(id, score)
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        Ok(matches)
    }

    // =========================================================================
    // Multi-signal route
    // =========================================================================

    fn run_fused(
        &self,
        query: &FindQuery,
        query_vector: Option<&Vector>,
        plan: &Plan,
        restrict: Option<&BTreeSet<EntityId>>,
        token: &CancelToken,
    ) -> Result<(Vec<Match>, bool)> {
        let mut lists = SignalLists::default();
        let mut field_set: Option<BTreeSet<EntityId>> = None;
        let mut graph_set: Option<BTreeSet<EntityId>> = None;
        let mut completed = 0usize;
        let mut partial = false;

        for step in &plan.steps {
            let result: Result<()> = match step {
                PlanStep::Field => {
                    let filter = query
                        .where_
                        .as_ref()
                        .ok_or_else(|| NousError::internal("field step planned without a filter"))?;
                    self.index.ids_for_filter(filter, token).map(|ids| {
                        field_set = Some(ids.iter().copied().collect());
                        lists.field = Some(ids);
                    })
                }
                PlanStep::Graph => self.traverse(query, token).map(|mut visits| {
                    visits.sort_by(|a, b| {
                        b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
                    });
                    graph_set = Some(visits.iter().map(|(id, _)| *id).collect());
                    lists.graph = Some(visits);
                }),
                PlanStep::Vector => {
                    // Feed the field step's ids forward as a traversal
                    // filter so the beam spends itself on candidates that
                    // can survive intersection.
                    let narrowed: Option<BTreeSet<EntityId>> = match (&field_set, restrict) {
                        (Some(f), Some(r)) => Some(f.intersection(r).copied().collect()),
                        (Some(f), None) => Some(f.clone()),
                        (None, Some(r)) => Some(r.clone()),
                        (None, None) => None,
                    };
                    self.vector_search(
                        query,
                        query_vector,
                        plan.vector_fetch,
                        narrowed.as_ref(),
                        token,
                    )
                    .map(|hits| {
                        lists.vector = Some(hits);
                    })
                }
            };

            match result {
                Ok(()) => {
                    completed += 1;
                    // Empty field set: the whole query is empty regardless
                    // of the remaining signals.
                    if matches!(step, PlanStep::Field)
                        && field_set.as_ref().is_some_and(BTreeSet::is_empty)
                    {
                        return Ok((Vec::new(), false));
                    }
                }
                Err(e) if e.code() == ErrorCode::Timeout && completed > 0 => {
                    debug!(step = ?step, "Deadline expired mid-plan, returning partial result");
                    partial = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let fused = fusion::fuse(&lists, &self.config.fusion, query.fusion_mode);
        // `connected` is a reachability constraint, not just a ranking
        // signal: once the traversal completed, ids outside its reach are
        // out regardless of the other signals.
        let mut matches: Vec<Match> = fused
            .into_iter()
            .filter(|f| {
                Self::accepts(restrict, f.id)
                    && Self::accepts(graph_set.as_ref(), f.id)
                    && self.index.is_live(f.id)
            })
            .map(fused_to_match)
            .collect();

        if let Some(boost) = &query.boost {
            if !boost.is_empty() {
                self.apply_boosts(&mut matches, boost)?;
            }
        }

        Ok((matches, partial))
    }

    fn apply_boosts(&self, matches: &mut Vec<Match>, boost: &fusion::Boost) -> Result<()> {
        // Boosts apply after fusion and before the final sort and limit,
        // so every fused candidate is scored — a strong multiplier must
        // be able to promote a candidate from anywhere in the pool. The
        // records read here feed scoring only; result hydration remains
        // page-only.
        let ids: Vec<EntityId> = matches.iter().map(|m| m.id).collect();
        let entities = self.hydrate(&ids)?;
        let now = Timestamp::now();
        for m in matches.iter_mut() {
            if let Some(entity) = entities.get(&m.id) {
                m.score *= fusion::boost_multiplier(boost, entity, &self.config.fusion, now);
            }
        }
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| {
                    let da = a.vector_score.unwrap_or(f32::INFINITY);
                    let db = b.vector_score.unwrap_or(f32::INFINITY);
                    da.total_cmp(&db)
                })
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(())
    }

    // =========================================================================
    // Signal primitives
    // =========================================================================

    fn vector_search(
        &self,
        query: &FindQuery,
        query_vector: Option<&Vector>,
        k: usize,
        restrict: Option<&BTreeSet<EntityId>>,
        token: &CancelToken,
    ) -> Result<Vec<(EntityId, f32)>> {
        let vector = query_vector
            .ok_or_else(|| NousError::internal("vector step planned without a query vector"))?;
        let ef = query.similar.as_ref().and_then(|s| s.ef);
        match restrict {
            Some(set) => self.vectors.search(
                vector,
                k,
                ef,
                Some(&|id| set.contains(&id)),
                token,
            ),
            None => self.vectors.search(vector, k, ef, None, token),
        }
    }

    fn traverse(&self, query: &FindQuery, token: &CancelToken) -> Result<Vec<(EntityId, f32)>> {
        let connected = query
            .connected
            .as_ref()
            .ok_or_else(|| NousError::internal("graph step planned without a start set"))?;
        let decay = connected.decay.unwrap_or(self.config.graph_decay);
        let visits = self.graph.traverse(
            &connected.from,
            connected.direction,
            connected.depth,
            connected.verbs.as_deref(),
            decay,
            token,
        )?;
        Ok(visits.into_iter().map(|v| (v.id, v.score)).collect())
    }

    fn hydrate(&self, ids: &[EntityId]) -> Result<HashMap<EntityId, Entity>> {
        let mut entities = HashMap::with_capacity(ids.len());
        for &id in ids {
            if let Some(entity) = self.storage.get_entity(id)? {
                if !entity.is_deleted() {
                    entities.insert(id, entity);
                }
            }
        }
        Ok(entities)
    }
}

fn blank_match(id: EntityId, score: f32) -> Match {
    Match {
        id,
        score,
        vector_score: None,
        field_score: None,
        graph_score: None,
        fusion_score: score,
        entity: None,
        explanation: None,
    }
}

fn fused_to_match(fused: Fused) -> Match {
    Match {
        id: fused.id,
        score: fused.fusion_score,
        vector_score: fused.vector_distance,
        field_score: fused.field_hit.then_some(1.0),
        graph_score: fused.graph_score,
        fusion_score: fused.fusion_score,
        entity: None,
        explanation: None,
    }
}

fn explain_match(m: &Match, plan: &Plan, generation: u64) -> String {
    let mut parts = vec![format!("route={:?}", plan.route)];
    if !plan.steps.is_empty() {
        parts.push(format!("steps={:?}", plan.steps));
    }
    if let Some(d) = m.vector_score {
        parts.push(format!("vector_distance={:.4}", d));
    }
    if m.field_score.is_some() {
        parts.push("field=matched".to_string());
    }
    if let Some(g) = m.graph_score {
        parts.push(format!("graph_score={:.4}", g));
    }
    parts.push(format!("fusion_score={:.6}", m.fusion_score));
    parts.push(format!("generation={}", generation));
    parts.join(" ")
}
