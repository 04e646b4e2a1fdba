//! Fusion combiner: merge ranked lists from multiple signals.
//!
//! The default combiner is Reciprocal Rank Fusion: the contribution of id
//! `x` from signal `s` is `w_s / (k + rank_s(x))`, summed over signals,
//! with `k = 60` and weights renormalized over the signals present. The
//! alternate weighted-linear mode sums normalized native scores instead.
//!
//! When the field signal participates, fusion runs in **intersection
//! mode**: an empty field set short-circuits to an empty result, and all
//! signals' contributions are restricted to the field id set before
//! scoring.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::entity::Entity;
use crate::types::{EntityId, MetadataValue, Timestamp};

/// How multi-signal scores are combined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FusionMode {
    /// Reciprocal Rank Fusion (the default).
    #[default]
    Rrf,
    /// Weighted sum of normalized native scores.
    WeightedLinear,
}

/// Post-fusion score boosts.
///
/// Boosts are multipliers applied after fusion, before the final sort and
/// limit: `recent` decays with the entity's age, `popular` scales with the
/// log of a numeric metadata field, `verified` is a flat 1.5× when a
/// boolean field is true.
#[derive(Clone, Debug, Default)]
pub struct Boost {
    /// Exponential decay on `updated_at` (half-life from config).
    pub recent: bool,
    /// Log-scale boost on a numeric metadata field.
    pub popular: Option<String>,
    /// 1.5× when this boolean metadata field is true.
    pub verified: Option<String>,
}

impl Boost {
    /// Recency boost only.
    pub fn recent() -> Self {
        Self {
            recent: true,
            ..Default::default()
        }
    }

    /// Popularity boost on the default `views` field.
    pub fn popular() -> Self {
        Self {
            popular: Some("views".to_string()),
            ..Default::default()
        }
    }

    /// Verified boost on the default `verified` field.
    pub fn verified() -> Self {
        Self {
            verified: Some("verified".to_string()),
            ..Default::default()
        }
    }

    /// Returns true if no boost is requested.
    pub fn is_empty(&self) -> bool {
        !self.recent && self.popular.is_none() && self.verified.is_none()
    }
}

/// The per-signal ranked lists handed to the combiner.
///
/// `None` means the signal was absent from the query (or did not complete
/// before the deadline); its weight is renormalized away.
#[derive(Clone, Debug, Default)]
pub struct SignalLists {
    /// `(id, distance)` ascending by distance.
    pub vector: Option<Vec<(EntityId, f32)>>,
    /// Filter-matching ids, stable-sorted by id.
    pub field: Option<Vec<EntityId>>,
    /// `(id, decayed score)` descending by score.
    pub graph: Option<Vec<(EntityId, f32)>>,
}

/// A fused candidate before hydration and boosts.
#[derive(Clone, Debug)]
pub struct Fused {
    /// Candidate entity.
    pub id: EntityId,
    /// Combined score.
    pub fusion_score: f32,
    /// Raw vector distance, when the vector signal saw this id.
    pub vector_distance: Option<f32>,
    /// True when the field signal matched this id.
    pub field_hit: bool,
    /// Decayed graph score, when the graph signal reached this id.
    pub graph_score: Option<f32>,
}

/// Combines the signal lists into a single descending ranking.
///
/// Intersection mode: when `lists.field` is present, an empty list yields
/// an empty result and every other signal is restricted to the field set.
pub fn fuse(lists: &SignalLists, config: &FusionConfig, mode: FusionMode) -> Vec<Fused> {
    let restrict: Option<BTreeSet<EntityId>> =
        lists.field.as_ref().map(|ids| ids.iter().copied().collect());
    if let Some(set) = &restrict {
        if set.is_empty() {
            return Vec::new();
        }
    }

    // Renormalize weights over the signals present.
    let mut weight_sum = 0.0f32;
    if lists.vector.is_some() {
        weight_sum += config.vector_weight;
    }
    if lists.field.is_some() {
        weight_sum += config.field_weight;
    }
    if lists.graph.is_some() {
        weight_sum += config.graph_weight;
    }
    if weight_sum <= 0.0 {
        return Vec::new();
    }
    let w_vector = config.vector_weight / weight_sum;
    let w_field = config.field_weight / weight_sum;
    let w_graph = config.graph_weight / weight_sum;

    let k = config.rrf_k as f32;
    let mut fused: HashMap<EntityId, Fused> = HashMap::new();

    let entry = |id: EntityId| -> Option<EntityId> {
        match &restrict {
            Some(set) if !set.contains(&id) => None,
            _ => Some(id),
        }
    };

    if let Some(vector) = &lists.vector {
        for (rank, (id, distance)) in vector.iter().enumerate() {
            let Some(id) = entry(*id) else { continue };
            let contribution = match mode {
                FusionMode::Rrf => w_vector / (k + rank as f32 + 1.0),
                FusionMode::WeightedLinear => w_vector / (1.0 + distance.max(0.0)),
            };
            let slot = fused.entry(id).or_insert_with(|| blank(id));
            slot.fusion_score += contribution;
            slot.vector_distance = Some(*distance);
        }
    }

    if let Some(field) = &lists.field {
        for (rank, id) in field.iter().enumerate() {
            let contribution = match mode {
                FusionMode::Rrf => w_field / (k + rank as f32 + 1.0),
                FusionMode::WeightedLinear => w_field,
            };
            let slot = fused.entry(*id).or_insert_with(|| blank(*id));
            slot.fusion_score += contribution;
            slot.field_hit = true;
        }
    }

    if let Some(graph) = &lists.graph {
        for (rank, (id, score)) in graph.iter().enumerate() {
            let Some(id) = entry(*id) else { continue };
            let contribution = match mode {
                FusionMode::Rrf => w_graph / (k + rank as f32 + 1.0),
                FusionMode::WeightedLinear => w_graph * score.clamp(0.0, 1.0),
            };
            let slot = fused.entry(id).or_insert_with(|| blank(id));
            slot.fusion_score += contribution;
            slot.graph_score = Some(*score);
        }
    }

    let mut result: Vec<Fused> = fused.into_values().collect();
    // Ties: higher vector similarity (lower distance) first, then lower id.
    result.sort_by(|a, b| {
        b.fusion_score
            .total_cmp(&a.fusion_score)
            .then_with(|| {
                let da = a.vector_distance.unwrap_or(f32::INFINITY);
                let db = b.vector_distance.unwrap_or(f32::INFINITY);
                da.total_cmp(&db)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    result
}

fn blank(id: EntityId) -> Fused {
    Fused {
        id,
        fusion_score: 0.0,
        vector_distance: None,
        field_hit: false,
        graph_score: None,
    }
}

/// Computes the boost multiplier for one entity.
pub fn boost_multiplier(
    boost: &Boost,
    entity: &Entity,
    config: &FusionConfig,
    now: Timestamp,
) -> f32 {
    let mut multiplier = 1.0f32;

    if boost.recent {
        let age_ms = (now.as_millis() - entity.updated_at.as_millis()).max(0) as f32;
        let age_days = age_ms / 86_400_000.0;
        multiplier *= 0.5f32.powf(age_days / config.recency_half_life_days);
    }

    if let Some(field) = &boost.popular {
        let value = entity
            .metadata
            .get(field)
            .and_then(MetadataValue::as_number)
            .unwrap_or(0.0)
            .max(0.0);
        multiplier *= 1.0 + (1.0 + value as f32).ln();
    }

    if let Some(field) = &boost.verified {
        if entity.metadata.get(field).and_then(MetadataValue::as_bool) == Some(true) {
            multiplier *= 1.5;
        }
    }

    multiplier
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityKind, MetadataMap};

    fn id_at(n: u8) -> EntityId {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        EntityId::from_bytes(bytes)
    }

    fn config() -> FusionConfig {
        FusionConfig::default()
    }

    #[test]
    fn test_single_signal_preserves_order() {
        let lists = SignalLists {
            vector: Some(vec![(id_at(1), 0.0), (id_at(2), 0.3), (id_at(3), 0.9)]),
            ..Default::default()
        };
        let fused = fuse(&lists, &config(), FusionMode::Rrf);
        let ids: Vec<EntityId> = fused.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![id_at(1), id_at(2), id_at(3)]);
    }

    #[test]
    fn test_agreement_across_signals_wins() {
        // id 2 appears mid-rank in both lists; id 1 leads only one.
        let lists = SignalLists {
            vector: Some(vec![(id_at(1), 0.0), (id_at(2), 0.1)]),
            graph: Some(vec![(id_at(2), 0.8), (id_at(3), 0.4)]),
            ..Default::default()
        };
        let fused = fuse(&lists, &config(), FusionMode::Rrf);
        assert_eq!(fused[0].id, id_at(2), "double-listed id should rank first");
        assert!(fused[0].vector_distance.is_some());
        assert!(fused[0].graph_score.is_some());
    }

    #[test]
    fn test_empty_field_set_short_circuits() {
        let lists = SignalLists {
            vector: Some(vec![(id_at(1), 0.0)]),
            field: Some(vec![]),
            graph: Some(vec![(id_at(1), 0.9)]),
        };
        assert!(fuse(&lists, &config(), FusionMode::Rrf).is_empty());
    }

    #[test]
    fn test_intersection_mode_restricts_other_signals() {
        let lists = SignalLists {
            vector: Some(vec![(id_at(1), 0.0), (id_at(2), 0.1)]),
            field: Some(vec![id_at(2)]),
            graph: Some(vec![(id_at(1), 0.9), (id_at(2), 0.5)]),
        };
        let fused = fuse(&lists, &config(), FusionMode::Rrf);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].id, id_at(2));
    }

    #[test]
    fn test_weights_renormalized_when_signal_absent() {
        // A single present signal should carry full weight regardless of
        // which one it is.
        let vector_only = SignalLists {
            vector: Some(vec![(id_at(1), 0.0)]),
            ..Default::default()
        };
        let graph_only = SignalLists {
            graph: Some(vec![(id_at(1), 0.9)]),
            ..Default::default()
        };
        let a = fuse(&vector_only, &config(), FusionMode::Rrf);
        let b = fuse(&graph_only, &config(), FusionMode::Rrf);
        assert!((a[0].fusion_score - b[0].fusion_score).abs() < 1e-6);
    }

    #[test]
    fn test_tie_break_by_vector_then_id() {
        // Two ids with identical fusion contributions from the field
        // signal at the same... ranks differ in a list, so engineer a tie
        // through the vector list instead: same rank impossible, so test
        // the id tiebreak with equal scores via two graph-only lists.
        let lists = SignalLists {
            graph: Some(vec![(id_at(9), 0.5), (id_at(1), 0.5)]),
            ..Default::default()
        };
        let fused = fuse(&lists, &config(), FusionMode::Rrf);
        // Ranks differ so scores differ; first listed wins.
        assert_eq!(fused[0].id, id_at(9));

        // True tie: one id in vector with distance, one without any —
        // construct equal scores via weighted-linear field mode.
        let lists = SignalLists {
            field: Some(vec![id_at(7), id_at(3)]),
            ..Default::default()
        };
        let fused = fuse(&lists, &config(), FusionMode::WeightedLinear);
        // Equal flat contributions: lower id first.
        assert_eq!(fused[0].id, id_at(3));
        assert!((fused[0].fusion_score - fused[1].fusion_score).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_linear_uses_native_scores() {
        let lists = SignalLists {
            vector: Some(vec![(id_at(1), 0.0), (id_at(2), 1.0)]),
            ..Default::default()
        };
        let fused = fuse(&lists, &config(), FusionMode::WeightedLinear);
        // distance 0 → 1.0, distance 1 → 0.5 (before weight scaling)
        assert!(fused[0].fusion_score > fused[1].fusion_score);
        assert!((fused[0].fusion_score / fused[1].fusion_score - 2.0).abs() < 1e-5);
    }

    fn entity_with(metadata: MetadataMap, updated_at: Timestamp) -> Entity {
        Entity {
            id: EntityId::new(),
            vector: vec![],
            kind: EntityKind::Document,
            data: String::new(),
            metadata,
            created_at: updated_at,
            updated_at,
            deleted_at: None,
        }
    }

    #[test]
    fn test_recent_boost_decays_with_age() {
        let now = Timestamp::from_millis(1_700_000_000_000);
        let fresh = entity_with(MetadataMap::new(), now);
        let month_ms = 30 * 86_400_000i64;
        let stale = entity_with(MetadataMap::new(), Timestamp::from_millis(now.as_millis() - month_ms));

        let boost = Boost::recent();
        let fresh_mult = boost_multiplier(&boost, &fresh, &config(), now);
        let stale_mult = boost_multiplier(&boost, &stale, &config(), now);
        assert!((fresh_mult - 1.0).abs() < 1e-3);
        // One half-life old: half the multiplier.
        assert!((stale_mult - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_popular_boost_is_logarithmic() {
        let now = Timestamp::now();
        let mut meta = MetadataMap::new();
        meta.insert("views".into(), MetadataValue::Int(0));
        let unseen = entity_with(meta.clone(), now);
        meta.insert("views".into(), MetadataValue::Int(1000));
        let seen = entity_with(meta, now);

        let boost = Boost::popular();
        let low = boost_multiplier(&boost, &unseen, &config(), now);
        let high = boost_multiplier(&boost, &seen, &config(), now);
        assert!((low - 1.0).abs() < 1e-6, "zero views is neutral");
        assert!(high > low);
        assert!(high < 10.0, "log scale stays bounded");
    }

    #[test]
    fn test_verified_boost() {
        let now = Timestamp::now();
        let mut meta = MetadataMap::new();
        meta.insert("verified".into(), MetadataValue::Bool(true));
        let verified = entity_with(meta, now);
        let plain = entity_with(MetadataMap::new(), now);

        let boost = Boost::verified();
        assert!(
            (boost_multiplier(&boost, &verified, &config(), now) - 1.5).abs() < 1e-6
        );
        assert!(
            (boost_multiplier(&boost, &plain, &config(), now) - 1.0).abs() < 1e-6
        );
    }
}
