//! Entity and edge records — the stored data model.
//!
//! An [`Entity`] ("noun") carries a vector, a kind, and free-form metadata.
//! An [`Edge`] ("verb") is a directed, weighted relationship between two
//! entities. Records are owned exclusively by the registry; every other
//! component holds only ids and copies.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError};
use crate::types::{EdgeId, EntityId, EntityKind, MetadataMap, MetadataValue, Timestamp, Vector, Verb};

/// The primary stored object.
///
/// # Soft delete
///
/// `deleted_at` is the tombstone: a soft-deleted entity is excluded from
/// every query but remains retrievable by explicit id lookup with
/// `include_deleted` until [`compact`](crate::Database::compact) purges it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier, assigned on create, never reused.
    pub id: EntityId,

    /// Dense embedding of the entity's content (database dimension).
    pub vector: Vector,

    /// Entity category, used for type-filtered search.
    pub kind: EntityKind,

    /// Source text the vector was computed from, when the entity was
    /// added through the embedding path. Empty for `add_vector` entities.
    pub data: String,

    /// Free-form metadata: field name → scalar or homogeneous array.
    pub metadata: MetadataMap,

    /// When the entity was created.
    pub created_at: Timestamp,

    /// When the entity was last updated.
    pub updated_at: Timestamp,

    /// Soft-delete tombstone. `Some` means logically deleted.
    pub deleted_at: Option<Timestamp>,
}

impl Entity {
    /// Returns true if this entity is soft-deleted.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A directed, typed, weighted relationship between two entities.
///
/// Edges are never mutated in place; re-weighting is a delete-and-add.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Edge {
    /// Unique identifier for this edge.
    pub id: EdgeId,

    /// The entity this edge originates from.
    pub source_id: EntityId,

    /// The entity this edge points to.
    pub target_id: EntityId,

    /// The kind of relationship.
    pub verb: Verb,

    /// Strength of the relation in [0, 1]; used as the graph-signal score.
    pub weight: f32,

    /// Free-form metadata.
    pub metadata: MetadataMap,

    /// When this edge was created.
    pub created_at: Timestamp,
}

/// Default edge weight when the caller does not supply one.
pub const DEFAULT_EDGE_WEIGHT: f32 = 0.5;

/// Input for creating a new entity through the embedding path.
#[derive(Clone, Debug, Default)]
pub struct NewEntity {
    /// Text to embed. Must be non-empty unless a vector is supplied.
    pub data: String,

    /// Entity category.
    pub kind: Option<EntityKind>,

    /// Pre-computed vector; when present, embedding is bypassed.
    pub vector: Option<Vector>,

    /// Free-form metadata.
    pub metadata: MetadataMap,

    /// Optional dedup fingerprint. When a fingerprint collides with an
    /// existing live entity, `add` returns the existing id instead of
    /// inserting.
    pub content_fingerprint: Option<String>,
}

impl NewEntity {
    /// Builds a text entity of the given kind.
    pub fn text(data: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            data: data.into(),
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Builds a pre-embedded entity of the given kind.
    pub fn vector(vector: Vector, kind: EntityKind) -> Self {
        Self {
            vector: Some(vector),
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Attaches a metadata field (builder style).
    pub fn with_meta(mut self, field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(field.into(), value.into());
        self
    }
}

/// Mutations applied to an existing entity.
///
/// Only `Some` fields change. Supplying `data` re-embeds the vector;
/// `metadata` replaces the whole map.
#[derive(Clone, Debug, Default)]
pub struct EntityUpdate {
    /// Replacement text; triggers re-embedding.
    pub data: Option<String>,

    /// Replacement vector; used instead of re-embedding when present.
    pub vector: Option<Vector>,

    /// Replacement metadata map.
    pub metadata: Option<MetadataMap>,
}

impl EntityUpdate {
    /// Returns true if the update carries no changes.
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.vector.is_none() && self.metadata.is_none()
    }
}

/// Input for creating a new edge.
#[derive(Clone, Debug)]
pub struct NewEdge {
    /// The entity this edge originates from.
    pub source_id: EntityId,

    /// The entity this edge points to.
    pub target_id: EntityId,

    /// The kind of relationship.
    pub verb: Verb,

    /// Strength in [0, 1]. Defaults to [`DEFAULT_EDGE_WEIGHT`].
    pub weight: Option<f32>,

    /// Free-form metadata.
    pub metadata: MetadataMap,
}

impl NewEdge {
    /// Builds an edge between two entities with default weight.
    pub fn new(source_id: EntityId, target_id: EntityId, verb: Verb) -> Self {
        Self {
            source_id,
            target_id,
            verb,
            weight: None,
            metadata: MetadataMap::new(),
        }
    }

    /// Sets the edge weight (builder style).
    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Options for entity deletion.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteOptions {
    /// Delete incident edges in the same batch instead of failing with
    /// `Conflict` when any exist.
    pub cascade: bool,

    /// Physically remove the record instead of tombstoning it.
    pub hard: bool,
}

impl DeleteOptions {
    /// Soft delete, no cascade (the default).
    pub fn soft() -> Self {
        Self::default()
    }

    /// Hard delete with cascade.
    pub fn purge() -> Self {
        Self {
            cascade: true,
            hard: true,
        }
    }
}

/// Validates a new-entity input against the database dimension.
///
/// A metadata array must be homogeneous: scalars of one variant.
pub fn validate_new_entity(input: &NewEntity, dimension: usize) -> Result<()> {
    if input.data.is_empty() && input.vector.is_none() {
        return Err(ValidationError::required_field("data").into());
    }

    if let Some(vector) = &input.vector {
        if vector.len() != dimension {
            return Err(ValidationError::dimension_mismatch(dimension, vector.len()).into());
        }
    }

    validate_metadata(&input.metadata)?;

    if let Some(fp) = &input.content_fingerprint {
        if fp.is_empty() {
            return Err(
                ValidationError::invalid_field("content_fingerprint", "must not be empty").into(),
            );
        }
    }

    Ok(())
}

/// Validates an entity update.
pub fn validate_entity_update(update: &EntityUpdate, dimension: usize) -> Result<()> {
    if update.is_empty() {
        return Err(ValidationError::invalid_field("update", "carries no changes").into());
    }
    if let Some(vector) = &update.vector {
        if vector.len() != dimension {
            return Err(ValidationError::dimension_mismatch(dimension, vector.len()).into());
        }
    }
    if let Some(metadata) = &update.metadata {
        validate_metadata(metadata)?;
    }
    Ok(())
}

/// Validates a new-edge input.
pub fn validate_new_edge(input: &NewEdge) -> Result<()> {
    if let Some(weight) = input.weight {
        if !(0.0..=1.0).contains(&weight) || !weight.is_finite() {
            return Err(ValidationError::invalid_field("weight", "must be in [0, 1]").into());
        }
    }
    validate_metadata(&input.metadata)
}

fn validate_metadata(metadata: &MetadataMap) -> Result<()> {
    for (field, value) in metadata {
        if field.is_empty() {
            return Err(
                ValidationError::invalid_field("metadata", "field names must not be empty").into(),
            );
        }
        if let MetadataValue::Array(items) = value {
            let mut tag: Option<std::mem::Discriminant<MetadataValue>> = None;
            for item in items {
                if !item.is_scalar() {
                    return Err(ValidationError::invalid_field(
                        field.clone(),
                        "arrays may not nest arrays",
                    )
                    .into());
                }
                let item_tag = std::mem::discriminant(item);
                match tag {
                    None => tag = Some(item_tag),
                    Some(t) if t == item_tag => {}
                    Some(_) => {
                        return Err(ValidationError::invalid_field(
                            field.clone(),
                            "arrays must be homogeneous",
                        )
                        .into())
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entity_builder() {
        let input = NewEntity::text("hello", EntityKind::Document)
            .with_meta("lang", "en")
            .with_meta("views", 3i64);
        assert_eq!(input.data, "hello");
        assert_eq!(input.kind, Some(EntityKind::Document));
        assert_eq!(input.metadata.len(), 2);
    }

    #[test]
    fn test_validate_requires_data_or_vector() {
        let input = NewEntity::default();
        assert!(validate_new_entity(&input, 4).is_err());

        let input = NewEntity::vector(vec![0.0; 4], EntityKind::Thing);
        assert!(validate_new_entity(&input, 4).is_ok());
    }

    #[test]
    fn test_validate_vector_dimension() {
        let input = NewEntity::vector(vec![0.0; 3], EntityKind::Thing);
        let err = validate_new_entity(&input, 4).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_validate_rejects_heterogeneous_array() {
        let input = NewEntity::text("x", EntityKind::Thing).with_meta(
            "tags",
            MetadataValue::Array(vec![MetadataValue::from("a"), MetadataValue::Int(1)]),
        );
        assert!(validate_new_entity(&input, 4).is_err());
    }

    #[test]
    fn test_validate_rejects_nested_array() {
        let input = NewEntity::text("x", EntityKind::Thing).with_meta(
            "tags",
            MetadataValue::Array(vec![MetadataValue::Array(vec![])]),
        );
        assert!(validate_new_entity(&input, 4).is_err());
    }

    #[test]
    fn test_validate_empty_update_rejected() {
        assert!(validate_entity_update(&EntityUpdate::default(), 4).is_err());

        let update = EntityUpdate {
            metadata: Some(MetadataMap::new()),
            ..Default::default()
        };
        assert!(validate_entity_update(&update, 4).is_ok());
    }

    #[test]
    fn test_validate_edge_weight_bounds() {
        let mut edge = NewEdge::new(EntityId::new(), EntityId::new(), Verb::RelatedTo);
        assert!(validate_new_edge(&edge).is_ok());

        edge.weight = Some(0.5);
        assert!(validate_new_edge(&edge).is_ok());

        edge.weight = Some(1.5);
        assert!(validate_new_edge(&edge).is_err());

        edge.weight = Some(f32::NAN);
        assert!(validate_new_edge(&edge).is_err());
    }

    #[test]
    fn test_entity_is_deleted() {
        let mut entity = Entity {
            id: EntityId::new(),
            vector: vec![0.0; 4],
            kind: EntityKind::Thing,
            data: String::new(),
            metadata: MetadataMap::new(),
            created_at: Timestamp::now(),
            updated_at: Timestamp::now(),
            deleted_at: None,
        };
        assert!(!entity.is_deleted());
        entity.deleted_at = Some(Timestamp::now());
        assert!(entity.is_deleted());
    }

    #[test]
    fn test_delete_options() {
        let soft = DeleteOptions::soft();
        assert!(!soft.cascade && !soft.hard);
        let purge = DeleteOptions::purge();
        assert!(purge.cascade && purge.hard);
    }
}
