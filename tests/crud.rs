//! Entity and edge CRUD integration tests.

use nousdb::{
    Config, Database, DeleteOptions, Dimension, EntityKind, EntityUpdate, ErrorCode, MetadataMap,
    MetadataValue, NewEdge, NewEntity, Verb,
};

fn db() -> Database {
    Database::in_memory(Config {
        dimension: Dimension::Custom(4),
        ..Default::default()
    })
    .unwrap()
}

fn vec4(seed: f32) -> Vec<f32> {
    vec![seed, 1.0 - seed, 0.5, 0.25]
}

#[test]
fn add_then_get_until_delete() {
    let db = db();
    let id = db
        .add_vector(vec4(0.1), EntityKind::Document, MetadataMap::new())
        .unwrap();

    // Retrievable until deleted.
    assert!(db.get(id, false).unwrap().is_some());

    db.delete(id, DeleteOptions::soft()).unwrap();
    assert!(db.get(id, false).unwrap().is_none());

    // Tombstone still reachable with the explicit flag.
    let raw = db.get(id, true).unwrap().unwrap();
    assert!(raw.deleted_at.is_some());
}

#[test]
fn hard_delete_then_get_is_null() {
    let db = db();
    let id = db
        .add_vector(vec4(0.2), EntityKind::Document, MetadataMap::new())
        .unwrap();
    db.delete(
        id,
        DeleteOptions {
            hard: true,
            cascade: false,
        },
    )
    .unwrap();
    assert!(db.get(id, true).unwrap().is_none());
}

#[test]
fn readd_after_hard_delete_gets_fresh_id() {
    let db = db();
    let first = db
        .add_vector(vec4(0.3), EntityKind::Document, MetadataMap::new())
        .unwrap();
    db.delete(first, DeleteOptions { hard: true, cascade: false })
        .unwrap();

    let second = db
        .add_vector(vec4(0.3), EntityKind::Document, MetadataMap::new())
        .unwrap();
    assert_ne!(first, second, "ids are never reused");
}

#[test]
fn update_metadata_visible_on_get() {
    let db = db();
    let id = db
        .add_vector(vec4(0.4), EntityKind::Concept, MetadataMap::new())
        .unwrap();

    let mut metadata = MetadataMap::new();
    metadata.insert("topic".into(), MetadataValue::from("retrieval"));
    metadata.insert("depth".into(), MetadataValue::Int(3));
    db.update(
        id,
        EntityUpdate {
            metadata: Some(metadata.clone()),
            ..Default::default()
        },
    )
    .unwrap();

    let entity = db.get(id, false).unwrap().unwrap();
    assert_eq!(entity.metadata, metadata);
}

#[test]
fn update_with_explicit_vector_skips_embedding() {
    let db = db();
    let id = db
        .add_vector(vec![1.0, 0.0, 0.0, 0.0], EntityKind::Concept, MetadataMap::new())
        .unwrap();

    db.update(
        id,
        EntityUpdate {
            vector: Some(vec![0.0, 0.0, 0.0, 1.0]),
            ..Default::default()
        },
    )
    .unwrap();

    let hits = db.search(&[0.0, 0.0, 0.0, 1.0], 1).unwrap();
    assert_eq!(hits[0].0, id);
    assert!(hits[0].1 < 1e-5);
}

#[test]
fn dimension_mismatch_rejected_without_state() {
    let db = db();
    let generation_before = db.stats().generation;
    let err = db
        .add_vector(vec![1.0, 0.0], EntityKind::Thing, MetadataMap::new())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DimensionMismatch);
    assert_eq!(db.stats().entity_count, 0);
    assert_eq!(db.stats().generation, generation_before, "no commit happened");
}

#[test]
fn edge_lifecycle_and_conflict() {
    let db = db();
    let a = db
        .add_vector(vec4(0.1), EntityKind::Person, MetadataMap::new())
        .unwrap();
    let b = db
        .add_vector(vec4(0.2), EntityKind::Document, MetadataMap::new())
        .unwrap();

    let edge_id = db
        .add_edge(NewEdge::new(a, b, Verb::References).with_weight(0.8))
        .unwrap();
    assert_eq!(db.stats().edge_count, 1);

    // Entity deletion fails while incident edges exist.
    let err = db.delete(a, DeleteOptions::soft()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);

    // Edge removal precedes entity removal.
    db.delete_edge(edge_id).unwrap();
    db.delete(a, DeleteOptions::soft()).unwrap();
    assert_eq!(db.stats().edge_count, 0);
}

#[test]
fn cascade_delete_removes_edges_atomically() {
    let db = db();
    let a = db
        .add_vector(vec4(0.1), EntityKind::Person, MetadataMap::new())
        .unwrap();
    let b = db
        .add_vector(vec4(0.2), EntityKind::Document, MetadataMap::new())
        .unwrap();
    let c = db
        .add_vector(vec4(0.3), EntityKind::Document, MetadataMap::new())
        .unwrap();
    db.add_edge(NewEdge::new(a, b, Verb::References)).unwrap();
    db.add_edge(NewEdge::new(c, a, Verb::Contains)).unwrap();

    db.delete(
        a,
        DeleteOptions {
            cascade: true,
            hard: false,
        },
    )
    .unwrap();
    assert_eq!(db.stats().edge_count, 0);
    assert!(db.get(b, false).unwrap().is_some());
    assert!(db.get(c, false).unwrap().is_some());
}

#[test]
fn edge_to_missing_entity_rejected() {
    let db = db();
    let a = db
        .add_vector(vec4(0.1), EntityKind::Person, MetadataMap::new())
        .unwrap();
    let err = db
        .add_edge(NewEdge::new(a, nousdb::EntityId::new(), Verb::RelatedTo))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn edge_weight_validation() {
    let db = db();
    let a = db
        .add_vector(vec4(0.1), EntityKind::Person, MetadataMap::new())
        .unwrap();
    let b = db
        .add_vector(vec4(0.2), EntityKind::Person, MetadataMap::new())
        .unwrap();
    let err = db
        .add_edge(NewEdge::new(a, b, Verb::RelatedTo).with_weight(2.0))
        .unwrap_err();
    assert!(matches!(err, nousdb::NousError::Validation(_)));

    // Default weight is 0.5.
    let id = db.add_edge(NewEdge::new(a, b, Verb::RelatedTo)).unwrap();
    let edge = db.get_edge(id).unwrap().unwrap();
    assert!((edge.weight - nousdb::DEFAULT_EDGE_WEIGHT).abs() < f32::EPSILON);
}

#[test]
fn fingerprint_dedup_returns_existing_id() {
    let db = db();
    let mut input = NewEntity::vector(vec4(0.5), EntityKind::Document);
    input.content_fingerprint = Some("sha256:abcd".to_string());

    let first = db.add_entity(input.clone()).unwrap();
    let second = db.add_entity(input).unwrap();
    assert_eq!(first, second);
    assert_eq!(db.stats().entity_count, 1);
}

#[test]
fn add_many_partial_failure() {
    let db = db();
    let items = vec![
        NewEntity::vector(vec4(0.1), EntityKind::Document),
        NewEntity::vector(vec![0.1, 0.2], EntityKind::Document), // wrong dim
        NewEntity::vector(vec4(0.3), EntityKind::Document),
        NewEntity::default(), // no data, no vector
    ];
    let outcome = db.add_many(items, false);
    assert_eq!(outcome.successful.len(), 2);
    assert_eq!(outcome.failed.len(), 2);
    let failed_indices: Vec<usize> = outcome.failed.iter().map(|(i, _)| *i).collect();
    assert_eq!(failed_indices, vec![1, 3]);
    assert_eq!(db.stats().entity_count, 2);
}

#[test]
fn add_many_parallel_matches_serial() {
    let db = db();
    let items: Vec<NewEntity> = (0..50)
        .map(|i| NewEntity::vector(vec4(i as f32 / 50.0), EntityKind::Message))
        .collect();
    let outcome = db.add_many(items, true);
    assert_eq!(outcome.successful.len(), 50);
    assert!(outcome.failed.is_empty());
    assert_eq!(db.stats().entity_count, 50);
}
