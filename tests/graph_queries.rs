//! Graph traversal integration tests.

use nousdb::{
    Config, Database, Dimension, Direction, EntityId, EntityKind, ErrorCode, MetadataMap, NewEdge,
    Verb,
};

fn db() -> Database {
    Database::in_memory(Config {
        dimension: Dimension::Custom(4),
        ..Default::default()
    })
    .unwrap()
}

fn add(db: &Database, seed: f32) -> EntityId {
    db.add_vector(
        vec![seed, 1.0 - seed, 0.5, 0.0],
        EntityKind::Concept,
        MetadataMap::new(),
    )
    .unwrap()
}

#[test]
fn chain_traversal_depths_and_weights() {
    // a -> b -> c -> d, each weight 0.5.
    let db = db();
    let ids: Vec<EntityId> = (0..4).map(|i| add(&db, i as f32 * 0.2)).collect();
    for pair in ids.windows(2) {
        db.add_edge(NewEdge::new(pair[0], pair[1], Verb::Precedes).with_weight(0.5))
            .unwrap();
    }

    let visits = db.neighbors(ids[0], Direction::Out, Some(3)).unwrap();
    assert_eq!(visits.len(), 3, "b, c, d reachable");

    for (expected_depth, visit) in visits.iter().enumerate() {
        let depth = expected_depth + 1;
        assert_eq!(visit.id, ids[depth]);
        assert_eq!(visit.depth, depth);
        let expected_weight = 0.5f32.powi(depth as i32);
        assert!(
            (visit.path_weight - expected_weight).abs() < 1e-6,
            "depth {} path weight",
            depth
        );
    }
}

#[test]
fn default_depth_is_two() {
    let db = db();
    let ids: Vec<EntityId> = (0..5).map(|i| add(&db, i as f32 * 0.1)).collect();
    for pair in ids.windows(2) {
        db.add_edge(NewEdge::new(pair[0], pair[1], Verb::Follows))
            .unwrap();
    }

    let visits = db.neighbors(ids[0], Direction::Out, None).unwrap();
    assert_eq!(visits.len(), 2);
    assert!(visits.iter().all(|v| v.depth <= 2));
}

#[test]
fn depth_over_cap_is_rejected() {
    let db = db();
    let a = add(&db, 0.1);
    let err = db.neighbors(a, Direction::Out, Some(17)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DepthLimit);
}

#[test]
fn directionality() {
    let db = db();
    let a = add(&db, 0.1);
    let b = add(&db, 0.2);
    db.add_edge(NewEdge::new(a, b, Verb::Contains)).unwrap();

    // Invariant: the edge is visible from both endpoints in the right
    // directions.
    let out = db.neighbors(a, Direction::Out, Some(1)).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].id, b);

    let inc = db.neighbors(b, Direction::In, Some(1)).unwrap();
    assert_eq!(inc.len(), 1);
    assert_eq!(inc[0].id, a);

    assert!(db.neighbors(a, Direction::In, Some(1)).unwrap().is_empty());
    assert_eq!(db.neighbors(a, Direction::Both, Some(1)).unwrap().len(), 1);
}

#[test]
fn cycles_terminate() {
    let db = db();
    let a = add(&db, 0.1);
    let b = add(&db, 0.2);
    let c = add(&db, 0.3);
    db.add_edge(NewEdge::new(a, b, Verb::RelatedTo)).unwrap();
    db.add_edge(NewEdge::new(b, c, Verb::RelatedTo)).unwrap();
    db.add_edge(NewEdge::new(c, a, Verb::RelatedTo)).unwrap();

    let visits = db.neighbors(a, Direction::Out, Some(10)).unwrap();
    assert_eq!(visits.len(), 2, "each node visited once");
}

#[test]
fn deleted_edges_leave_traversal() {
    let db = db();
    let a = add(&db, 0.1);
    let b = add(&db, 0.2);
    let edge = db.add_edge(NewEdge::new(a, b, Verb::RelatedTo)).unwrap();

    assert_eq!(db.neighbors(a, Direction::Out, Some(1)).unwrap().len(), 1);
    db.delete_edge(edge).unwrap();
    assert!(db.neighbors(a, Direction::Out, Some(1)).unwrap().is_empty());
}

#[test]
fn parallel_edge_tie_feeds_downstream_weights() {
    // Two a->b edges, lighter first; b->c behind them. The weight of c
    // must be the product along the heavier parallel edge.
    let db = db();
    let a = add(&db, 0.1);
    let b = add(&db, 0.2);
    let c = add(&db, 0.3);
    db.add_edge(NewEdge::new(a, b, Verb::RelatedTo).with_weight(0.3))
        .unwrap();
    db.add_edge(NewEdge::new(a, b, Verb::RelatedTo).with_weight(0.7))
        .unwrap();
    db.add_edge(NewEdge::new(b, c, Verb::RelatedTo).with_weight(0.5))
        .unwrap();

    let visits = db.neighbors(a, Direction::Out, Some(2)).unwrap();
    let b_visit = visits.iter().find(|v| v.id == b).unwrap();
    assert!((b_visit.path_weight - 0.7).abs() < 1e-6);
    let c_visit = visits.iter().find(|v| v.id == c).unwrap();
    assert!(
        (c_visit.path_weight - 0.35).abs() < 1e-6,
        "downstream weight must follow the heavier tie, got {}",
        c_visit.path_weight
    );
}

#[test]
fn reweighting_is_delete_and_add() {
    let db = db();
    let a = add(&db, 0.1);
    let b = add(&db, 0.2);
    let edge = db
        .add_edge(NewEdge::new(a, b, Verb::RelatedTo).with_weight(0.3))
        .unwrap();

    db.delete_edge(edge).unwrap();
    let replacement = db
        .add_edge(NewEdge::new(a, b, Verb::RelatedTo).with_weight(0.9))
        .unwrap();
    assert_ne!(edge, replacement);

    let visits = db.neighbors(a, Direction::Out, Some(1)).unwrap();
    assert!((visits[0].path_weight - 0.9).abs() < 1e-6);
}
