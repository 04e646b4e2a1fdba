//! Concurrent reader/writer behavior over a shared database.

use std::sync::Arc;

use nousdb::{Config, Database, Dimension, EntityKind, FindQuery, MetadataMap, Similar};

fn pseudo_vector(seed: u64) -> Vec<f32> {
    (0..8)
        .map(|i| ((seed.wrapping_mul(48271).wrapping_add(i)) % 499) as f32 / 499.0)
        .collect()
}

#[test]
fn searches_proceed_while_writers_insert() {
    let db = Arc::new(
        Database::in_memory(Config {
            dimension: Dimension::Custom(8),
            ..Default::default()
        })
        .unwrap(),
    );

    for seed in 0..50u64 {
        db.add_vector(pseudo_vector(seed), EntityKind::Message, MetadataMap::new())
            .unwrap();
    }

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            for i in 0..40u64 {
                if t % 2 == 0 {
                    db.add_vector(
                        pseudo_vector(1000 + t * 100 + i),
                        EntityKind::Message,
                        MetadataMap::new(),
                    )
                    .unwrap();
                } else {
                    let results = db
                        .find(FindQuery {
                            similar: Some(Similar::vector(pseudo_vector(i))),
                            limit: 5,
                            include_entities: false,
                            ..Default::default()
                        })
                        .unwrap();
                    assert!(results.matches.len() <= 5);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(db.stats().entity_count, 50 + 2 * 40);
}

#[test]
fn concurrent_writes_to_distinct_ids() {
    let db = Arc::new(
        Database::in_memory(Config {
            dimension: Dimension::Custom(8),
            ..Default::default()
        })
        .unwrap(),
    );

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            let mut ids = Vec::new();
            for i in 0..25u64 {
                let id = db
                    .add_vector(
                        pseudo_vector(t * 1000 + i),
                        EntityKind::Thing,
                        MetadataMap::new(),
                    )
                    .unwrap();
                ids.push(id);
            }
            // Every write is immediately readable from its own thread.
            for id in ids {
                assert!(db.get(id, false).unwrap().is_some());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(db.stats().entity_count, 100);
}
