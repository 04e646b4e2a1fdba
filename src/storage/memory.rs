//! In-memory storage backend.
//!
//! Keeps every record in process memory under a single `RwLock`d state.
//! Batches are applied atomically while holding the write lock, so this
//! backend gives the strongest batch semantics of the three. Used for
//! tests, ephemeral databases, and as the reference behavior the durable
//! backends are checked against.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use parking_lot::RwLock;

use super::{BatchOp, StorageBackend, WriteBatch};
use crate::entity::{Edge, Entity};
use crate::error::Result;
use crate::types::{EdgeId, EntityId};

/// Non-durable backend backed by in-process maps.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    // BTreeMap gives ordered id listing for the cursor API.
    entities: BTreeMap<EntityId, Vec<u8>>,
    edges: HashMap<EdgeId, Vec<u8>>,
    by_source: HashMap<EntityId, Vec<EdgeId>>,
    by_target: HashMap<EntityId, Vec<EdgeId>>,
    blobs: HashMap<String, Vec<u8>>,
    sequence: u64,
}

impl MemoryBackend {
    /// Creates an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entity records (tombstones included).
    pub fn entity_count(&self) -> usize {
        self.state.read().entities.len()
    }
}

impl State {
    fn unlink_edge(&mut self, id: EdgeId) {
        if let Some(bytes) = self.edges.remove(&id) {
            // Records are written by this backend, so decode cannot fail;
            // fall back to dropping the index entries if it somehow does.
            if let Ok(edge) = super::codec::decode_edge(&bytes) {
                if let Some(list) = self.by_source.get_mut(&edge.source_id) {
                    list.retain(|&e| e != id);
                }
                if let Some(list) = self.by_target.get_mut(&edge.target_id) {
                    list.retain(|&e| e != id);
                }
            }
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>> {
        let state = self.state.read();
        match state.entities.get(&id) {
            Some(bytes) => Ok(Some(super::codec::decode_entity(bytes)?)),
            None => Ok(None),
        }
    }

    fn get_edge(&self, id: EdgeId) -> Result<Option<Edge>> {
        let state = self.state.read();
        match state.edges.get(&id) {
            Some(bytes) => Ok(Some(super::codec::decode_edge(bytes)?)),
            None => Ok(None),
        }
    }

    fn list_entity_ids(
        &self,
        prefix: Option<&str>,
        cursor: Option<EntityId>,
        limit: usize,
    ) -> Result<(Vec<EntityId>, Option<EntityId>)> {
        if limit == 0 {
            return Ok((Vec::new(), cursor));
        }
        let state = self.state.read();
        let mut ids = Vec::new();
        let iter: Box<dyn Iterator<Item = &EntityId>> = match cursor {
            Some(after) => Box::new(
                state
                    .entities
                    .range(after..)
                    .map(|(id, _)| id)
                    .filter(move |&&id| id != after),
            ),
            None => Box::new(state.entities.keys()),
        };
        for &id in iter {
            if let Some(prefix) = prefix {
                if !id.to_string().starts_with(prefix) {
                    continue;
                }
            }
            if ids.len() == limit {
                let last = *ids.last().expect("limit > 0");
                return Ok((ids, Some(last)));
            }
            ids.push(id);
        }
        Ok((ids, None))
    }

    fn list_edges_by_source(&self, id: EntityId) -> Result<Vec<Edge>> {
        let state = self.state.read();
        let Some(edge_ids) = state.by_source.get(&id) else {
            return Ok(Vec::new());
        };
        edge_ids
            .iter()
            .filter_map(|eid| state.edges.get(eid))
            .map(|bytes| super::codec::decode_edge(bytes))
            .collect()
    }

    fn list_edges_by_target(&self, id: EntityId) -> Result<Vec<Edge>> {
        let state = self.state.read();
        let Some(edge_ids) = state.by_target.get(&id) else {
            return Ok(Vec::new());
        };
        edge_ids
            .iter()
            .filter_map(|eid| state.edges.get(eid))
            .map(|bytes| super::codec::decode_edge(bytes))
            .collect()
    }

    fn get_index_blob(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.read().blobs.get(name).cloned())
    }

    fn sequence(&self) -> Result<u64> {
        Ok(self.state.read().sequence)
    }

    fn commit(&self, batch: WriteBatch) -> Result<u64> {
        let mut state = self.state.write();
        for op in batch.ops {
            match op {
                BatchOp::PutEntity(entity) => {
                    let bytes = super::codec::encode_entity(&entity);
                    state.entities.insert(entity.id, bytes);
                }
                BatchOp::DeleteEntity(id) => {
                    state.entities.remove(&id);
                }
                BatchOp::PutEdge(edge) => {
                    let bytes = super::codec::encode_edge(&edge);
                    let id = edge.id;
                    // Re-put of the same edge id must not duplicate index rows.
                    state.unlink_edge(id);
                    state.by_source.entry(edge.source_id).or_default().push(id);
                    state.by_target.entry(edge.target_id).or_default().push(id);
                    state.edges.insert(id, bytes);
                }
                BatchOp::DeleteEdge(id) => {
                    state.unlink_edge(id);
                }
                BatchOp::PutBlob(name, bytes) => {
                    state.blobs.insert(name, bytes);
                }
            }
        }
        state.sequence += 1;
        Ok(state.sequence)
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageBackendExt;
    use crate::types::{EntityKind, MetadataMap, Timestamp, Verb};

    fn entity(id: EntityId) -> Entity {
        Entity {
            id,
            vector: vec![1.0, 2.0],
            kind: EntityKind::Concept,
            data: "x".into(),
            metadata: MetadataMap::new(),
            created_at: Timestamp::now(),
            updated_at: Timestamp::now(),
            deleted_at: None,
        }
    }

    fn edge(source: EntityId, target: EntityId) -> Edge {
        Edge {
            id: EdgeId::new(),
            source_id: source,
            target_id: target,
            verb: Verb::RelatedTo,
            weight: 0.5,
            metadata: MetadataMap::new(),
            created_at: Timestamp::now(),
        }
    }

    #[test]
    fn test_entity_roundtrip() {
        let backend = MemoryBackend::new();
        let id = EntityId::new();
        backend.put_entity(&entity(id)).unwrap();

        let loaded = backend.get_entity(id).unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.vector, vec![1.0, 2.0]);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.sequence().unwrap(), 0);
        let s1 = backend.put_entity(&entity(EntityId::new())).unwrap();
        let s2 = backend.put_entity(&entity(EntityId::new())).unwrap();
        assert!(s2 > s1);
        assert_eq!(backend.sequence().unwrap(), s2);
    }

    #[test]
    fn test_edge_endpoint_indexes() {
        let backend = MemoryBackend::new();
        let a = EntityId::new();
        let b = EntityId::new();
        backend.put_entity(&entity(a)).unwrap();
        backend.put_entity(&entity(b)).unwrap();

        let e = edge(a, b);
        backend.put_edge(&e).unwrap();

        let out = backend.list_edges_by_source(a).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target_id, b);

        let inc = backend.list_edges_by_target(b).unwrap();
        assert_eq!(inc.len(), 1);

        assert!(backend.list_edges_by_source(b).unwrap().is_empty());

        backend.delete_edge(e.id).unwrap();
        assert!(backend.list_edges_by_source(a).unwrap().is_empty());
        assert!(backend.list_edges_by_target(b).unwrap().is_empty());
    }

    #[test]
    fn test_edge_re_put_does_not_duplicate() {
        let backend = MemoryBackend::new();
        let a = EntityId::new();
        let b = EntityId::new();
        let e = edge(a, b);
        backend.put_edge(&e).unwrap();
        backend.put_edge(&e).unwrap();
        assert_eq!(backend.list_edges_by_source(a).unwrap().len(), 1);
    }

    #[test]
    fn test_list_entity_ids_pagination() {
        let backend = MemoryBackend::new();
        let mut ids: Vec<EntityId> = (0..10).map(|_| EntityId::new()).collect();
        for id in &ids {
            backend.put_entity(&entity(*id)).unwrap();
        }
        ids.sort();

        let (page1, cursor) = backend.list_entity_ids(None, None, 4).unwrap();
        assert_eq!(page1, ids[..4]);
        let cursor = cursor.expect("more pages remain");

        let (page2, cursor) = backend.list_entity_ids(None, Some(cursor), 4).unwrap();
        assert_eq!(page2, ids[4..8]);

        let (page3, cursor) = backend.list_entity_ids(None, cursor, 4).unwrap();
        assert_eq!(page3, ids[8..]);
        assert!(cursor.is_none());
    }

    #[test]
    fn test_list_entity_ids_prefix() {
        let backend = MemoryBackend::new();
        let id = EntityId::new();
        backend.put_entity(&entity(id)).unwrap();

        let prefix = &id.to_string()[..8];
        let (ids, _) = backend.list_entity_ids(Some(prefix), None, 10).unwrap();
        assert_eq!(ids, vec![id]);

        let (ids, _) = backend.list_entity_ids(Some("zzzzzzzz"), None, 10).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_index_blob_roundtrip() {
        let backend = MemoryBackend::new();
        assert!(backend.get_index_blob("hnsw").unwrap().is_none());
        backend.put_index_blob("hnsw", vec![9, 8, 7]).unwrap();
        assert_eq!(backend.get_index_blob("hnsw").unwrap().unwrap(), vec![9, 8, 7]);
    }

    #[test]
    fn test_batch_is_atomic_under_lock() {
        let backend = MemoryBackend::new();
        let a = EntityId::new();
        let b = EntityId::new();

        let mut batch = WriteBatch::new();
        batch.put_entity(entity(a));
        batch.put_entity(entity(b));
        batch.put_edge(edge(a, b));
        let seq = backend.commit(batch).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(backend.entity_count(), 2);
        assert_eq!(backend.list_edges_by_source(a).unwrap().len(), 1);
        assert!(backend.atomic_batches());
    }
}
