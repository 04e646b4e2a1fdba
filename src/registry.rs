//! Entity registry: the only write path into the database.
//!
//! The registry owns entity and edge records and coordinates every write
//! across storage (C2), the vector index (C5), the metadata index (C3),
//! and the graph adjacency (C4) with crash-safe ordering:
//!
//! 1. stage the entity record in a storage batch (source of truth first),
//! 2. insert into the vector index,
//! 3. update the metadata indexes,
//! 4. stage edges and update adjacency,
//! 5. commit the batch — on failure, derived structures roll back in
//!    reverse order, so either the id is queryable afterwards or it is not.
//!
//! Writes to a single id are serialized by a striped per-id lock;
//! concurrent writes to different ids proceed in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, Metric};
use crate::entity::{
    validate_new_edge, validate_new_entity, DeleteOptions, Edge, Entity, EntityUpdate, NewEdge,
    NewEntity, DEFAULT_EDGE_WEIGHT,
};
use crate::error::{NousError, Result};
use crate::graph::AdjacencyGraph;
use crate::index::MetadataIndex;
use crate::storage::{StorageBackend, WriteBatch};
use crate::types::{EdgeId, EntityId, EntityKind, MetadataValue, Timestamp, Vector};
use crate::vector::{snapshot, HnswIndex, VectorIndex};

/// Number of stripes in the per-id write lock table.
const LOCK_STRIPES: usize = 64;

/// Reserved metadata field carrying the dedup fingerprint.
pub(crate) const FINGERPRINT_FIELD: &str = "_fingerprint";

/// Page size used when scanning storage at open.
const SCAN_PAGE: usize = 1024;

/// Outcome of a bulk add.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    /// Ids of the items that were persisted, in input order.
    pub successful: Vec<EntityId>,
    /// Per-item failures as `(input index, error)`.
    pub failed: Vec<(usize, NousError)>,
}

/// The registry: owner of all records and the write path.
pub struct Registry {
    storage: Box<dyn StorageBackend>,
    index: MetadataIndex,
    graph: AdjacencyGraph,
    /// Swapped wholesale by `compact()`; queries clone the Arc.
    vectors: RwLock<Arc<HnswIndex>>,
    fingerprints: RwLock<HashMap<String, EntityId>>,
    locks: Vec<Mutex<()>>,
    generation: AtomicU64,
    degraded: AtomicBool,
    index_build_time_ms: AtomicU64,
    dimension: usize,
    metric: Metric,
    config: Config,
}

impl Registry {
    /// Opens the registry over a storage backend, loading the snapshot
    /// and replaying post-snapshot commits, or rebuilding on corruption.
    #[instrument(skip(storage, config))]
    pub fn open(storage: Box<dyn StorageBackend>, config: &Config) -> Result<Self> {
        let started = Instant::now();
        let dimension = config.dim();
        let metric = config.metric;

        let registry = Self {
            storage,
            index: MetadataIndex::new(),
            graph: AdjacencyGraph::new(),
            vectors: RwLock::new(Arc::new(HnswIndex::new(
                dimension,
                metric,
                config.hnsw.clone(),
            ))),
            fingerprints: RwLock::new(HashMap::new()),
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            generation: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            index_build_time_ms: AtomicU64::new(0),
            dimension,
            metric,
            config: config.clone(),
        };

        registry.recover()?;
        registry
            .index_build_time_ms
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        registry
            .generation
            .store(registry.storage.sequence()?, Ordering::Release);

        info!(
            entities = registry.index.universe_len(),
            edges = registry.graph.edge_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Registry opened"
        );
        Ok(registry)
    }

    /// Rebuilds in-memory structures from storage, reusing the persisted
    /// HNSW snapshot when it validates.
    fn recover(&self) -> Result<()> {
        let mut live: Vec<(EntityId, Vector)> = Vec::new();
        let mut cursor = None;
        loop {
            let (ids, next) = self.storage.list_entity_ids(None, cursor, SCAN_PAGE)?;
            for id in &ids {
                let Some(entity) = self.storage.get_entity(*id)? else {
                    continue;
                };
                if entity.is_deleted() {
                    continue;
                }
                self.index.index_entity(&entity);
                if let Some(fp) = entity
                    .metadata
                    .get(FINGERPRINT_FIELD)
                    .and_then(MetadataValue::as_str)
                {
                    self.fingerprints
                        .write()
                        .insert(fp.to_string(), entity.id);
                }
                for edge in self.storage.list_edges_by_source(*id)? {
                    self.graph.add_edge(&edge);
                }
                live.push((entity.id, entity.vector));
            }
            cursor = next;
            if cursor.is_none() {
                break;
            }
        }
        self.index.refresh_stats();

        // Snapshot-plus-replay: load the persisted graph, then reconcile
        // against the entity set for commits after the snapshot sequence.
        let loaded = match self.storage.get_index_blob(snapshot::BLOB_NAME)? {
            Some(blob) => {
                match snapshot::decode(&blob, self.metric, &self.config.hnsw, |id| {
                    Ok(self.storage.get_entity(id)?.map(|e| e.vector))
                }) {
                    Ok(loaded) => Some(loaded),
                    Err(e) => {
                        warn!(error = %e, "HNSW snapshot failed validation, rebuilding from entity set (degraded startup)");
                        self.degraded.store(true, Ordering::Relaxed);
                        None
                    }
                }
            }
            None => None,
        };

        let index = match loaded {
            Some(loaded) => {
                let index = loaded.index;
                debug!(
                    snapshot_sequence = loaded.sequence,
                    "Loaded HNSW snapshot, replaying later commits"
                );
                for (id, vector) in &live {
                    if !index.contains(*id) {
                        index.insert(*id, vector)?;
                    }
                }
                // Entities removed after the snapshot: tombstone them.
                let live_ids: std::collections::HashSet<EntityId> =
                    live.iter().map(|(id, _)| *id).collect();
                let stale: Vec<EntityId> = {
                    let state = index.state.read();
                    state
                        .by_entity
                        .keys()
                        .filter(|id| !live_ids.contains(id))
                        .copied()
                        .collect()
                };
                for id in stale {
                    index.remove(id)?;
                }
                index
            }
            None => HnswIndex::rebuild(self.dimension, self.metric, self.config.hnsw.clone(), live)?,
        };
        *self.vectors.write() = Arc::new(index);
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The storage backend.
    pub fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    /// The metadata index.
    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    /// The graph adjacency layer.
    pub fn graph(&self) -> &AdjacencyGraph {
        &self.graph
    }

    /// A handle on the current vector index.
    pub fn vectors(&self) -> Arc<HnswIndex> {
        Arc::clone(&self.vectors.read())
    }

    /// The commit generation of the most recent write.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// True when the last open rebuilt indexes after a validation failure.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Milliseconds the last open spent building indexes.
    pub fn index_build_time_ms(&self) -> u64 {
        self.index_build_time_ms.load(Ordering::Relaxed)
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.index.universe_len()
    }

    /// Number of live edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn id_lock(&self, id: EntityId) -> &Mutex<()> {
        let mut hash = 0usize;
        for &b in id.as_bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(b as usize);
        }
        &self.locks[hash % LOCK_STRIPES]
    }

    fn bump_generation(&self, sequence: u64) {
        self.generation.fetch_max(sequence, Ordering::AcqRel);
    }

    // =========================================================================
    // Entity writes
    // =========================================================================

    /// Adds an entity with an already-resolved vector.
    ///
    /// Returns the existing id without inserting when the input carries a
    /// fingerprint that collides with a live entity.
    #[instrument(skip(self, input, vector))]
    pub fn add(&self, input: NewEntity, vector: Vector) -> Result<EntityId> {
        validate_new_entity(&input, self.dimension)?;
        if vector.len() != self.dimension {
            return Err(crate::error::ValidationError::dimension_mismatch(
                self.dimension,
                vector.len(),
            )
            .into());
        }

        if let Some(fp) = &input.content_fingerprint {
            if let Some(&existing) = self.fingerprints.read().get(fp) {
                debug!(id = %existing, "Fingerprint collision, returning existing entity");
                return Ok(existing);
            }
        }

        let now = Timestamp::now();
        let mut metadata = input.metadata;
        if let Some(fp) = &input.content_fingerprint {
            metadata.insert(FINGERPRINT_FIELD.to_string(), MetadataValue::from(fp.clone()));
        }
        let entity = Entity {
            id: EntityId::new(),
            vector,
            kind: input.kind.unwrap_or(EntityKind::Thing),
            data: input.data,
            metadata,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let id = entity.id;

        let _guard = self.id_lock(id).lock();

        // 1. Stage the record (source of truth).
        let mut batch = WriteBatch::new();
        batch.put_entity(entity.clone());

        // 2. Vector index. A failure here aborts before anything is
        //    visible; the staged batch is simply dropped.
        let vectors = self.vectors();
        vectors.insert(id, &entity.vector)?;

        // 3. Metadata indexes.
        self.index.index_entity(&entity);

        // 4. Commit; roll back derived structures in reverse on failure.
        match self.storage.commit(batch) {
            Ok(sequence) => {
                self.bump_generation(sequence);
                if let Some(fp) = &input.content_fingerprint {
                    self.fingerprints.write().insert(fp.clone(), id);
                }
                debug!(id = %id, "Entity added");
                Ok(id)
            }
            Err(e) => {
                self.index.unindex_entity(&entity);
                let _ = vectors.remove(id);
                Err(e)
            }
        }
    }

    /// Bulk add with per-item error reporting.
    ///
    /// Items are grouped into batches of `batch_size`; each batch is one
    /// storage commit. A failed item never blocks its batch siblings, and
    /// a failed commit fails (and rolls back) only its own batch.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub fn add_many(&self, items: Vec<(usize, NewEntity, Vector)>) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        let mut items = items;
        let batch_size = self.config.batch_size;
        for chunk in items.drain(..).collect::<Vec<_>>().chunks_mut(batch_size) {
            let mut batch = WriteBatch::new();
            let mut staged: Vec<(usize, Entity)> = Vec::with_capacity(chunk.len());
            let vectors = self.vectors();

            for (index, input, vector) in chunk.iter_mut() {
                let input = std::mem::take(input);
                let vector = std::mem::take(vector);
                match self.stage_one(input, vector, &mut batch, &vectors) {
                    Ok(entity) => staged.push((*index, entity)),
                    Err(e) => outcome.failed.push((*index, e)),
                }
            }

            if staged.is_empty() {
                continue;
            }
            match self.storage.commit(batch) {
                Ok(sequence) => {
                    self.bump_generation(sequence);
                    for (_, entity) in &staged {
                        if let Some(fp) = entity
                            .metadata
                            .get(FINGERPRINT_FIELD)
                            .and_then(MetadataValue::as_str)
                        {
                            self.fingerprints.write().insert(fp.to_string(), entity.id);
                        }
                        outcome.successful.push(entity.id);
                    }
                }
                Err(e) => {
                    for (index, entity) in staged {
                        self.index.unindex_entity(&entity);
                        let _ = vectors.remove(entity.id);
                        outcome
                            .failed
                            .push((index, NousError::internal(format!("batch commit failed: {}", e))));
                    }
                }
            }
        }
        outcome
    }

    /// Validates one bulk item, stages its record, and wires the derived
    /// structures. Storage remains untouched until the batch commits.
    fn stage_one(
        &self,
        input: NewEntity,
        vector: Vector,
        batch: &mut WriteBatch,
        vectors: &Arc<HnswIndex>,
    ) -> Result<Entity> {
        validate_new_entity(&input, self.dimension)?;
        if vector.len() != self.dimension {
            return Err(crate::error::ValidationError::dimension_mismatch(
                self.dimension,
                vector.len(),
            )
            .into());
        }
        if let Some(fp) = &input.content_fingerprint {
            if let Some(&existing) = self.fingerprints.read().get(fp) {
                return Err(NousError::AlreadyExists {
                    fingerprint: fp.clone(),
                    existing,
                });
            }
        }

        let now = Timestamp::now();
        let mut metadata = input.metadata;
        if let Some(fp) = &input.content_fingerprint {
            metadata.insert(FINGERPRINT_FIELD.to_string(), MetadataValue::from(fp.clone()));
        }
        let entity = Entity {
            id: EntityId::new(),
            vector,
            kind: input.kind.unwrap_or(EntityKind::Thing),
            data: input.data,
            metadata,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        batch.put_entity(entity.clone());
        vectors.insert(entity.id, &entity.vector)?;
        self.index.index_entity(&entity);
        Ok(entity)
    }

    /// Applies an update to an existing live entity.
    ///
    /// The caller resolves re-embedding: when `update.data` changed and no
    /// explicit vector is supplied, `new_vector` carries the re-embedded
    /// vector.
    #[instrument(skip(self, update, new_vector))]
    pub fn update(
        &self,
        id: EntityId,
        update: EntityUpdate,
        new_vector: Option<Vector>,
    ) -> Result<()> {
        crate::entity::validate_entity_update(&update, self.dimension)?;
        if let Some(v) = &new_vector {
            if v.len() != self.dimension {
                return Err(crate::error::ValidationError::dimension_mismatch(
                    self.dimension,
                    v.len(),
                )
                .into());
            }
        }

        let _guard = self.id_lock(id).lock();

        let old = self
            .storage
            .get_entity(id)?
            .filter(|e| !e.is_deleted())
            .ok_or(NousError::EntityNotFound(id))?;

        let mut updated = old.clone();
        if let Some(data) = update.data {
            updated.data = data;
        }
        if let Some(metadata) = update.metadata {
            updated.metadata = metadata;
            // The fingerprint rides in metadata; a replacement map keeps
            // the original mapping.
            if let Some(fp) = old.metadata.get(FINGERPRINT_FIELD) {
                updated
                    .metadata
                    .insert(FINGERPRINT_FIELD.to_string(), fp.clone());
            }
        }
        let vector_changed = new_vector.is_some();
        if let Some(vector) = new_vector {
            updated.vector = vector;
        }
        updated.updated_at = Timestamp::now();

        let mut batch = WriteBatch::new();
        batch.put_entity(updated.clone());

        let vectors = self.vectors();
        if vector_changed {
            // Remap the entity to a freshly linked node; the old node
            // stays tombstoned until compaction.
            vectors.remove(id)?;
            vectors.insert(id, &updated.vector)?;
        }

        self.index.unindex_entity(&old);
        self.index.index_entity(&updated);

        match self.storage.commit(batch) {
            Ok(sequence) => {
                self.bump_generation(sequence);
                debug!(id = %id, "Entity updated");
                Ok(())
            }
            Err(e) => {
                self.index.unindex_entity(&updated);
                self.index.index_entity(&old);
                if vector_changed {
                    let _ = vectors.remove(id);
                    let _ = vectors.insert(id, &old.vector);
                }
                Err(e)
            }
        }
    }

    /// Deletes an entity.
    ///
    /// Soft by default: the record is tombstoned, excluded from queries,
    /// and purged by `compact()`. Incident edges fail the call with
    /// `Conflict` unless `cascade` is set, in which case they are removed
    /// in the same batch.
    #[instrument(skip(self))]
    pub fn delete(&self, id: EntityId, opts: DeleteOptions) -> Result<()> {
        let _guard = self.id_lock(id).lock();

        let entity = self.storage.get_entity(id)?.ok_or(NousError::EntityNotFound(id))?;
        if entity.is_deleted() && !opts.hard {
            return Err(NousError::EntityNotFound(id));
        }

        let incident: Vec<Edge> = {
            let mut edges = self.storage.list_edges_by_source(id)?;
            edges.extend(self.storage.list_edges_by_target(id)?);
            edges.sort_by_key(|e| e.id);
            edges.dedup_by_key(|e| e.id);
            edges
        };
        if !incident.is_empty() && !opts.cascade {
            return Err(NousError::Conflict {
                id,
                edge_count: incident.len(),
            });
        }

        let mut batch = WriteBatch::new();
        for edge in &incident {
            batch.delete_edge(edge.id);
        }
        if opts.hard {
            batch.delete_entity(id);
        } else {
            let mut tombstoned = entity.clone();
            tombstoned.deleted_at = Some(Timestamp::now());
            batch.put_entity(tombstoned);
        }

        let vectors = self.vectors();
        let was_live = !entity.is_deleted();
        if was_live {
            vectors.remove(id)?;
            self.index.unindex_entity(&entity);
        }
        for edge in &incident {
            self.graph.remove_edge(edge);
        }

        match self.storage.commit(batch) {
            Ok(sequence) => {
                self.bump_generation(sequence);
                if let Some(fp) = entity
                    .metadata
                    .get(FINGERPRINT_FIELD)
                    .and_then(MetadataValue::as_str)
                {
                    self.fingerprints.write().remove(fp);
                }
                debug!(id = %id, hard = opts.hard, cascaded = incident.len(), "Entity deleted");
                Ok(())
            }
            Err(e) => {
                for edge in &incident {
                    self.graph.add_edge(edge);
                }
                if was_live {
                    self.index.index_entity(&entity);
                    let _ = vectors.insert(id, &entity.vector);
                }
                Err(e)
            }
        }
    }

    /// Reads an entity. Tombstoned records surface only with
    /// `include_deleted`.
    pub fn get(&self, id: EntityId, include_deleted: bool) -> Result<Option<Entity>> {
        let entity = self.storage.get_entity(id)?;
        Ok(entity.filter(|e| include_deleted || !e.is_deleted()))
    }

    // =========================================================================
    // Edge writes
    // =========================================================================

    /// Adds an edge between two existing live entities.
    #[instrument(skip(self, input))]
    pub fn add_edge(&self, input: NewEdge) -> Result<EdgeId> {
        validate_new_edge(&input)?;

        for endpoint in [input.source_id, input.target_id] {
            let live = self
                .storage
                .get_entity(endpoint)?
                .is_some_and(|e| !e.is_deleted());
            if !live {
                return Err(NousError::EntityNotFound(endpoint));
            }
        }

        let edge = Edge {
            id: EdgeId::new(),
            source_id: input.source_id,
            target_id: input.target_id,
            verb: input.verb,
            weight: input.weight.unwrap_or(DEFAULT_EDGE_WEIGHT),
            metadata: input.metadata,
            created_at: Timestamp::now(),
        };
        let id = edge.id;

        // Lock the lower endpoint stripe only; edges have no per-edge lock.
        let _guard = self
            .id_lock(input.source_id.min(input.target_id))
            .lock();

        let mut batch = WriteBatch::new();
        batch.put_edge(edge.clone());
        self.graph.add_edge(&edge);

        match self.storage.commit(batch) {
            Ok(sequence) => {
                self.bump_generation(sequence);
                debug!(id = %id, "Edge added");
                Ok(id)
            }
            Err(e) => {
                self.graph.remove_edge(&edge);
                Err(e)
            }
        }
    }

    /// Deletes an edge by id.
    #[instrument(skip(self))]
    pub fn delete_edge(&self, id: EdgeId) -> Result<()> {
        let edge = self.storage.get_edge(id)?.ok_or(NousError::EdgeNotFound(id))?;

        let _guard = self
            .id_lock(edge.source_id.min(edge.target_id))
            .lock();

        let mut batch = WriteBatch::new();
        batch.delete_edge(id);
        self.graph.remove_edge(&edge);

        match self.storage.commit(batch) {
            Ok(sequence) => {
                self.bump_generation(sequence);
                debug!(id = %id, "Edge deleted");
                Ok(())
            }
            Err(e) => {
                self.graph.add_edge(&edge);
                Err(e)
            }
        }
    }

    /// Reads an edge record.
    pub fn get_edge(&self, id: EdgeId) -> Result<Option<Edge>> {
        self.storage.get_edge(id)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Persists the current HNSW graph as a snapshot blob.
    #[instrument(skip(self))]
    pub fn snapshot_vectors(&self) -> Result<()> {
        let vectors = self.vectors();
        let blob = vectors.snapshot(self.generation());
        let mut batch = WriteBatch::new();
        batch.put_index_blob(snapshot::BLOB_NAME, blob);
        let sequence = self.storage.commit(batch)?;
        self.bump_generation(sequence);
        debug!("Vector snapshot persisted");
        Ok(())
    }

    /// Hard-removes tombstoned entities and rebuilds the vector index
    /// without its dead nodes. Returns the number of purged records.
    #[instrument(skip(self))]
    pub fn compact(&self) -> Result<usize> {
        // Collect tombstoned records and live vectors in one scan.
        let mut purged = Vec::new();
        let mut live: Vec<(EntityId, Vector)> = Vec::new();
        let mut cursor = None;
        loop {
            let (ids, next) = self.storage.list_entity_ids(None, cursor, SCAN_PAGE)?;
            for id in &ids {
                if let Some(entity) = self.storage.get_entity(*id)? {
                    if entity.is_deleted() {
                        purged.push(entity.id);
                    } else {
                        live.push((entity.id, entity.vector));
                    }
                }
            }
            cursor = next;
            if cursor.is_none() {
                break;
            }
        }

        let mut batch = WriteBatch::new();
        for id in &purged {
            batch.delete_entity(*id);
        }

        let rebuilt = HnswIndex::rebuild(
            self.dimension,
            self.metric,
            self.config.hnsw.clone(),
            live,
        )?;
        let blob = rebuilt.snapshot(self.generation());
        batch.put_index_blob(snapshot::BLOB_NAME, blob);

        let sequence = self.storage.commit(batch)?;
        self.bump_generation(sequence);
        *self.vectors.write() = Arc::new(rebuilt);

        // Writers racing the scan may have inserted into the old index;
        // fold any such entity into the rebuilt one.
        let rebuilt = self.vectors();
        for id in self.index.live_ids() {
            if !rebuilt.contains(id) {
                if let Some(entity) = self.storage.get_entity(id)? {
                    rebuilt.insert(id, &entity.vector)?;
                }
            }
        }
        self.index.refresh_stats();

        info!(purged = purged.len(), "Compaction complete");
        Ok(purged.len())
    }

    /// Flushes state and consumes the registry.
    pub fn close(self) -> Result<()> {
        self.snapshot_vectors()?;
        self.storage.close()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entities", &self.entity_count())
            .field("edges", &self.edge_count())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use crate::types::Verb;

    fn registry() -> Registry {
        let config = Config {
            dimension: crate::config::Dimension::Custom(4),
            ..Default::default()
        };
        Registry::open(Box::new(MemoryBackend::new()), &config).unwrap()
    }

    fn new_entity(seed: f32) -> NewEntity {
        NewEntity::vector(vec![seed, 0.0, 1.0, 0.5], EntityKind::Document)
    }

    #[test]
    fn test_add_makes_entity_visible_everywhere() {
        let r = registry();
        let id = r
            .add(
                new_entity(0.1).with_meta("category", "blog"),
                vec![0.1, 0.0, 1.0, 0.5],
            )
            .unwrap();

        assert!(r.get(id, false).unwrap().is_some());
        assert!(r.index().is_live(id));
        assert!(r.vectors().contains(id));
        assert_eq!(r.entity_count(), 1);
        assert!(r.generation() > 0);
    }

    #[test]
    fn test_add_rejects_wrong_dimension_without_state() {
        let r = registry();
        let err = r
            .add(new_entity(0.1), vec![0.1, 0.2])
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::DimensionMismatch);
        assert_eq!(r.entity_count(), 0);
        assert_eq!(r.storage.sequence().unwrap(), 0);
    }

    #[test]
    fn test_fingerprint_dedup_returns_existing() {
        let r = registry();
        let mut input = new_entity(0.2);
        input.content_fingerprint = Some("abc123".to_string());
        let first = r.add(input.clone(), vec![0.2, 0.0, 1.0, 0.5]).unwrap();
        let second = r.add(input, vec![0.2, 0.0, 1.0, 0.5]).unwrap();
        assert_eq!(first, second);
        assert_eq!(r.entity_count(), 1);
    }

    #[test]
    fn test_soft_delete_hides_but_keeps_record() {
        let r = registry();
        let id = r.add(new_entity(0.3), vec![0.3, 0.0, 1.0, 0.5]).unwrap();

        r.delete(id, DeleteOptions::soft()).unwrap();
        assert!(r.get(id, false).unwrap().is_none());
        let raw = r.get(id, true).unwrap().unwrap();
        assert!(raw.is_deleted());
        assert!(!r.index().is_live(id));
        assert!(!r.vectors().contains(id));
    }

    #[test]
    fn test_hard_delete_removes_record() {
        let r = registry();
        let id = r.add(new_entity(0.3), vec![0.3, 0.0, 1.0, 0.5]).unwrap();
        r.delete(
            id,
            DeleteOptions {
                hard: true,
                cascade: false,
            },
        )
        .unwrap();
        assert!(r.get(id, true).unwrap().is_none());
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let r = registry();
        let err = r.delete(EntityId::new(), DeleteOptions::soft()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_with_edges_conflicts_without_cascade() {
        let r = registry();
        let a = r.add(new_entity(0.1), vec![0.1, 0.0, 1.0, 0.5]).unwrap();
        let b = r.add(new_entity(0.2), vec![0.2, 0.0, 1.0, 0.5]).unwrap();
        r.add_edge(NewEdge::new(a, b, Verb::References)).unwrap();

        let err = r.delete(a, DeleteOptions::soft()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Conflict);
        assert!(r.index().is_live(a));

        // Cascade removes the edge in the same batch.
        r.delete(
            a,
            DeleteOptions {
                cascade: true,
                hard: false,
            },
        )
        .unwrap();
        assert_eq!(r.edge_count(), 0);
        assert!(r.storage.list_edges_by_target(b).unwrap().is_empty());
    }

    #[test]
    fn test_update_replaces_metadata_and_reindexes() {
        let r = registry();
        let id = r
            .add(
                new_entity(0.4).with_meta("category", "blog"),
                vec![0.4, 0.0, 1.0, 0.5],
            )
            .unwrap();

        let mut metadata = crate::types::MetadataMap::new();
        metadata.insert("category".into(), MetadataValue::from("news"));
        r.update(
            id,
            EntityUpdate {
                metadata: Some(metadata),
                ..Default::default()
            },
            None,
        )
        .unwrap();

        let token = crate::task::CancelToken::new();
        let news = r
            .index()
            .ids_for_filter(&crate::index::Filter::equals("category", "news"), &token)
            .unwrap();
        assert_eq!(news, vec![id]);
        let blog = r
            .index()
            .ids_for_filter(&crate::index::Filter::equals("category", "blog"), &token)
            .unwrap();
        assert!(blog.is_empty());

        let entity = r.get(id, false).unwrap().unwrap();
        assert!(entity.updated_at >= entity.created_at);
    }

    #[test]
    fn test_update_vector_remaps_search() {
        let r = registry();
        let id = r.add(new_entity(0.0), vec![1.0, 0.0, 0.0, 0.0]).unwrap();

        r.update(
            id,
            EntityUpdate {
                vector: Some(vec![0.0, 1.0, 0.0, 0.0]),
                ..Default::default()
            },
            Some(vec![0.0, 1.0, 0.0, 0.0]),
        )
        .unwrap();

        let token = crate::task::CancelToken::new();
        let hits = r
            .vectors()
            .search(&[0.0, 1.0, 0.0, 0.0], 1, None, None, &token)
            .unwrap();
        assert_eq!(hits[0].0, id);
        assert!(hits[0].1 < 1e-5);
    }

    #[test]
    fn test_update_missing_or_deleted_is_not_found() {
        let r = registry();
        let err = r
            .update(
                EntityId::new(),
                EntityUpdate {
                    data: Some("x".into()),
                    ..Default::default()
                },
                None,
            )
            .unwrap_err();
        assert!(err.is_not_found());

        let id = r.add(new_entity(0.5), vec![0.5, 0.0, 1.0, 0.5]).unwrap();
        r.delete(id, DeleteOptions::soft()).unwrap();
        let err = r
            .update(
                id,
                EntityUpdate {
                    data: Some("x".into()),
                    ..Default::default()
                },
                None,
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_add_edge_requires_live_endpoints() {
        let r = registry();
        let a = r.add(new_entity(0.1), vec![0.1, 0.0, 1.0, 0.5]).unwrap();

        let err = r
            .add_edge(NewEdge::new(a, EntityId::new(), Verb::Contains))
            .unwrap_err();
        assert!(err.is_not_found());

        let b = r.add(new_entity(0.2), vec![0.2, 0.0, 1.0, 0.5]).unwrap();
        r.delete(b, DeleteOptions::soft()).unwrap();
        let err = r.add_edge(NewEdge::new(a, b, Verb::Contains)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_edge_lifecycle() {
        let r = registry();
        let a = r.add(new_entity(0.1), vec![0.1, 0.0, 1.0, 0.5]).unwrap();
        let b = r.add(new_entity(0.2), vec![0.2, 0.0, 1.0, 0.5]).unwrap();

        let edge_id = r
            .add_edge(NewEdge::new(a, b, Verb::Precedes).with_weight(0.9))
            .unwrap();
        assert_eq!(r.edge_count(), 1);
        let edge = r.get_edge(edge_id).unwrap().unwrap();
        assert!((edge.weight - 0.9).abs() < f32::EPSILON);

        r.delete_edge(edge_id).unwrap();
        assert_eq!(r.edge_count(), 0);
        assert!(r.get_edge(edge_id).unwrap().is_none());
        assert!(r.delete_edge(edge_id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_add_many_reports_per_item_errors() {
        let r = registry();
        let items = vec![
            (0, new_entity(0.1), vec![0.1, 0.0, 1.0, 0.5]),
            (1, new_entity(0.2), vec![0.2, 0.0]), // wrong dimension
            (2, new_entity(0.3), vec![0.3, 0.0, 1.0, 0.5]),
        ];
        let outcome = r.add_many(items);
        assert_eq!(outcome.successful.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, 1);
        assert_eq!(r.entity_count(), 2);
    }

    #[test]
    fn test_compact_purges_tombstones() {
        let r = registry();
        let keep = r.add(new_entity(0.1), vec![0.1, 0.0, 1.0, 0.5]).unwrap();
        let drop_ = r.add(new_entity(0.2), vec![0.2, 0.0, 1.0, 0.5]).unwrap();
        r.delete(drop_, DeleteOptions::soft()).unwrap();

        assert_eq!(r.vectors().tombstone_count(), 1);
        let purged = r.compact().unwrap();
        assert_eq!(purged, 1);
        assert!(r.get(drop_, true).unwrap().is_none());
        assert!(r.get(keep, false).unwrap().is_some());
        assert_eq!(r.vectors().tombstone_count(), 0);
    }

    #[test]
    fn test_snapshot_persisted_as_blob() {
        let r = registry();
        let a = r.add(new_entity(0.1), vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        let b = r.add(new_entity(0.2), vec![0.0, 1.0, 0.0, 0.0]).unwrap();
        r.add_edge(NewEdge::new(a, b, Verb::RelatedTo)).unwrap();
        r.snapshot_vectors().unwrap();

        let blob = r
            .storage
            .get_index_blob(snapshot::BLOB_NAME)
            .unwrap()
            .expect("snapshot blob written");
        let loaded = snapshot::decode(&blob, Metric::Cosine, &r.config.hnsw, |id| {
            Ok(r.storage.get_entity(id).unwrap().map(|e| e.vector))
        })
        .unwrap();
        assert_eq!(loaded.index.len(), 2);
    }

    #[test]
    fn test_add_many_single_commit_per_batch() {
        let r = registry();
        let before = r.storage.sequence().unwrap();
        let items: Vec<(usize, NewEntity, Vector)> = (0..10)
            .map(|i| (i, new_entity(i as f32 * 0.1), vec![i as f32, 0.0, 1.0, 0.5]))
            .collect();
        let outcome = r.add_many(items);
        assert_eq!(outcome.successful.len(), 10);
        // Default batch_size is 100, so 10 items are one commit.
        assert_eq!(r.storage.sequence().unwrap(), before + 1);
    }
}
