//! redb storage backend.
//!
//! The durable primary backend, built on [redb](https://docs.rs/redb), a
//! pure Rust embedded key-value store with ACID transactions. Batches map
//! onto a single write transaction, so commits are truly atomic and the
//! commit sequence number advances inside the same transaction as the data.
//!
//! # Table Layout
//!
//! ```text
//! meta             &str      -> &[u8]   schema version, commit sequence
//! entities         [u8; 16]  -> &[u8]   binary entity records (codec)
//! edges            [u8; 16]  -> &[u8]   binary edge records (codec)
//! edges_by_source  [u8; 16] => [u8; 16] multimap endpoint index
//! edges_by_target  [u8; 16] => [u8; 16] multimap endpoint index
//! blobs            &str      -> &[u8]   opaque index blobs (HNSW snapshot)
//! ```

use std::path::{Path, PathBuf};

use ::redb::{
    Database, MultimapTableDefinition, ReadableTable, TableDefinition,
};
use tracing::{debug, info, instrument};

use super::{codec, BatchOp, StorageBackend, WriteBatch};
use crate::entity::{Edge, Entity};
use crate::error::{NousError, Result, StorageError};
use crate::types::{EdgeId, EntityId};

/// Current storage schema version.
///
/// Increment when making breaking changes to the table layout. The backend
/// refuses to open a database with a different version.
pub const SCHEMA_VERSION: u32 = 1;

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const ENTITIES_TABLE: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("entities");
const EDGES_TABLE: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("edges");
const EDGES_BY_SOURCE_TABLE: MultimapTableDefinition<&[u8; 16], &[u8; 16]> =
    MultimapTableDefinition::new("edges_by_source");
const EDGES_BY_TARGET_TABLE: MultimapTableDefinition<&[u8; 16], &[u8; 16]> =
    MultimapTableDefinition::new("edges_by_target");
const BLOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

const SCHEMA_KEY: &str = "schema_version";
const SEQUENCE_KEY: &str = "sequence";

/// Durable backend over a single redb file.
#[derive(Debug)]
pub struct RedbBackend {
    db: Database,
    path: PathBuf,
}

impl RedbBackend {
    /// Opens or creates a database file at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is corrupted, locked by another
    /// process, or carries a different schema version.
    #[instrument(fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let existed = path.exists();

        let db = Database::builder().create(path).map_err(|e| {
            if e.to_string().contains("locked") {
                StorageError::Locked
            } else {
                StorageError::Redb(e.to_string())
            }
        })?;

        let backend = Self {
            db,
            path: path.to_path_buf(),
        };

        if existed {
            backend.check_schema()?;
            debug!("Opened existing redb backend");
        } else {
            backend.initialize()?;
            info!(schema_version = SCHEMA_VERSION, "Initialized redb backend");
        }

        Ok(backend)
    }

    fn initialize(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut meta = txn.open_table(META_TABLE)?;
            meta.insert(SCHEMA_KEY, SCHEMA_VERSION.to_le_bytes().as_slice())?;
            meta.insert(SEQUENCE_KEY, 0u64.to_le_bytes().as_slice())?;
            // Create remaining tables up front so readers never race a
            // missing table.
            let _ = txn.open_table(ENTITIES_TABLE)?;
            let _ = txn.open_table(EDGES_TABLE)?;
            let _ = txn.open_multimap_table(EDGES_BY_SOURCE_TABLE)?;
            let _ = txn.open_multimap_table(EDGES_BY_TARGET_TABLE)?;
            let _ = txn.open_table(BLOBS_TABLE)?;
        }
        txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    fn check_schema(&self) -> Result<()> {
        let txn = self.db.begin_read().map_err(StorageError::from)?;
        let meta = txn
            .open_table(META_TABLE)
            .map_err(|e| StorageError::corrupted(format!("cannot open meta table: {}", e)))?;
        let found = meta
            .get(SCHEMA_KEY)
            .map_err(StorageError::from)?
            .ok_or_else(|| StorageError::corrupted("missing schema version"))?;
        let found = u32::from_le_bytes(
            found
                .value()
                .try_into()
                .map_err(|_| StorageError::corrupted("malformed schema version"))?,
        );
        if found != SCHEMA_VERSION {
            return Err(NousError::Storage(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found,
            }));
        }
        Ok(())
    }
}

impl StorageBackend for RedbBackend {
    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>> {
        let txn = self.db.begin_read().map_err(StorageError::from)?;
        let table = txn.open_table(ENTITIES_TABLE)?;
        match table.get(id.as_bytes()).map_err(StorageError::from)? {
            Some(bytes) => Ok(Some(codec::decode_entity(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn get_edge(&self, id: EdgeId) -> Result<Option<Edge>> {
        let txn = self.db.begin_read().map_err(StorageError::from)?;
        let table = txn.open_table(EDGES_TABLE)?;
        match table.get(id.as_bytes()).map_err(StorageError::from)? {
            Some(bytes) => Ok(Some(codec::decode_edge(bytes.value())?)),
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
        let txn = self.db.begin_read().map_err(StorageError::from)?;
        let table = txn.open_table(ENTITIES_TABLE)?;

        let mut ids = Vec::new();
        let iter = match cursor {
            Some(after) => table
                .range::<&[u8; 16]>(after.as_bytes()..)
                .map_err(StorageError::from)?,
            None => table.iter().map_err(StorageError::from)?,
        };
        for item in iter {
            let (key, _) = item.map_err(StorageError::from)?;
            let id = EntityId::from_bytes(*key.value());
            if Some(id) == cursor {
                continue;
            }
            if let Some(prefix) = prefix {
                if !id.to_string().starts_with(prefix) {
                    continue;
                }
            }
            if ids.len() == limit {
                let last = ids.last().copied();
                return Ok((ids, last));
            }
            ids.push(id);
        }
        Ok((ids, None))
    }

    fn list_edges_by_source(&self, id: EntityId) -> Result<Vec<Edge>> {
        self.list_edges_by_endpoint(id, EDGES_BY_SOURCE_TABLE)
    }

    fn list_edges_by_target(&self, id: EntityId) -> Result<Vec<Edge>> {
        self.list_edges_by_endpoint(id, EDGES_BY_TARGET_TABLE)
    }

    fn get_index_blob(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(StorageError::from)?;
        let table = txn.open_table(BLOBS_TABLE)?;
        Ok(table
            .get(name)
            .map_err(StorageError::from)?
            .map(|bytes| bytes.value().to_vec()))
    }

    fn sequence(&self) -> Result<u64> {
        let txn = self.db.begin_read().map_err(StorageError::from)?;
        let meta = txn.open_table(META_TABLE)?;
        let seq = meta
            .get(SEQUENCE_KEY)
            .map_err(StorageError::from)?
            .ok_or_else(|| StorageError::corrupted("missing commit sequence"))?;
        Ok(u64::from_le_bytes(
            seq.value()
                .try_into()
                .map_err(|_| StorageError::corrupted("malformed commit sequence"))?,
        ))
    }

    fn commit(&self, batch: WriteBatch) -> Result<u64> {
        let txn = self.db.begin_write().map_err(StorageError::from)?;
        let sequence;
        {
            let mut entities = txn.open_table(ENTITIES_TABLE)?;
            let mut edges = txn.open_table(EDGES_TABLE)?;
            let mut by_source = txn.open_multimap_table(EDGES_BY_SOURCE_TABLE)?;
            let mut by_target = txn.open_multimap_table(EDGES_BY_TARGET_TABLE)?;
            let mut blobs = txn.open_table(BLOBS_TABLE)?;

            for op in batch.ops {
                match op {
                    BatchOp::PutEntity(entity) => {
                        let bytes = codec::encode_entity(&entity);
                        entities.insert(entity.id.as_bytes(), bytes.as_slice())?;
                    }
                    BatchOp::DeleteEntity(id) => {
                        entities.remove(id.as_bytes())?;
                    }
                    BatchOp::PutEdge(edge) => {
                        let bytes = codec::encode_edge(&edge);
                        edges.insert(edge.id.as_bytes(), bytes.as_slice())?;
                        by_source.insert(edge.source_id.as_bytes(), edge.id.as_bytes())?;
                        by_target.insert(edge.target_id.as_bytes(), edge.id.as_bytes())?;
                    }
                    BatchOp::DeleteEdge(id) => {
                        // Need the endpoints to clean the multimap rows.
                        let existing = edges
                            .get(id.as_bytes())
                            .map_err(StorageError::from)?
                            .map(|bytes| codec::decode_edge(bytes.value()))
                            .transpose()?;
                        if let Some(edge) = existing {
                            edges.remove(id.as_bytes())?;
                            by_source.remove(edge.source_id.as_bytes(), id.as_bytes())?;
                            by_target.remove(edge.target_id.as_bytes(), id.as_bytes())?;
                        }
                    }
                    BatchOp::PutBlob(name, bytes) => {
                        blobs.insert(name.as_str(), bytes.as_slice())?;
                    }
                }
            }

            let mut meta = txn.open_table(META_TABLE)?;
            let current = meta
                .get(SEQUENCE_KEY)
                .map_err(StorageError::from)?
                .map(|s| {
                    s.value()
                        .try_into()
                        .map(u64::from_le_bytes)
                        .unwrap_or_default()
                })
                .unwrap_or(0);
            sequence = current + 1;
            meta.insert(SEQUENCE_KEY, sequence.to_le_bytes().as_slice())?;
        }
        txn.commit().map_err(StorageError::from)?;
        Ok(sequence)
    }

    #[instrument(skip(self))]
    fn close(self: Box<Self>) -> Result<()> {
        // redb flushes durably on drop.
        drop(self.db);
        debug!("redb backend closed");
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

impl RedbBackend {
    fn list_edges_by_endpoint(
        &self,
        id: EntityId,
        table_def: MultimapTableDefinition<'static, &'static [u8; 16], &'static [u8; 16]>,
    ) -> Result<Vec<Edge>> {
        let txn = self.db.begin_read().map_err(StorageError::from)?;
        let index = txn.open_multimap_table(table_def)?;
        let edges_table = txn.open_table(EDGES_TABLE)?;

        let mut edges = Vec::new();
        for entry in index.get(id.as_bytes()).map_err(StorageError::from)? {
            let edge_id = entry.map_err(StorageError::from)?;
            if let Some(bytes) = edges_table
                .get(edge_id.value())
                .map_err(StorageError::from)?
            {
                edges.push(codec::decode_edge(bytes.value())?);
            }
        }
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageBackendExt;
    use crate::types::{EntityKind, MetadataMap, Timestamp, Verb};
    use tempfile::tempdir;

    fn entity(id: EntityId) -> Entity {
        Entity {
            id,
            vector: vec![0.1, 0.2, 0.3],
            kind: EntityKind::Document,
            data: "doc".into(),
            metadata: MetadataMap::new(),
            created_at: Timestamp::now(),
            updated_at: Timestamp::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn test_open_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nous.db");
        assert!(!path.exists());

        let backend = RedbBackend::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(backend.sequence().unwrap(), 0);
        Box::new(backend).close().unwrap();
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nous.db");
        let id = EntityId::new();

        let backend = RedbBackend::open(&path).unwrap();
        let seq = backend.put_entity(&entity(id)).unwrap();
        assert_eq!(seq, 1);
        Box::new(backend).close().unwrap();

        let backend = RedbBackend::open(&path).unwrap();
        assert_eq!(backend.sequence().unwrap(), 1);
        let loaded = backend.get_entity(id).unwrap().unwrap();
        assert_eq!(loaded.id, id);
        Box::new(backend).close().unwrap();
    }

    #[test]
    fn test_edge_indexes_atomic_with_record() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::open(dir.path().join("nous.db")).unwrap();

        let a = EntityId::new();
        let b = EntityId::new();
        let edge = Edge {
            id: EdgeId::new(),
            source_id: a,
            target_id: b,
            verb: Verb::Precedes,
            weight: 0.4,
            metadata: MetadataMap::new(),
            created_at: Timestamp::now(),
        };

        let mut batch = WriteBatch::new();
        batch.put_entity(entity(a));
        batch.put_entity(entity(b));
        batch.put_edge(edge.clone());
        backend.commit(batch).unwrap();

        assert_eq!(backend.list_edges_by_source(a).unwrap().len(), 1);
        assert_eq!(backend.list_edges_by_target(b).unwrap().len(), 1);

        backend.delete_edge(edge.id).unwrap();
        assert!(backend.list_edges_by_source(a).unwrap().is_empty());
        assert!(backend.list_edges_by_target(b).unwrap().is_empty());
        assert!(backend.get_edge(edge.id).unwrap().is_none());
    }

    #[test]
    fn test_list_entity_ids_ordered_pages() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::open(dir.path().join("nous.db")).unwrap();

        let mut ids: Vec<EntityId> = (0..7).map(|_| EntityId::new()).collect();
        for id in &ids {
            backend.put_entity(&entity(*id)).unwrap();
        }
        ids.sort();

        let (page1, cursor) = backend.list_entity_ids(None, None, 3).unwrap();
        assert_eq!(page1, ids[..3]);
        let (page2, cursor) = backend.list_entity_ids(None, cursor, 3).unwrap();
        assert_eq!(page2, ids[3..6]);
        let (page3, cursor) = backend.list_entity_ids(None, cursor, 3).unwrap();
        assert_eq!(page3, ids[6..]);
        assert!(cursor.is_none());
    }

    #[test]
    fn test_blob_roundtrip() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::open(dir.path().join("nous.db")).unwrap();
        backend.put_index_blob("hnsw", vec![1, 2, 3]).unwrap();
        assert_eq!(
            backend.get_index_blob("hnsw").unwrap().unwrap(),
            vec![1, 2, 3]
        );
        assert!(backend.get_index_blob("missing").unwrap().is_none());
    }

    #[test]
    fn test_atomic_batches_reported() {
        let dir = tempdir().unwrap();
        let backend = RedbBackend::open(dir.path().join("nous.db")).unwrap();
        assert!(backend.atomic_batches());
    }
}
