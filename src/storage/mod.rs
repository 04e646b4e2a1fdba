//! Storage layer abstractions for NousDB.
//!
//! This module provides a trait-based abstraction over the storage backend,
//! allowing different implementations to be plugged in by constructor
//! injection (no subclass discovery).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Database                               │
//! │                          │                                   │
//! │                          ▼                                   │
//! │               ┌──────────────────────┐                       │
//! │               │   StorageBackend     │  ← Trait              │
//! │               └──────────────────────┘                       │
//! │                  ▲        ▲        ▲                         │
//! │          ┌───────┘        │        └─────────┐               │
//! │   ┌──────┴──────┐  ┌──────┴──────┐  ┌────────┴───────┐       │
//! │   │ RedbBackend │  │ FsBackend   │  │ MemoryBackend  │       │
//! │   └─────────────┘  └─────────────┘  └────────────────┘       │
//! │     (durable)       (sharded files)    (tests, caches)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All backends persist the same record bytes (see [`codec`]), carry a
//! monotonic commit sequence number for crash-recovery ordering, and
//! guarantee read-your-writes within the process. Backends that cannot
//! provide atomic batches say so through [`StorageBackend::atomic_batches`];
//! the registry compensates with write-ahead ordering.

pub mod codec;
pub mod fs;
pub mod memory;
pub mod redb;

pub use self::fs::FsBackend;
pub use self::memory::MemoryBackend;
pub use self::redb::RedbBackend;

use std::path::Path;

use crate::entity::{Edge, Entity};
use crate::error::Result;
use crate::types::{EdgeId, EntityId};

/// A group of writes applied with best-effort atomicity at commit.
///
/// Operations are applied in insertion order; a later op on the same key
/// wins. The batch is a plain value — dropping it without committing is
/// the abort path.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<BatchOp>,
}

/// A single operation inside a [`WriteBatch`].
#[derive(Debug)]
pub(crate) enum BatchOp {
    PutEntity(Entity),
    DeleteEntity(EntityId),
    PutEdge(Edge),
    DeleteEdge(EdgeId),
    PutBlob(String, Vec<u8>),
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages an entity write.
    pub fn put_entity(&mut self, entity: Entity) -> &mut Self {
        self.ops.push(BatchOp::PutEntity(entity));
        self
    }

    /// Stages an entity removal.
    pub fn delete_entity(&mut self, id: EntityId) -> &mut Self {
        self.ops.push(BatchOp::DeleteEntity(id));
        self
    }

    /// Stages an edge write.
    pub fn put_edge(&mut self, edge: Edge) -> &mut Self {
        self.ops.push(BatchOp::PutEdge(edge));
        self
    }

    /// Stages an edge removal.
    pub fn delete_edge(&mut self, id: EdgeId) -> &mut Self {
        self.ops.push(BatchOp::DeleteEdge(id));
        self
    }

    /// Stages an index blob write.
    pub fn put_index_blob(&mut self, name: impl Into<String>, bytes: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::PutBlob(name.into(), bytes));
        self
    }

    /// Returns the number of staged operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Storage backend trait for NousDB.
///
/// The core depends only on the capabilities enumerated here; no other
/// method is called. Implementations must be `Send + Sync` and provide:
///
/// - durable writes after [`commit`](Self::commit),
/// - read-your-writes within the same process,
/// - a monotonic sequence number on each commit.
///
/// A backend with only eventual consistency is not acceptable.
pub trait StorageBackend: Send + Sync {
    // =========================================================================
    // Reads
    // =========================================================================

    /// Retrieves an entity by id, including tombstoned ones.
    ///
    /// Returns `None` if no entity with the given id exists.
    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>>;

    /// Retrieves an edge by id.
    fn get_edge(&self, id: EdgeId) -> Result<Option<Edge>>;

    /// Lists entity ids in ascending order.
    ///
    /// `prefix` restricts to ids whose canonical string form starts with
    /// it. `cursor` is exclusive: listing resumes after the given id.
    /// Returns the page and, when more ids remain, the cursor to pass next.
    fn list_entity_ids(
        &self,
        prefix: Option<&str>,
        cursor: Option<EntityId>,
        limit: usize,
    ) -> Result<(Vec<EntityId>, Option<EntityId>)>;

    /// Lists all edges whose source is the given entity.
    fn list_edges_by_source(&self, id: EntityId) -> Result<Vec<Edge>>;

    /// Lists all edges whose target is the given entity.
    fn list_edges_by_target(&self, id: EntityId) -> Result<Vec<Edge>>;

    /// Retrieves an opaque index blob by name (e.g. the HNSW snapshot).
    fn get_index_blob(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Returns the sequence number of the most recent commit (0 if none).
    fn sequence(&self) -> Result<u64>;

    // =========================================================================
    // Writes
    // =========================================================================

    /// Applies a batch of writes and returns the new commit sequence.
    ///
    /// Implementations apply the ops in order. Atomicity is best-effort;
    /// see [`atomic_batches`](Self::atomic_batches).
    fn commit(&self, batch: WriteBatch) -> Result<u64>;

    /// Returns true when [`commit`](Self::commit) applies batches
    /// atomically. Backends returning false document the gap; the
    /// registry's write ordering compensates (source-of-truth record
    /// first, derived records after).
    fn atomic_batches(&self) -> bool {
        true
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Closes the backend, flushing pending writes.
    ///
    /// This method consumes the backend. After calling `close()`, the
    /// backend cannot be used.
    fn close(self: Box<Self>) -> Result<()>;

    /// Returns the backing path, if the backend has one.
    fn path(&self) -> Option<&Path>;
}

/// Convenience single-op writers, shared across backends.
///
/// Each helper opens, stages, and commits one batch.
pub trait StorageBackendExt: StorageBackend {
    /// Persists one entity.
    fn put_entity(&self, entity: &Entity) -> Result<u64> {
        let mut batch = WriteBatch::new();
        batch.put_entity(entity.clone());
        self.commit(batch)
    }

    /// Persists one edge.
    fn put_edge(&self, edge: &Edge) -> Result<u64> {
        let mut batch = WriteBatch::new();
        batch.put_edge(edge.clone());
        self.commit(batch)
    }

    /// Removes one entity. Returns true if it existed.
    fn delete_entity(&self, id: EntityId) -> Result<bool> {
        let existed = self.get_entity(id)?.is_some();
        if existed {
            let mut batch = WriteBatch::new();
            batch.delete_entity(id);
            self.commit(batch)?;
        }
        Ok(existed)
    }

    /// Removes one edge. Returns true if it existed.
    fn delete_edge(&self, id: EdgeId) -> Result<bool> {
        let existed = self.get_edge(id)?.is_some();
        if existed {
            let mut batch = WriteBatch::new();
            batch.delete_edge(id);
            self.commit(batch)?;
        }
        Ok(existed)
    }

    /// Persists one index blob.
    fn put_index_blob(&self, name: &str, bytes: Vec<u8>) -> Result<u64> {
        let mut batch = WriteBatch::new();
        batch.put_index_blob(name, bytes);
        self.commit(batch)
    }
}

impl<T: StorageBackend + ?Sized> StorageBackendExt for T {}
