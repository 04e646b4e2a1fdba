//! Vector index: approximate nearest-neighbor search over entity vectors.
//!
//! The in-crate [`HnswIndex`] is the primary implementation. The
//! [`VectorIndex`] trait is the seam for plugging an alternate ANN
//! structure by constructor injection; nothing discovers implementations
//! at runtime.
//!
//! Entity records in storage are the **source of truth**. The HNSW graph
//! is a derived, rebuildable structure: it is periodically snapshotted as
//! an opaque blob (see [`snapshot`]) and reconciled against the entity set
//! on open. A snapshot that fails validation triggers a full rebuild.

mod hnsw;
pub mod snapshot;

pub use hnsw::HnswIndex;

use crate::error::Result;
use crate::task::CancelToken;
use crate::types::{EntityId, Vector};

/// Approximate nearest-neighbor index over entity vectors.
///
/// Implementations must be `Send + Sync`: multiple concurrent searches
/// run without exclusive locking, and mutation methods take `&self`
/// (interior mutability).
pub trait VectorIndex: Send + Sync {
    /// Inserts a vector for an entity.
    ///
    /// Re-inserting an id that is already live is a no-op. Re-inserting a
    /// tombstoned id links a fresh node (the update path).
    fn insert(&self, id: EntityId, vector: &[f32]) -> Result<()>;

    /// Tombstones an entity's node. The vector stays in the graph for
    /// routing but is excluded from results. Returns true if the id was
    /// live.
    fn remove(&self, id: EntityId) -> Result<bool>;

    /// Searches for the k nearest live entities.
    ///
    /// `ef` overrides the configured search beam when `Some`. `filter`
    /// restricts results (not traversal) to accepted ids. Returns
    /// `(id, distance)` sorted ascending by distance.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        filter: Option<&(dyn Fn(EntityId) -> bool + Sync)>,
        token: &CancelToken,
    ) -> Result<Vec<(EntityId, f32)>>;

    /// Returns true if the id is present and live.
    fn contains(&self, id: EntityId) -> bool;

    /// Number of live (non-tombstoned) vectors.
    fn len(&self) -> usize;

    /// Returns true if the index has no live vectors.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the graph into an opaque snapshot blob.
    ///
    /// `sequence` is the storage commit sequence the snapshot is
    /// consistent with; recovery replays anything committed after it.
    fn snapshot(&self, sequence: u64) -> Vec<u8>;
}

/// A vector paired with its entity id, used by bulk rebuild.
pub type IdVector = (EntityId, Vector);
