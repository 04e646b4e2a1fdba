//! # NousDB
//!
//! Embeddable multi-modal knowledge database: one collection of typed
//! entities ("nouns") connected by weighted edges ("verbs"), queryable by
//! vector similarity, graph traversal, and metadata predicates — in a
//! single query, with a fused ranking.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nousdb::{Config, Database, EntityKind, Filter, FindQuery, NewEntity, Similar};
//!
//! // Open or create a database
//! let db = Database::open("./nous.db", Config::default())?;
//!
//! // Store entities (pre-embedded here; plug an Embedder for text)
//! let id = db.add_entity(
//!     NewEntity::vector(embedding, EntityKind::Document)
//!         .with_meta("category", "blog")
//!         .with_meta("year", 2024i64),
//! )?;
//!
//! // Mix all three signals in one query
//! let results = db.find(FindQuery {
//!     similar: Some(Similar::vector(query_vec)),
//!     where_: Some(Filter::equals("category", "blog")),
//!     connected: Some(Connected::from(id).with_depth(2)),
//!     limit: 10,
//!     ..Default::default()
//! })?;
//!
//! // Clean up
//! db.close()?;
//! ```
//!
//! ## Key Concepts
//!
//! ### Entity ("noun")
//!
//! The primary stored object: a fixed-dimension vector, a kind from a
//! closed enumeration, and free-form metadata. Soft-deleted entities are
//! tombstoned and invisible to queries until [`Database::compact`] purges
//! them.
//!
//! ### Edge ("verb")
//!
//! A directed, typed, weighted relationship between two entities. Edges
//! are never mutated in place; re-weighting is a delete-and-add.
//!
//! ### Signals and fusion
//!
//! A [`FindQuery`] carries up to three signals. Single-signal queries
//! route directly to the owning component; multi-signal queries are
//! planned by estimated selectivity and combined with Reciprocal Rank
//! Fusion (weighted-linear is available per query).
//!
//! ## Thread Safety
//!
//! `Database` is `Send + Sync` and can be shared across threads using
//! `Arc`. Reads are concurrent; writes to one id are serialized by a
//! per-id lock. [`DbHandle`] adds an async surface that dispatches to a
//! worker pool and never blocks the caller's thread.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

// ============================================================================
// Module declarations
// ============================================================================

mod config;
mod db;
mod distance;
mod entity;
mod error;
mod handle;
mod registry;
mod task;
mod types;

pub mod embed;
pub mod graph;
pub mod index;
pub mod query;
pub mod storage;
pub mod vector;

// ============================================================================
// Public API re-exports
// ============================================================================

// Main database interface
pub use db::{Database, DatabaseStats};
pub use handle::DbHandle;

// Configuration
pub use config::{Config, Dimension, FusionConfig, HnswConfig, Metric};

// Error handling
pub use error::{ErrorCode, NousError, QueryError, Result, StorageError, ValidationError};

// Core types
pub use types::{
    Direction, EdgeId, EntityId, EntityKind, MetadataMap, MetadataValue, Timestamp, Vector, Verb,
};

// Data model
pub use entity::{
    DeleteOptions, Edge, Entity, EntityUpdate, NewEdge, NewEntity, DEFAULT_EDGE_WEIGHT,
};

// Distance kernel
pub use distance::distance;

// Filtering
pub use index::{Filter, Leaf, Op};

// Graph
pub use graph::{Neighbor, Visit};

// Query surface
pub use query::{Boost, Connected, FindQuery, FindResults, FusionMode, Match, Similar};

// Embedding
pub use embed::{CachedEmbedder, Embedder, ExternalEmbedder};

// Cancellation
pub use task::CancelToken;

// Bulk results
pub use registry::BulkOutcome;

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common NousDB usage.
///
/// ```rust
/// use nousdb::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{Config, Dimension, Metric};
    pub use crate::db::Database;
    pub use crate::entity::{DeleteOptions, NewEdge, NewEntity};
    pub use crate::error::{NousError, Result};
    pub use crate::index::Filter;
    pub use crate::query::{Connected, FindQuery, Similar};
    pub use crate::types::{Direction, EntityId, EntityKind, MetadataValue, Verb};
}
