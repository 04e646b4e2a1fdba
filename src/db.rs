//! NousDB main struct and lifecycle operations.
//!
//! The [`Database`] struct is the primary interface for interacting with
//! the database. It provides methods for:
//!
//! - Opening and closing the database
//! - Adding, updating, and deleting entities and edges
//! - Multi-signal queries (`find`), pure KNN (`search`), and graph
//!   neighborhood lookups (`neighbors`)
//! - Administration (`stats`, `compact`)
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use nousdb::{Database, Config, EntityKind, NewEntity};
//!
//! // Open or create a database
//! let db = Database::open("./nous.db", Config::default())?;
//!
//! // Store a pre-embedded entity
//! let id = db.add_entity(
//!     NewEntity::vector(embedding, EntityKind::Document)
//!         .with_meta("category", "blog"),
//! )?;
//!
//! // Query by similarity + metadata
//! let results = db.find(FindQuery {
//!     similar: Some(Similar::vector(query_vec)),
//!     where_: Some(Filter::equals("category", "blog")),
//!     ..Default::default()
//! })?;
//!
//! // Close when done
//! db.close()?;
//! ```
//!
//! # Thread Safety
//!
//! `Database` is `Send + Sync` and can be shared across threads using
//! `Arc`. Reads run concurrently; writes to a single id are serialized by
//! a per-id lock while writes to different ids proceed in parallel. For an
//! async surface that never blocks the caller's thread, wrap the database
//! in a [`DbHandle`](crate::handle::DbHandle).

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::{Config, Metric};
use crate::embed::{CachedEmbedder, Embedder, ExternalEmbedder};
use crate::entity::{DeleteOptions, Edge, Entity, EntityUpdate, NewEdge, NewEntity};
use crate::error::{NousError, Result, ValidationError};
use crate::graph::Visit;
use crate::query::exec::Engine;
use crate::query::plan::Planner;
use crate::query::{FindQuery, FindResults};
use crate::registry::{BulkOutcome, Registry};
use crate::storage::{MemoryBackend, RedbBackend, StorageBackend, StorageBackendExt};
use crate::task::CancelToken;
use crate::types::{Direction, EdgeId, EntityId, EntityKind, MetadataMap, Timestamp, Vector};
use crate::vector::VectorIndex;

/// Blob name of the human-readable database manifest.
const MANIFEST_BLOB: &str = "manifest";

/// Manifest format version.
const MANIFEST_VERSION: u32 = 1;

/// Database-level facts persisted at creation and validated on reopen.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    dimension: usize,
    metric: Metric,
    created_at: Timestamp,
    last_opened_at: Timestamp,
}

/// Counters surfaced by [`Database::stats`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Live entities (tombstoned excluded).
    pub entity_count: usize,
    /// Live edges.
    pub edge_count: usize,
    /// Configured vector dimension.
    pub dimension: usize,
    /// Milliseconds the last open spent building indexes.
    pub index_build_time_ms: u64,
    /// Tombstoned vector nodes awaiting `compact()`.
    pub tombstone_count: usize,
    /// Commit generation of the most recent write.
    pub generation: u64,
    /// True when the last open had to rebuild indexes after a snapshot
    /// validation failure.
    pub degraded: bool,
}

/// The main NousDB database handle.
///
/// Create an instance with [`Database::open()`] (or
/// [`Database::open_with()`] for injected collaborators) and close it with
/// [`Database::close()`], which consumes the handle.
pub struct Database {
    registry: Registry,
    planner: Planner,
    embedder: CachedEmbedder,
    config: Config,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dimension", &self.config.dim())
            .field("metric", &self.config.metric)
            .field("entities", &self.registry.entity_count())
            .field("edges", &self.registry.edge_count())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens or creates a database file at the given path, backed by the
    /// durable redb backend and fed pre-computed vectors.
    ///
    /// Idempotent: reopening a populated database loads the persisted
    /// snapshot and replays post-snapshot commits.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the file is
    /// corrupted or locked, or the stored dimension/metric disagree with
    /// the configuration.
    #[instrument(skip(config), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let backend = RedbBackend::open(path)?;
        let embedder = Box::new(ExternalEmbedder::new(config.dim()));
        Self::open_with(config, Box::new(backend), embedder)
    }

    /// Opens an ephemeral in-memory database. Used for tests and caches.
    pub fn in_memory(config: Config) -> Result<Self> {
        let embedder = Box::new(ExternalEmbedder::new(config.dim()));
        Self::open_with(config, Box::new(MemoryBackend::new()), embedder)
    }

    /// Opens a database over injected collaborators.
    ///
    /// This is the constructor-injection seam: alternate storage backends
    /// and embedding models plug in here, never by subclass discovery.
    #[instrument(skip_all)]
    pub fn open_with(
        config: Config,
        backend: Box<dyn StorageBackend>,
        embedder: Box<dyn Embedder>,
    ) -> Result<Self> {
        config.validate().map_err(NousError::from)?;
        if embedder.dimension() != config.dim() {
            return Err(ValidationError::dimension_mismatch(
                config.dim(),
                embedder.dimension(),
            )
            .into());
        }

        Self::check_manifest(backend.as_ref(), &config)?;

        let planner = Planner::new(config.plan_cache_size);
        let embedder = CachedEmbedder::new(embedder, config.embed_cache_size);
        let registry = Registry::open(backend, &config)?;

        info!(
            dimension = config.dim(),
            metric = ?config.metric,
            entities = registry.entity_count(),
            "Database opened"
        );

        Ok(Self {
            registry,
            planner,
            embedder,
            config,
        })
    }

    /// Validates or initializes the persisted manifest.
    fn check_manifest(backend: &dyn StorageBackend, config: &Config) -> Result<()> {
        let existing = backend
            .get_index_blob(MANIFEST_BLOB)?
            .map(|bytes| {
                serde_json::from_slice::<Manifest>(&bytes).map_err(|e| {
                    crate::error::StorageError::corrupted(format!("invalid manifest: {}", e))
                })
            })
            .transpose()?;

        let manifest = match existing {
            Some(mut manifest) => {
                if manifest.dimension != config.dim() {
                    return Err(ValidationError::dimension_mismatch(
                        manifest.dimension,
                        config.dim(),
                    )
                    .into());
                }
                if manifest.metric != config.metric {
                    return Err(NousError::config(format!(
                        "metric mismatch: database created with {:?}, configured {:?}",
                        manifest.metric, config.metric
                    )));
                }
                manifest.last_opened_at = Timestamp::now();
                manifest
            }
            None => {
                let now = Timestamp::now();
                Manifest {
                    format_version: MANIFEST_VERSION,
                    dimension: config.dim(),
                    metric: config.metric,
                    created_at: now,
                    last_opened_at: now,
                }
            }
        };

        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| NousError::internal(format!("manifest encode failed: {}", e)))?;
        backend.put_index_blob(MANIFEST_BLOB, bytes)?;
        Ok(())
    }

    /// Closes the database: snapshots the vector index, flushes pending
    /// writes, and releases resources. Consumes the handle.
    #[instrument(skip(self))]
    pub fn close(self) -> Result<()> {
        info!("Closing database");
        self.registry.close()
    }

    /// Returns a reference to the configuration the database was opened
    /// with.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the vector dimension.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.config.dim()
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Adds an entity from text, embedding it through the configured
    /// embedder.
    pub fn add(&self, data: impl Into<String>, kind: EntityKind, metadata: MetadataMap) -> Result<EntityId> {
        self.add_entity(NewEntity {
            data: data.into(),
            kind: Some(kind),
            vector: None,
            metadata,
            content_fingerprint: None,
        })
    }

    /// Adds an entity from a pre-computed vector, bypassing embedding.
    pub fn add_vector(
        &self,
        vector: Vector,
        kind: EntityKind,
        metadata: MetadataMap,
    ) -> Result<EntityId> {
        self.add_entity(NewEntity {
            data: String::new(),
            kind: Some(kind),
            vector: Some(vector),
            metadata,
            content_fingerprint: None,
        })
    }

    /// Adds an entity, resolving its vector from the input.
    pub fn add_entity(&self, input: NewEntity) -> Result<EntityId> {
        let vector = self.resolve_vector(&input)?;
        self.registry.add(input, vector)
    }

    /// Bulk add with per-item error reporting.
    ///
    /// With `parallel`, embedding runs on a small worker pool feeding a
    /// bounded queue (capacity `write_queue_capacity`), so an ingest burst
    /// cannot grow memory without bound. Successful items remain persisted
    /// when siblings fail.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub fn add_many(&self, items: Vec<NewEntity>, parallel: bool) -> BulkOutcome {
        let mut resolved: Vec<(usize, NewEntity, Vector)> = Vec::with_capacity(items.len());
        let mut outcome = BulkOutcome::default();

        if parallel {
            let workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .min(8);
            let (tx, rx) = crossbeam_channel::bounded(self.config.write_queue_capacity);

            let chunk_size = items.len().div_ceil(workers).max(1);
            let indexed: Vec<(usize, NewEntity)> = items.into_iter().enumerate().collect();
            std::thread::scope(|scope| {
                for chunk in indexed.chunks(chunk_size) {
                    let tx = tx.clone();
                    scope.spawn(move || {
                        for (index, input) in chunk {
                            let vector = self.resolve_vector(input);
                            // Receiver outlives all senders; a send only
                            // fails if the scope is unwinding already.
                            if tx.send((*index, input.clone(), vector)).is_err() {
                                break;
                            }
                        }
                    });
                }
                drop(tx);
                for (index, input, vector) in rx {
                    match vector {
                        Ok(vector) => resolved.push((index, input, vector)),
                        Err(e) => outcome.failed.push((index, e)),
                    }
                }
            });
            resolved.sort_by_key(|(index, _, _)| *index);
        } else {
            for (index, input) in items.into_iter().enumerate() {
                match self.resolve_vector(&input) {
                    Ok(vector) => resolved.push((index, input, vector)),
                    Err(e) => outcome.failed.push((index, e)),
                }
            }
        }

        let mut bulk = self.registry.add_many(resolved);
        outcome.successful.append(&mut bulk.successful);
        outcome.failed.append(&mut bulk.failed);
        outcome.failed.sort_by_key(|(index, _)| *index);
        outcome
    }

    /// Retrieves an entity by id.
    ///
    /// Tombstoned entities return `None` unless `include_deleted` is set.
    pub fn get(&self, id: EntityId, include_deleted: bool) -> Result<Option<Entity>> {
        self.registry.get(id, include_deleted)
    }

    /// Updates an entity. The vector is re-embedded iff `data` changed
    /// and no explicit replacement vector was supplied.
    pub fn update(&self, id: EntityId, update: EntityUpdate) -> Result<()> {
        let new_vector = match (&update.vector, &update.data) {
            (Some(vector), _) => Some(vector.clone()),
            (None, Some(data)) => Some(self.embedder.embed(data)?),
            (None, None) => None,
        };
        self.registry.update(id, update, new_vector)
    }

    /// Deletes an entity (soft by default; see [`DeleteOptions`]).
    pub fn delete(&self, id: EntityId, opts: DeleteOptions) -> Result<()> {
        self.registry.delete(id, opts)
    }

    /// Adds an edge between two existing entities.
    pub fn add_edge(&self, edge: NewEdge) -> Result<EdgeId> {
        self.registry.add_edge(edge)
    }

    /// Deletes an edge by id.
    pub fn delete_edge(&self, id: EdgeId) -> Result<()> {
        self.registry.delete_edge(id)
    }

    /// Retrieves an edge record by id.
    pub fn get_edge(&self, id: EdgeId) -> Result<Option<Edge>> {
        self.registry.get_edge(id)
    }

    // =========================================================================
    // Query
    // =========================================================================

    /// Runs a multi-signal query.
    pub fn find(&self, query: FindQuery) -> Result<FindResults> {
        self.find_with_token(query, CancelToken::new())
    }

    /// Runs a multi-signal query under a caller-supplied cancellation
    /// token. The query's deadline (or the configured default time
    /// budget) arms the token.
    pub fn find_with_token(&self, query: FindQuery, token: CancelToken) -> Result<FindResults> {
        // A zero page needs no search, no embedding, no plan.
        if query.limit == 0 {
            return Ok(FindResults {
                matches: Vec::new(),
                partial: false,
                generation: self.registry.generation(),
            });
        }

        let token = match query.deadline.or(self.config.default_time_budget) {
            Some(budget) => token.with_deadline(budget),
            None => token,
        };

        let query_vector = match &query.similar {
            Some(similar) => Some(self.resolve_similar(similar)?),
            None => None,
        };

        let vectors = self.registry.vectors();
        let engine = Engine {
            config: &self.config,
            storage: self.registry.storage(),
            index: self.registry.index(),
            graph: self.registry.graph(),
            vectors: vectors.as_ref(),
            planner: &self.planner,
            generation: self.registry.generation(),
        };
        engine.run(&query, query_vector.as_ref(), &token)
    }

    /// Pure vector KNN shortcut: the k nearest live entities to a vector.
    pub fn search(&self, vector: &[f32], k: usize) -> Result<Vec<(EntityId, f32)>> {
        self.registry
            .vectors()
            .search(vector, k, None, None, &CancelToken::new())
    }

    /// Pure KNN over an embedded text.
    pub fn search_text(&self, text: &str, k: usize) -> Result<Vec<(EntityId, f32)>> {
        let vector = self.embedder.embed(text)?;
        self.search(&vector, k)
    }

    /// Graph neighborhood lookup: entities reachable from `id` within
    /// `depth` hops (default 2, cap 16), with decayed path weights.
    pub fn neighbors(
        &self,
        id: EntityId,
        direction: Direction,
        depth: Option<usize>,
    ) -> Result<Vec<Visit>> {
        let visits = self.registry.graph().traverse(
            &[id],
            direction,
            depth,
            None,
            self.config.graph_decay,
            &CancelToken::new(),
        )?;
        Ok(visits.into_iter().filter(|v| v.id != id).collect())
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Returns database counters.
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            entity_count: self.registry.entity_count(),
            edge_count: self.registry.edge_count(),
            dimension: self.config.dim(),
            index_build_time_ms: self.registry.index_build_time_ms(),
            tombstone_count: self.registry.vectors().tombstone_count(),
            generation: self.registry.generation(),
            degraded: self.registry.is_degraded(),
        }
    }

    /// Hard-removes tombstoned entities and rebuilds affected indexes.
    /// Returns the number of purged records.
    pub fn compact(&self) -> Result<usize> {
        self.registry.compact()
    }

    /// Persists a vector-index snapshot without closing.
    pub fn snapshot(&self) -> Result<()> {
        self.registry.snapshot_vectors()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn resolve_vector(&self, input: &NewEntity) -> Result<Vector> {
        match &input.vector {
            Some(vector) => Ok(vector.clone()),
            None if input.data.is_empty() => {
                Err(ValidationError::required_field("data").into())
            }
            None => self.embedder.embed(&input.data),
        }
    }

    fn resolve_similar(&self, similar: &crate::query::Similar) -> Result<Vector> {
        match (&similar.vector, &similar.text) {
            (Some(vector), _) => {
                if vector.len() != self.config.dim() {
                    return Err(ValidationError::dimension_mismatch(
                        self.config.dim(),
                        vector.len(),
                    )
                    .into());
                }
                Ok(vector.clone())
            }
            (None, Some(text)) => self.embedder.embed(text),
            (None, None) => {
                Err(ValidationError::required_field("similar.vector or similar.text").into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dimension;
    use crate::query::Similar;
    use tempfile::tempdir;

    fn config4() -> Config {
        Config {
            dimension: Dimension::Custom(4),
            ..Default::default()
        }
    }

    #[test]
    fn test_open_creates_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nous.db");
        let db = Database::open(&path, config4()).unwrap();
        assert!(path.exists());
        assert_eq!(db.dimension(), 4);
        db.close().unwrap();
    }

    #[test]
    fn test_reopen_with_other_dimension_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nous.db");
        Database::open(&path, config4()).unwrap().close().unwrap();

        let result = Database::open(
            &path,
            Config {
                dimension: Dimension::Custom(8),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_reopen_with_other_metric_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nous.db");
        Database::open(&path, config4()).unwrap().close().unwrap();

        let result = Database::open(
            &path,
            Config {
                metric: Metric::Euclidean,
                ..config4()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_add_without_embedder_requires_vector() {
        let db = Database::in_memory(config4()).unwrap();
        let err = db
            .add("some text", EntityKind::Document, MetadataMap::new())
            .unwrap_err();
        assert!(matches!(err, NousError::Embedding(_)));

        let id = db
            .add_vector(vec![1.0, 0.0, 0.0, 0.0], EntityKind::Document, MetadataMap::new())
            .unwrap();
        assert!(db.get(id, false).unwrap().is_some());
    }

    #[test]
    fn test_search_shortcut() {
        let db = Database::in_memory(config4()).unwrap();
        let id = db
            .add_vector(vec![1.0, 0.0, 0.0, 0.0], EntityKind::Thing, MetadataMap::new())
            .unwrap();
        let hits = db.search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].0, id);
    }

    #[test]
    fn test_find_similar_dimension_checked() {
        let db = Database::in_memory(config4()).unwrap();
        let err = db
            .find(FindQuery {
                similar: Some(Similar::vector(vec![1.0, 0.0])),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::DimensionMismatch);
    }

    #[test]
    fn test_stats_track_counts() {
        let db = Database::in_memory(config4()).unwrap();
        let a = db
            .add_vector(vec![1.0, 0.0, 0.0, 0.0], EntityKind::Thing, MetadataMap::new())
            .unwrap();
        let b = db
            .add_vector(vec![0.0, 1.0, 0.0, 0.0], EntityKind::Thing, MetadataMap::new())
            .unwrap();
        db.add_edge(NewEdge::new(a, b, crate::types::Verb::RelatedTo))
            .unwrap();

        let stats = db.stats();
        assert_eq!(stats.entity_count, 2);
        assert_eq!(stats.edge_count, 1);
        assert_eq!(stats.dimension, 4);
        assert!(!stats.degraded);
        assert!(stats.generation > 0);
    }

    #[test]
    fn test_database_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Database>();
    }
}
