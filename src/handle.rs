//! Async task facade over the sync core.
//!
//! [`DbHandle`] wraps an `Arc<Database>` and dispatches every operation to
//! the tokio blocking pool, so the public async API never blocks the
//! caller's thread: storage I/O and embedding invocations run on worker
//! threads while the async caller awaits. Cancellation stays cooperative —
//! pass a [`CancelToken`] and the running query observes it between steps.

use std::sync::Arc;

use crate::db::{Database, DatabaseStats};
use crate::entity::{DeleteOptions, Entity, EntityUpdate, NewEdge, NewEntity};
use crate::error::{NousError, Result};
use crate::graph::Visit;
use crate::query::{FindQuery, FindResults};
use crate::registry::BulkOutcome;
use crate::task::CancelToken;
use crate::types::{Direction, EdgeId, EntityId};

/// Cloneable async handle over a shared [`Database`].
///
/// # Example
/// ```rust,ignore
/// let handle = DbHandle::new(Database::open("./nous.db", config)?);
/// let id = handle.add_entity(input).await?;
/// let results = handle.find(query).await?;
/// handle.close().await?;
/// ```
#[derive(Clone, Debug)]
pub struct DbHandle {
    db: Arc<Database>,
}

impl DbHandle {
    /// Wraps a database in an async handle.
    pub fn new(db: Database) -> Self {
        Self { db: Arc::new(db) }
    }

    /// The underlying shared database, for sync call sites.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Database>) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| NousError::internal(format!("worker task failed: {}", e)))?
    }

    /// Async [`Database::add_entity`].
    pub async fn add_entity(&self, input: NewEntity) -> Result<EntityId> {
        self.run(move |db| db.add_entity(input)).await
    }

    /// Async [`Database::add_many`].
    pub async fn add_many(&self, items: Vec<NewEntity>, parallel: bool) -> Result<BulkOutcome> {
        self.run(move |db| Ok(db.add_many(items, parallel))).await
    }

    /// Async [`Database::get`].
    pub async fn get(&self, id: EntityId, include_deleted: bool) -> Result<Option<Entity>> {
        self.run(move |db| db.get(id, include_deleted)).await
    }

    /// Async [`Database::update`].
    pub async fn update(&self, id: EntityId, update: EntityUpdate) -> Result<()> {
        self.run(move |db| db.update(id, update)).await
    }

    /// Async [`Database::delete`].
    pub async fn delete(&self, id: EntityId, opts: DeleteOptions) -> Result<()> {
        self.run(move |db| db.delete(id, opts)).await
    }

    /// Async [`Database::add_edge`].
    pub async fn add_edge(&self, edge: NewEdge) -> Result<EdgeId> {
        self.run(move |db| db.add_edge(edge)).await
    }

    /// Async [`Database::delete_edge`].
    pub async fn delete_edge(&self, id: EdgeId) -> Result<()> {
        self.run(move |db| db.delete_edge(id)).await
    }

    /// Async [`Database::find`].
    pub async fn find(&self, query: FindQuery) -> Result<FindResults> {
        self.run(move |db| db.find(query)).await
    }

    /// Async [`Database::find_with_token`].
    pub async fn find_with_token(
        &self,
        query: FindQuery,
        token: CancelToken,
    ) -> Result<FindResults> {
        self.run(move |db| db.find_with_token(query, token)).await
    }

    /// Async [`Database::search`].
    pub async fn search(&self, vector: Vec<f32>, k: usize) -> Result<Vec<(EntityId, f32)>> {
        self.run(move |db| db.search(&vector, k)).await
    }

    /// Async [`Database::neighbors`].
    pub async fn neighbors(
        &self,
        id: EntityId,
        direction: Direction,
        depth: Option<usize>,
    ) -> Result<Vec<Visit>> {
        self.run(move |db| db.neighbors(id, direction, depth)).await
    }

    /// Async [`Database::stats`].
    pub async fn stats(&self) -> Result<DatabaseStats> {
        self.run(move |db| Ok(db.stats())).await
    }

    /// Async [`Database::compact`].
    pub async fn compact(&self) -> Result<usize> {
        self.run(move |db| db.compact()).await
    }

    /// Closes the database. Fails with `Internal` while other handles are
    /// still alive — close is an exclusive operation.
    pub async fn close(self) -> Result<()> {
        let db = Arc::try_unwrap(self.db)
            .map_err(|_| NousError::internal("cannot close: other handles still alive"))?;
        tokio::task::spawn_blocking(move || db.close())
            .await
            .map_err(|e| NousError::internal(format!("worker task failed: {}", e)))?
    }
}
