//! Embedding function interface.
//!
//! The embedding model is an external collaborator: the core treats it as
//! an opaque `text -> vector` function behind the [`Embedder`] trait and
//! pins only the contract (exactly `D` floats out). Implementations are
//! plugged by constructor injection through
//! [`Database::open_with`](crate::Database::open_with).

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{NousError, Result};
use crate::types::Vector;

/// Opaque text-to-vector function.
///
/// Implementations must be thread-safe; the engine calls `embed` from
/// worker threads, possibly concurrently.
///
/// # Implementing a provider
///
/// ```rust,ignore
/// use nousdb::{Embedder, Result, Vector};
///
/// struct ApiEmbedder { client: MyClient, dimension: usize }
///
/// impl Embedder for ApiEmbedder {
///     fn embed(&self, text: &str) -> Result<Vector> {
///         Ok(self.client.embed(text)?)
///     }
///
///     fn dimension(&self) -> usize {
///         self.dimension
///     }
/// }
/// ```
pub trait Embedder: Send + Sync {
    /// Embeds a single text into a vector of exactly `dimension()` floats.
    fn embed(&self, text: &str) -> Result<Vector>;

    /// The dimension of vectors this embedder produces.
    fn dimension(&self) -> usize;
}

/// Placeholder embedder for databases fed pre-computed vectors.
///
/// Every `embed` call fails; callers must use the `add_vector` path.
#[derive(Clone, Debug)]
pub struct ExternalEmbedder {
    dimension: usize,
}

impl ExternalEmbedder {
    /// Creates a placeholder embedder for the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Embedder for ExternalEmbedder {
    fn embed(&self, _text: &str) -> Result<Vector> {
        Err(NousError::embedding(
            "no embedding model configured: supply pre-computed vectors via add_vector",
        ))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// LRU-caching wrapper around any embedder.
///
/// Keys are exact input strings; the default capacity is 1000 entries.
/// Failures are never cached.
pub struct CachedEmbedder {
    inner: Box<dyn Embedder>,
    cache: Mutex<LruCache<String, Vector>>,
}

impl CachedEmbedder {
    /// Wraps an embedder with a cache of the given capacity.
    pub fn new(inner: Box<dyn Embedder>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of cached embeddings.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Embedder for CachedEmbedder {
    fn embed(&self, text: &str) -> Result<Vector> {
        if let Some(vector) = self.cache.lock().get(text) {
            return Ok(vector.clone());
        }
        let vector = self.inner.embed(text)?;
        self.cache.lock().put(text.to_string(), vector.clone());
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}
