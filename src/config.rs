//! Configuration types for NousDB.
//!
//! The [`Config`] struct controls database behavior including:
//! - Vector dimension and distance metric
//! - HNSW index tuning
//! - Fusion weights and cache sizes
//! - Write-path batching and back-pressure
//!
//! # Example
//! ```rust
//! use nousdb::{Config, Dimension, Metric};
//!
//! // Use defaults (384 dimensions, cosine)
//! let config = Config::default();
//!
//! // Customize for a larger embedding model
//! let config = Config {
//!     dimension: Dimension::D768,
//!     metric: Metric::Euclidean,
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Database configuration options.
///
/// All fields have sensible defaults. Use struct update syntax to override
/// specific settings:
///
/// ```rust
/// use nousdb::Config;
///
/// let config = Config {
///     plan_cache_size: 512,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Vector dimension (set at database creation, immutable thereafter).
    pub dimension: Dimension,

    /// Distance metric used by the vector index.
    pub metric: Metric,

    /// HNSW vector index parameters.
    ///
    /// Controls the quality and performance of semantic search.
    /// See [`HnswConfig`] for tuning guidelines.
    pub hnsw: HnswConfig,

    /// Fusion constants for multi-signal queries.
    pub fusion: FusionConfig,

    /// Graph score decay per traversal hop.
    ///
    /// A node discovered at depth `d` with path weight `w` receives graph
    /// score `w * decay^d`. Default: 0.8
    pub graph_decay: f32,

    /// Capacity of the query plan cache (LRU entries, keyed by query shape).
    ///
    /// Default: 256
    pub plan_cache_size: usize,

    /// Capacity of the embedding cache (LRU entries, keyed by exact text).
    ///
    /// Default: 1000
    pub embed_cache_size: usize,

    /// Default time budget applied to queries that carry no deadline.
    ///
    /// `None` means queries run to completion. Default: `None`
    pub default_time_budget: Option<Duration>,

    /// Bulk-add batch size: items per storage commit.
    ///
    /// Default: 100
    pub batch_size: usize,

    /// Bound on the pending write queue used by bulk ingestion.
    ///
    /// Enqueue blocks when full, preventing unbounded memory growth
    /// during ingest bursts. Default: 10_000
    pub write_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // 384 matches all-MiniLM-L6-v2, the common small embedding model
            dimension: Dimension::D384,
            metric: Metric::Cosine,
            hnsw: HnswConfig::default(),
            fusion: FusionConfig::default(),
            graph_decay: 0.8,
            plan_cache_size: 256,
            embed_cache_size: 1000,
            default_time_budget: None,
            batch_size: 100,
            write_queue_capacity: 10_000,
        }
    }
}

impl Config {
    /// Creates a new Config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a Config with the given dimension, other settings default.
    ///
    /// # Example
    /// ```rust
    /// use nousdb::{Config, Dimension};
    ///
    /// // OpenAI text-embedding-3-small uses 1536 dimensions
    /// let config = Config::with_dimension(Dimension::Custom(1536));
    /// ```
    pub fn with_dimension(dimension: Dimension) -> Self {
        Self {
            dimension,
            ..Default::default()
        }
    }

    /// Validates the configuration.
    ///
    /// Called automatically by `Database::open()`. You can also call this
    /// explicitly to check configuration before attempting to open.
    ///
    /// # Errors
    /// Returns `ValidationError` if:
    /// - Custom dimension is 0 or > 4096
    /// - Any HNSW parameter is 0
    /// - `graph_decay` is outside (0, 1]
    /// - Batch or queue sizes are 0
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Dimension::Custom(dim) = self.dimension {
            if dim == 0 {
                return Err(ValidationError::invalid_field(
                    "dimension",
                    "custom dimension must be greater than 0",
                ));
            }
            if dim > 4096 {
                return Err(ValidationError::invalid_field(
                    "dimension",
                    "custom dimension must not exceed 4096",
                ));
            }
        }

        if self.hnsw.m == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.m",
                "must be greater than 0",
            ));
        }
        if self.hnsw.ef_construction == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.ef_construction",
                "must be greater than 0",
            ));
        }
        if self.hnsw.ef_search == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.ef_search",
                "must be greater than 0",
            ));
        }

        if !(self.graph_decay > 0.0 && self.graph_decay <= 1.0) {
            return Err(ValidationError::invalid_field(
                "graph_decay",
                "must be in (0, 1]",
            ));
        }

        if self.plan_cache_size == 0 {
            return Err(ValidationError::invalid_field(
                "plan_cache_size",
                "must be greater than 0",
            ));
        }

        if self.batch_size == 0 {
            return Err(ValidationError::invalid_field(
                "batch_size",
                "must be greater than 0",
            ));
        }

        if self.write_queue_capacity == 0 {
            return Err(ValidationError::invalid_field(
                "write_queue_capacity",
                "must be greater than 0",
            ));
        }

        self.fusion.validate()?;

        Ok(())
    }

    /// Returns the vector dimension as a numeric value.
    pub fn dim(&self) -> usize {
        self.dimension.size()
    }
}

/// Vector dimensions.
///
/// Standard dimensions are provided for common embedding models.
/// Use `Custom` for other models.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dimension {
    /// 384 dimensions (all-MiniLM-L6-v2).
    #[default]
    D384,

    /// 768 dimensions (bge-base-en-v1.5, BERT-base).
    D768,

    /// Custom dimension for other embedding models.
    ///
    /// Must be between 1 and 4096.
    Custom(usize),
}

impl Dimension {
    /// Returns the numeric size of this dimension.
    ///
    /// # Example
    /// ```rust
    /// use nousdb::Dimension;
    ///
    /// assert_eq!(Dimension::D384.size(), 384);
    /// assert_eq!(Dimension::Custom(1536).size(), 1536);
    /// ```
    #[inline]
    pub const fn size(&self) -> usize {
        match self {
            Self::D384 => 384,
            Self::D768 => 768,
            Self::Custom(n) => *n,
        }
    }

    /// Creates a Dimension from a numeric size, preferring named variants.
    pub const fn from_size(n: usize) -> Self {
        match n {
            384 => Self::D384,
            768 => Self::D768,
            other => Self::Custom(other),
        }
    }
}

/// Distance metric for vector comparison.
///
/// All metrics are oriented so that **lower is closer**; `Dot` negates the
/// raw inner product to preserve that orientation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    /// Cosine distance: `1 - (a·b)/(|a||b|)`; 1.0 when either magnitude is 0.
    #[default]
    Cosine,
    /// L2 norm of `a - b`.
    Euclidean,
    /// Negated inner product `-(a·b)`.
    Dot,
    /// Sum of absolute component differences.
    Manhattan,
}

/// Configuration for the HNSW vector index.
///
/// Controls the trade-off between index build time, memory usage,
/// and search accuracy. The defaults are tuned for the target scale
/// (10K-500K entities per database).
///
/// # Tuning Guide
///
/// | Use Case     | M  | ef_construction | ef_search |
/// |--------------|----|-----------------|-----------|
/// | Low memory   |  8 |             100 |        30 |
/// | Balanced     | 16 |             200 |        50 |
/// | High recall  | 32 |             400 |       100 |
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Per-layer neighbor target (M parameter).
    ///
    /// Each node stores up to M bidirectional links per layer (2M at
    /// layer 0), so memory per node is O(M). Default: 16
    pub m: usize,

    /// Number of candidates tracked during index construction.
    ///
    /// Higher values produce a better quality graph but slow down insertion.
    /// Rule of thumb: ef_construction >= 2 * m. Default: 200
    pub ef_construction: usize,

    /// Number of candidates tracked during search.
    ///
    /// Higher values improve recall but increase search latency.
    /// May be overridden per query. Default: 50
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

/// Fusion constants for multi-signal ranking.
///
/// The weights apply to Reciprocal Rank Fusion contributions and are
/// renormalized over the signals actually present in a query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FusionConfig {
    /// RRF rank constant (the `k` in `w / (k + rank)`). Default: 60
    pub rrf_k: u32,

    /// Weight of the vector signal. Default: 0.5
    pub vector_weight: f32,

    /// Weight of the field-filter signal. Default: 0.3
    pub field_weight: f32,

    /// Weight of the graph signal. Default: 0.2
    pub graph_weight: f32,

    /// Half-life for the `recent` boost, in days. Default: 30
    pub recency_half_life_days: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60,
            vector_weight: 0.5,
            field_weight: 0.3,
            graph_weight: 0.2,
            recency_half_life_days: 30.0,
        }
    }
}

impl FusionConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.rrf_k == 0 {
            return Err(ValidationError::invalid_field(
                "fusion.rrf_k",
                "must be greater than 0",
            ));
        }
        for (name, w) in [
            ("fusion.vector_weight", self.vector_weight),
            ("fusion.field_weight", self.field_weight),
            ("fusion.graph_weight", self.graph_weight),
        ] {
            if !(w >= 0.0) || !w.is_finite() {
                return Err(ValidationError::invalid_field(name, "must be >= 0"));
            }
        }
        if !(self.recency_half_life_days > 0.0) {
            return Err(ValidationError::invalid_field(
                "fusion.recency_half_life_days",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dimension, Dimension::D384);
        assert_eq!(config.metric, Metric::Cosine);
        assert_eq!(config.plan_cache_size, 256);
        assert_eq!(config.embed_cache_size, 1000);
        assert_eq!(config.batch_size, 100);
        assert!(config.default_time_budget.is_none());
    }

    #[test]
    fn test_with_dimension() {
        let config = Config::with_dimension(Dimension::Custom(1536));
        assert_eq!(config.dim(), 1536);
    }

    #[test]
    fn test_validate_success() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_custom_dimension_zero() {
        let config = Config {
            dimension: Dimension::Custom(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_custom_dimension_too_large() {
        let config = Config {
            dimension: Dimension::Custom(5000),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_hnsw_zero_m() {
        let config = Config {
            hnsw: HnswConfig {
                m: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField { field, .. } if field == "hnsw.m"
        ));
    }

    #[test]
    fn test_validate_hnsw_zero_ef() {
        for (ef_construction, ef_search) in [(0, 50), (200, 0)] {
            let config = Config {
                hnsw: HnswConfig {
                    m: 16,
                    ef_construction,
                    ef_search,
                },
                ..Default::default()
            };
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_validate_graph_decay_bounds() {
        for decay in [0.0, -0.5, 1.5] {
            let config = Config {
                graph_decay: decay,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "decay {} should fail", decay);
        }
        let config = Config {
            graph_decay: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_fusion_negative_weight() {
        let config = Config {
            fusion: FusionConfig {
                vector_weight: -0.1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dimension_sizes() {
        assert_eq!(Dimension::D384.size(), 384);
        assert_eq!(Dimension::D768.size(), 768);
        assert_eq!(Dimension::Custom(512).size(), 512);
        assert_eq!(Dimension::from_size(384), Dimension::D384);
        assert_eq!(Dimension::from_size(512), Dimension::Custom(512));
    }

    #[test]
    fn test_hnsw_config_defaults() {
        let config = HnswConfig::default();
        assert_eq!(config.m, 16);
        assert_eq!(config.ef_construction, 200);
        assert_eq!(config.ef_search, 50);
    }

    #[test]
    fn test_fusion_defaults() {
        let fusion = FusionConfig::default();
        assert_eq!(fusion.rrf_k, 60);
        assert!((fusion.vector_weight - 0.5).abs() < f32::EPSILON);
        assert!((fusion.field_weight - 0.3).abs() < f32::EPSILON);
        assert!((fusion.graph_weight - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_dimension_serialization() {
        let dim = Dimension::D768;
        let bytes = bincode::serialize(&dim).unwrap();
        let restored: Dimension = bincode::deserialize(&bytes).unwrap();
        assert_eq!(dim, restored);
    }
}
