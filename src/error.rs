//! Error types for NousDB.
//!
//! NousDB uses a hierarchical error system:
//! - `NousError` is the top-level error returned by all public APIs
//! - Specific error types (`StorageError`, `ValidationError`, `QueryError`)
//!   provide detail
//! - Every error maps to a stable [`ErrorCode`] surfaced identically
//!   across storage backends
//!
//! Errors are returned as values through the typed return channel; they are
//! never used as control flow across component boundaries.

use thiserror::Error;

use crate::types::{EdgeId, EntityId};

/// Result type alias for NousDB operations.
pub type Result<T> = std::result::Result<T, NousError>;

/// Stable error codes surfaced identically across backends.
///
/// Callers that need programmatic dispatch should match on
/// [`NousError::code()`] rather than on error variants, which may gain
/// detail fields over time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Requested entity or edge does not exist.
    NotFound,
    /// An id or fingerprint collision was detected.
    AlreadyExists,
    /// A vector's dimension does not match the database dimension.
    DimensionMismatch,
    /// A filter tree is structurally invalid.
    InvalidPredicate,
    /// A traversal exceeded the absolute depth cap.
    DepthLimit,
    /// A query deadline expired before any signal completed.
    Timeout,
    /// The operation was cancelled through its token.
    Cancelled,
    /// The storage backend is unreachable or failed.
    StorageUnavailable,
    /// A persisted index snapshot failed validation.
    CorruptSnapshot,
    /// The operation conflicts with existing state (e.g. incident edges).
    Conflict,
    /// An internal invariant was violated.
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::NotFound => "NotFound",
            ErrorCode::AlreadyExists => "AlreadyExists",
            ErrorCode::DimensionMismatch => "DimensionMismatch",
            ErrorCode::InvalidPredicate => "InvalidPredicate",
            ErrorCode::DepthLimit => "DepthLimit",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::StorageUnavailable => "StorageUnavailable",
            ErrorCode::CorruptSnapshot => "CorruptSnapshot",
            ErrorCode::Conflict => "Conflict",
            ErrorCode::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Top-level error enum for all NousDB operations.
///
/// This is the only error type returned by public APIs.
/// Use pattern matching or [`NousError::code()`] to handle specific cases.
#[derive(Debug, Error)]
pub enum NousError {
    /// Storage layer error (I/O, corruption, transactions).
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Input validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Query planning or execution error.
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// Entity not found.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// Edge not found.
    #[error("Edge not found: {0}")]
    EdgeNotFound(EdgeId),

    /// An entity with the same content fingerprint already exists.
    #[error("Entity already exists with fingerprint '{fingerprint}': {existing}")]
    AlreadyExists {
        /// The colliding fingerprint.
        fingerprint: String,
        /// Id of the existing entity.
        existing: EntityId,
    },

    /// Deleting an entity that still has incident edges without cascade.
    #[error("Entity {id} has {edge_count} incident edge(s); delete them first or pass cascade")]
    Conflict {
        /// The entity that could not be deleted.
        id: EntityId,
        /// Number of incident edges found.
        edge_count: usize,
    },

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedding generation/validation error.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Vector index error (HNSW operations).
    #[error("Vector index error: {0}")]
    Vector(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NousError {
    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates an embedding error with the given message.
    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// Creates a vector index error with the given message.
    pub fn vector(msg: impl Into<String>) -> Self {
        Self::Vector(msg.into())
    }

    /// Creates an internal invariant-violation error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the stable error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            NousError::Storage(e) => e.code(),
            NousError::Validation(e) => e.code(),
            NousError::Query(e) => e.code(),
            NousError::Config { .. } => ErrorCode::Internal,
            NousError::EntityNotFound(_) | NousError::EdgeNotFound(_) => ErrorCode::NotFound,
            NousError::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            NousError::Conflict { .. } => ErrorCode::Conflict,
            NousError::Io(_) => ErrorCode::StorageUnavailable,
            NousError::Embedding(_) => ErrorCode::Internal,
            NousError::Vector(_) => ErrorCode::Internal,
            NousError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Returns true if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }

    /// Returns true if this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a storage error.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if the caller may retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::StorageUnavailable | ErrorCode::Timeout | ErrorCode::Cancelled
        )
    }
}

/// Storage-related errors.
///
/// These errors indicate problems with the underlying storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database file or data is corrupted.
    #[error("Database corrupted: {0}")]
    Corrupted(String),

    /// Storage backend is unreachable.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Database is locked by another process.
    #[error("Database is locked by another writer")]
    Locked,

    /// Transaction failed (commit, rollback, etc.).
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error from the redb storage engine.
    #[error("Storage engine error: {0}")]
    Redb(String),

    /// Database schema version doesn't match expected version.
    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version.
        expected: u32,
        /// Actual schema version found in database.
        found: u32,
    },

    /// A persisted index snapshot failed its checksum or structure checks.
    #[error("Corrupt index snapshot '{name}': {reason}")]
    CorruptSnapshot {
        /// The blob name that failed to load.
        name: String,
        /// Why validation failed.
        reason: String,
    },
}

impl StorageError {
    /// Creates a corruption error with the given message.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Creates an unavailable error with the given message.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Creates a transaction error with the given message.
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Creates a serialization error with the given message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Creates a corrupt-snapshot error.
    pub fn corrupt_snapshot(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptSnapshot {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Returns the stable error code for this storage error.
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::CorruptSnapshot { .. } => ErrorCode::CorruptSnapshot,
            StorageError::Corrupted(_) | StorageError::SchemaVersionMismatch { .. } => {
                ErrorCode::Internal
            }
            _ => ErrorCode::StorageUnavailable,
        }
    }
}

// Conversions from redb error types
impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        StorageError::Redb(err.to_string())
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        StorageError::Redb(err.to_string())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::Transaction(err.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::Transaction(format!("Commit failed: {}", err))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        StorageError::Redb(format!("Table error: {}", err))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        StorageError::Redb(format!("Storage error: {}", err))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

// Also allow direct conversion to NousError for convenience
impl From<redb::Error> for NousError {
    fn from(err: redb::Error) -> Self {
        NousError::Storage(StorageError::from(err))
    }
}

impl From<redb::DatabaseError> for NousError {
    fn from(err: redb::DatabaseError) -> Self {
        NousError::Storage(StorageError::from(err))
    }
}

impl From<redb::TransactionError> for NousError {
    fn from(err: redb::TransactionError) -> Self {
        NousError::Storage(StorageError::from(err))
    }
}

impl From<redb::CommitError> for NousError {
    fn from(err: redb::CommitError) -> Self {
        NousError::Storage(StorageError::from(err))
    }
}

impl From<redb::TableError> for NousError {
    fn from(err: redb::TableError) -> Self {
        NousError::Storage(StorageError::from(err))
    }
}

impl From<redb::StorageError> for NousError {
    fn from(err: redb::StorageError) -> Self {
        NousError::Storage(StorageError::from(err))
    }
}

impl From<bincode::Error> for NousError {
    fn from(err: bincode::Error) -> Self {
        NousError::Storage(StorageError::from(err))
    }
}

/// Validation errors for input data.
///
/// These errors fail the single call and never mutate state.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Vector dimension doesn't match the database's configured dimension.
    #[error("Vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected dimension from database configuration.
        expected: usize,
        /// Actual dimension provided.
        got: usize,
    },

    /// A field has an invalid value.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Name of the invalid field.
        field: String,
        /// Why the value is invalid.
        reason: String,
    },

    /// A required field is missing or empty.
    #[error("Required field missing: {field}")]
    RequiredField {
        /// Name of the missing field.
        field: String,
    },
}

impl ValidationError {
    /// Creates a dimension mismatch error.
    pub fn dimension_mismatch(expected: usize, got: usize) -> Self {
        Self::DimensionMismatch { expected, got }
    }

    /// Creates an invalid field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a required field error.
    pub fn required_field(field: impl Into<String>) -> Self {
        Self::RequiredField {
            field: field.into(),
        }
    }

    /// Returns the stable error code for this validation error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ValidationError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            _ => ErrorCode::Internal,
        }
    }
}

/// Query planning and execution errors.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The filter tree is structurally invalid.
    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    /// Traversal depth exceeds the absolute cap.
    #[error("Traversal depth {requested} exceeds the maximum of {max}")]
    DepthLimit {
        /// Depth the caller asked for.
        requested: usize,
        /// The hard cap.
        max: usize,
    },

    /// The query deadline expired before any signal completed.
    #[error("Query timed out after {elapsed_ms}ms")]
    Timeout {
        /// Milliseconds elapsed when the deadline fired.
        elapsed_ms: u64,
    },

    /// The operation was cancelled through its token.
    #[error("Operation cancelled")]
    Cancelled,
}

impl QueryError {
    /// Creates an invalid-predicate error with the given reason.
    pub fn invalid_predicate(msg: impl Into<String>) -> Self {
        Self::InvalidPredicate(msg.into())
    }

    /// Returns the stable error code for this query error.
    pub fn code(&self) -> ErrorCode {
        match self {
            QueryError::InvalidPredicate(_) => ErrorCode::InvalidPredicate,
            QueryError::DepthLimit { .. } => ErrorCode::DepthLimit,
            QueryError::Timeout { .. } => ErrorCode::Timeout,
            QueryError::Cancelled => ErrorCode::Cancelled,
        }
    }
}
