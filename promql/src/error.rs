//! Error taxonomy for query planning and evaluation.

use std::fmt;

/// Errors surfaced by a [`Queryable`](crate::storage::Queryable) implementation.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Storage-related errors
    Storage(String),
    /// Internal errors
    Internal(String),
}

impl std::error::Error for StorageError {}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageError::Storage(msg) => write!(f, "Storage error: {}", msg),
            StorageError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl StorageError {
    /// Converts a storage error to StorageError::Storage.
    pub fn from_storage(e: impl fmt::Display) -> Self {
        StorageError::Storage(e.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// The per-query resource whose limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitedResource {
    /// Estimated bytes held by the query's buffers.
    Memory,
    /// Samples loaded from storage or produced by selectors.
    Samples,
}

impl fmt::Display for LimitedResource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LimitedResource::Memory => write!(f, "estimated memory consumption"),
            LimitedResource::Samples => write!(f, "samples"),
        }
    }
}

/// Errors that terminate a query.
///
/// Warnings and informational notices never appear here; they are collected
/// as [`Annotation`](crate::annotations::Annotation)s and returned alongside a
/// successful result.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// Start after end, non-positive step, or an otherwise unusable time range.
    InvalidRange(String),
    /// A per-query limit was exceeded.
    ResourceExhausted {
        resource: LimitedResource,
        limit: u64,
    },
    /// The storage layer failed.
    Storage(StorageError),
    /// The caller cancelled the query.
    Canceled,
    /// The query ran past its timeout.
    DeadlineExceeded,
    /// A function or operator rejected its input (e.g. conflicting series).
    FunctionEvaluation(String),
    /// The expression is not valid for evaluation (type errors, bad arguments).
    InvalidQuery(String),
    /// The expression uses a construct this engine does not implement.
    Unsupported(String),
    /// Invariant violation inside the engine.
    Internal(String),
}

impl std::error::Error for EvaluationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EvaluationError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EvaluationError::InvalidRange(msg) => write!(f, "invalid time range: {}", msg),
            EvaluationError::ResourceExhausted { resource, limit } => write!(
                f,
                "the query exceeded the maximum allowed {} (limit: {})",
                resource, limit
            ),
            EvaluationError::Storage(e) => write!(f, "{}", e),
            EvaluationError::Canceled => write!(f, "context canceled"),
            EvaluationError::DeadlineExceeded => write!(f, "context deadline exceeded"),
            EvaluationError::FunctionEvaluation(msg) => write!(f, "{}", msg),
            EvaluationError::InvalidQuery(msg) => write!(f, "invalid query: {}", msg),
            EvaluationError::Unsupported(msg) => write!(f, "unsupported: {}", msg),
            EvaluationError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl From<StorageError> for EvaluationError {
    fn from(err: StorageError) -> Self {
        EvaluationError::Storage(err)
    }
}

impl EvaluationError {
    /// True for errors caused by the caller giving up rather than by the query.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            EvaluationError::Canceled | EvaluationError::DeadlineExceeded
        )
    }

    pub(crate) fn memory_exhausted(limit: u64) -> Self {
        EvaluationError::ResourceExhausted {
            resource: LimitedResource::Memory,
            limit,
        }
    }
}

/// Result type alias for query evaluation
pub type EvalResult<T> = std::result::Result<T, EvaluationError>;
