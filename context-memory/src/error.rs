//! Error types for context-memory

use thiserror::Error;

use crate::node::NodeId;

/// Errors that can occur in the memory graph
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Malformed or out-of-range input, rejected before any write
    #[error("Validation error: {0}")]
    Validation(String),

    /// Id absent or tombstoned
    #[error("Not found: {0}")]
    NotFound(String),

    /// Id was superseded by a merge or pruned. `redirect` names the survivor
    /// while the merge redirect is still within its grace period.
    #[error("Stale reference: {id} (redirect: {redirect:?})")]
    StaleReference { id: String, redirect: Option<NodeId> },

    /// Edge endpoint missing, pruned or merged
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Optimistic version check failed, or the record is locked by consolidation
    #[error("Conflict, retry: {0}")]
    ConflictRetry(String),

    /// Retrieval ran out of its time budget
    #[error("Budget exceeded after {elapsed_ms}ms")]
    BudgetExceeded { elapsed_ms: u64 },

    /// A merge batch failed and was rolled back
    #[error("Consolidation partial failure: {reason} (affected: {ids:?})")]
    ConsolidationPartialFailure { reason: String, ids: Vec<NodeId> },

    /// Persistence kept failing past the retry ceiling
    #[error("Memory engine degraded: {0}")]
    Degraded(String),

    /// RocksDB error
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Serialization error (bincode)
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// UUID parsing error
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// Embedding generation error
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Builder error
    #[error("Validation error: {0}")]
    Builder(#[from] crate::node::MemoryNodeBuilderError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MemoryError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound(id.to_string())
    }

    /// Create a stale reference error
    pub fn stale(id: impl ToString, redirect: Option<NodeId>) -> Self {
        Self::StaleReference {
            id: id.to_string(),
            redirect,
        }
    }

    /// Create an invalid reference error
    pub fn invalid_reference(msg: impl Into<String>) -> Self {
        Self::InvalidReference(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConflictRetry(msg.into())
    }

    /// Create an embedding error
    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    /// Whether the operation may succeed if retried after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConflictRetry(_) | Self::Storage(_) | Self::Io(_))
    }

    /// Whether this error comes from the persistence layer
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }

    /// True for validation failures, including builder errors
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Builder(_))
    }
}

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;
