//! Error types for the progress engine
//!
//! Every engine operation returns a [`ProgressResult`]; no path panics.
//! A stale cached value is not an error: it is served until its TTL runs out.

use crate::cache::CacheError;
use crate::models::ResourceKind;
use thiserror::Error;
use tw_common::AttemptStatus;

/// Result type for engine operations
pub type ProgressResult<T> = std::result::Result<T, ProgressError>;

/// Engine error taxonomy
#[derive(Debug, Error)]
pub enum ProgressError {
    /// Heartbeat rejected by the sliding-window limiter, no state changed
    #[error("Rate limited: retry after {retry_after_seconds:.1}s")]
    RateLimited { retry_after_seconds: f64 },

    /// Opening one more session would exceed the parallel-session limit
    #[error("Too many parallel sessions: {open} open, max {max}")]
    SessionCapacityExceeded { open: u32, max: u32 },

    /// Referenced subsection/section/topic/test/attempt does not exist
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: i64 },

    /// Attempt state change not allowed; attempt left unchanged
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: AttemptStatus,
        to: AttemptStatus,
    },

    /// Test gating conditions are not met yet
    #[error("Test {test_id} is not available: {reason}")]
    TestUnavailable { test_id: i64, reason: String },

    /// Student used every allowed attempt
    #[error("No attempts left for test {test_id} (max {max})")]
    AttemptsExhausted { test_id: i64, max: u32 },

    /// Student has no group granting access to the resource
    #[error("Access denied to {kind} {id}")]
    AccessDenied { kind: ResourceKind, id: i64 },

    /// Caller supplied an unusable value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Cache collaborator failure on a path where the cache is required
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Persistence collaborator failure
    #[error("Store error: {0}")]
    Store(#[from] tw_common::Error),

    /// Unexpected internal failure (task panicked, invariant broken)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProgressError {
    /// Stable machine-readable code for the API boundary
    pub fn code(&self) -> &'static str {
        match self {
            ProgressError::RateLimited { .. } => "RATE_LIMITED",
            ProgressError::SessionCapacityExceeded { .. } => "SESSION_CAPACITY_EXCEEDED",
            ProgressError::NotFound { .. } => "NOT_FOUND",
            ProgressError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            ProgressError::TestUnavailable { .. } => "TEST_UNAVAILABLE",
            ProgressError::AttemptsExhausted { .. } => "ATTEMPTS_EXHAUSTED",
            ProgressError::AccessDenied { .. } => "ACCESS_DENIED",
            ProgressError::InvalidInput(_) => "INVALID_INPUT",
            ProgressError::Cache(_) => "CACHE_ERROR",
            ProgressError::Store(_) => "STORE_ERROR",
            ProgressError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the same request after backing off
    pub fn is_retryable(&self) -> bool {
        match self {
            ProgressError::RateLimited { .. } => true,
            ProgressError::Cache(err) => tw_common::retry::Transient::is_transient(err),
            ProgressError::Store(err) => err.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn not_found(kind: ResourceKind, id: i64) -> Self {
        ProgressError::NotFound { kind, id }
    }
}
