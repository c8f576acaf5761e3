//! Common error types for TestWise

use thiserror::Error;

/// Common result type for TestWise operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across TestWise services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored JSON column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures that may succeed on an immediate second attempt
    /// (lock contention, pool exhaustion, dropped connections).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::PoolTimedOut)
            | Error::Database(sqlx::Error::PoolClosed)
            | Error::Database(sqlx::Error::Io(_)) => true,
            Error::Database(db_err) => db_err.to_string().contains("database is locked"),
            Error::Io(_) => true,
            _ => false,
        }
    }
}
