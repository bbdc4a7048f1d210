//! Top-level error types for the history store.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config from {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Database connection and migration errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to SQLite: {0}")]
    SqliteConnect(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Rejected inputs to ledger, query and batch operations.
///
/// Nothing has been read or written when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("{operation} limit must not be negative, got {limit}")]
    NegativeLimit { operation: &'static str, limit: i64 },
}

impl HistoryError {
    /// Reject a negative batch limit before any work happens.
    pub(crate) fn check_limit(operation: &'static str, limit: i64) -> Result<()> {
        if limit < 0 {
            return Err(HistoryError::NegativeLimit { operation, limit }.into());
        }
        Ok(())
    }
}
