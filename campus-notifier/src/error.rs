//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The shared store could not be reached or a query failed outright.
    /// Aborts the current cycle without advancing the scan cursor.
    #[error("Store unavailable during {operation}: {message}")]
    StoreUnavailable {
        operation: &'static str,
        message: String,
    },

    /// A single row could not be turned into a change record.
    #[error("Malformed {entity} row {key}: {reason}")]
    MalformedRow {
        entity: &'static str,
        key: String,
        reason: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] crate::notification::channels::TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} ({path}): {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn store_unavailable(operation: &'static str, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation,
            message: message.into(),
        }
    }

    pub fn malformed_row(
        entity: &'static str,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedRow {
            entity,
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether this error means the store itself is unusable, as opposed to a
    /// single bad item.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Self::DatabaseSqlx(_) | Self::Migration(_) | Self::StoreUnavailable { .. }
        )
    }

    /// Convert any store-level error into [`Error::StoreUnavailable`] tagged with
    /// the operation that hit it. Other errors pass through unchanged.
    pub fn in_operation(self, operation: &'static str) -> Self {
        match self {
            Self::DatabaseSqlx(e) => Self::store_unavailable(operation, e.to_string()),
            other => other,
        }
    }
}
