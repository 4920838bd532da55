//! Error types for the persistent-store adapter.

use thiserror::Error;

/// Errors raised by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored column could not be decoded into its domain type.
    #[error("Corrupt column {column}: {value:?} ({reason})")]
    Decode {
        /// Column name.
        column: &'static str,
        /// Raw stored value.
        value: String,
        /// Why decoding failed.
        reason: String,
    },

    /// A schema migration could not be applied.
    #[error("Migration {component} v{version} failed: {reason}")]
    Migration {
        /// Which component owns the migration.
        component: String,
        /// Migration version (1-based).
        version: usize,
        /// Underlying failure.
        reason: String,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the failure is a UNIQUE / PRIMARY KEY constraint violation.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => {
                err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            }
            _ => false,
        }
    }

    /// Whether SQLite reported the database as busy or locked.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Database(rusqlite::Error::SqliteFailure(err, _))
                if matches!(err.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        )
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, StoreError>;
