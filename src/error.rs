//! Error taxonomy for the repository, drivers and migration engine.
//!
//! The thumbnail cache never surfaces these: cache failures degrade to misses.

use std::path::PathBuf;
use thiserror::Error;

/// One table whose source and target row counts diverged after a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountMismatch {
    pub table: &'static str,
    pub source: i64,
    pub target: i64,
}

impl std::fmt::Display for CountMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (source {}, target {})", self.table, self.source, self.target)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend cannot be opened at all.
    #[error("Storage unavailable at {}: {reason}", .location.display())]
    StorageUnavailable { location: PathBuf, reason: String },

    /// Another process instance holds the storage lock.
    #[error("Storage at {} is locked by another instance", .location.display())]
    StorageLocked { location: PathBuf },

    /// Schema version mismatch or a failed upgrade step.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Engine failure inside a transaction. The transaction was rolled back.
    #[error("Repository error: {cause}")]
    Repository {
        #[source]
        cause: rusqlite::Error,
    },

    /// Rename target already has a record.
    #[error("A record already exists for {path}")]
    Conflict { path: String },

    /// Row counts diverged between source and target after migration.
    #[error("Migration integrity check failed: {}", format_mismatches(.mismatches))]
    MigrationIntegrity { mismatches: Vec<CountMismatch> },

    /// Write attempted through a handle opened read-only.
    #[error("Storage at {} was opened read-only", .location.display())]
    ReadOnly { location: PathBuf },

    /// Record rejected before touching the database.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_mismatches(mismatches: &[CountMismatch]) -> String {
    mismatches
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<rusqlite::Error> for StoreError {
    fn from(cause: rusqlite::Error) -> Self {
        StoreError::Repository { cause }
    }
}

impl StoreError {
    pub fn unavailable(location: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::StorageUnavailable {
            location: location.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        StoreError::InvalidRecord(message.into())
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::StorageLocked { .. } => true,
            StoreError::Repository { cause } => matches!(
                cause.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
