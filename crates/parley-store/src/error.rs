// ABOUTME: Error taxonomy for the storage engine internals: I/O, malformed records, constraint
// ABOUTME: violations and not-found. Public engine calls log these and return sentinels instead.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::index::IndexError;
use crate::jsonl::LogError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("index error: {0}")]
    Index(IndexError),

    #[error("log error: {0}")]
    Log(LogError),

    #[error("storage engine is already initializing")]
    AlreadyInitializing,
}

impl From<IndexError> for StoreError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Sqlite(rusqlite::Error::SqliteFailure(failure, msg))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(msg.unwrap_or_else(|| failure.to_string()))
            }
            IndexError::Io(io) => StoreError::Io(io),
            other => StoreError::Index(other),
        }
    }
}

impl From<LogError> for StoreError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::Io(io) => StoreError::Io(io),
            LogError::Record(r) => StoreError::Malformed(r.to_string()),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::from(IndexError::Sqlite(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_failures_are_classified() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY),
            Some("FOREIGN KEY constraint failed".to_string()),
        );
        match StoreError::from(err) {
            StoreError::Constraint(msg) => assert!(msg.contains("FOREIGN KEY")),
            other => panic!("expected constraint, got {other:?}"),
        }
    }

    #[test]
    fn not_open_stays_an_index_error() {
        assert!(matches!(
            StoreError::from(IndexError::NotOpen),
            StoreError::Index(IndexError::NotOpen)
        ));
    }
}
