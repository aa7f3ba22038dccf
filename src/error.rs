//! Store error taxonomy.
//!
//! Every fallible store operation returns [`StoreError`]. SQLite failures
//! are mapped here so call sites only deal with semantic variants.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("{table} already has a record with {field} = {value}")]
    UniqueConstraint {
        table: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("{table} not found: {id}")]
    NotFound { table: &'static str, id: String },

    #[error("Insert into {table} failed: {reason}")]
    Insert { table: &'static str, reason: String },

    #[error("Transaction aborted: {0}")]
    Transaction(String),

    #[error("{table} {id} was modified concurrently (expected updated_at {expected}, found {actual})")]
    Conflict {
        table: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn not_found(table: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            table,
            id: id.into(),
        }
    }
}

/// True when the error is SQLite rejecting a duplicate value in a unique index.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(sqlite_err, _)
            if sqlite_err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(sqlite_err, _)
                if sqlite_err.code == rusqlite::ErrorCode::CannotOpen =>
            {
                StoreError::Configuration(format!("Cannot open database: {err}"))
            }
            _ => StoreError::Storage(err.to_string()),
        }
    }
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(inner) => inner.into(),
            tokio_rusqlite::Error::ConnectionClosed => {
                StoreError::Storage("Connection closed".to_string())
            }
            other => StoreError::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn sqlite_failure(code: rusqlite::ErrorCode, extended_code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error { code, extended_code }, None)
    }

    #[test]
    fn test_unique_violation_detected() {
        let err = sqlite_failure(
            rusqlite::ErrorCode::ConstraintViolation,
            ffi::SQLITE_CONSTRAINT_UNIQUE,
        );
        assert!(is_unique_violation(&err));

        let err = sqlite_failure(
            rusqlite::ErrorCode::ConstraintViolation,
            ffi::SQLITE_CONSTRAINT_NOTNULL,
        );
        assert!(!is_unique_violation(&err));
    }

    #[test]
    fn test_cannot_open_maps_to_configuration() {
        let err = sqlite_failure(rusqlite::ErrorCode::CannotOpen, ffi::SQLITE_CANTOPEN);
        assert!(matches!(StoreError::from(err), StoreError::Configuration(_)));
    }

    #[test]
    fn test_other_rusqlite_errors_map_to_storage() {
        let err = StoreError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, StoreError::Storage(_)));
    }

    #[test]
    fn test_tokio_rusqlite_other_maps_to_storage() {
        let err = tokio_rusqlite::Error::Other(Box::new(std::io::Error::other("boom")));
        assert!(matches!(StoreError::from(err), StoreError::Storage(_)));
    }

    #[test]
    fn test_display_messages() {
        let err = StoreError::not_found("job_applications", "abc-123");
        assert_eq!(err.to_string(), "job_applications not found: abc-123");

        let err = StoreError::UniqueConstraint {
            table: "job_applications",
            field: "canonical_url",
            value: "https://x.example/job/1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "job_applications already has a record with canonical_url = https://x.example/job/1"
        );
    }
}
