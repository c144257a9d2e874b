//! Error types for revdb core.

use revdb_codec::CodecError;
use revdb_storage::StorageError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by database operations.
///
/// Write conflicts are normally reported as `false` from the save calls,
/// not as errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The document does not exist or is deleted.
    #[error("document not found: {doc_id}")]
    NotFound {
        /// The document id.
        doc_id: String,
    },

    /// A last-write-wins retry conflicted again.
    #[error("unresolvable write conflict on document {doc_id}")]
    Conflict {
        /// The document id.
        doc_id: String,
    },

    /// An argument was rejected, e.g. a document owned by another database.
    #[error("invalid parameter: {message}")]
    InvalidParameter {
        /// Why the argument was rejected.
        message: String,
    },

    /// The database is closing or closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// The database directory could not be created or opened.
    #[error("cannot open database directory {}: {source}", path.display())]
    CantOpenFile {
        /// The directory.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// Stored data could not be interpreted.
    #[error("unexpected error: {message}")]
    UnexpectedError {
        /// Description of the problem.
        message: String,
    },

    /// A batch was rolled back.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for the rollback.
        reason: String,
    },

    /// Revision store failure.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Document body encoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl CoreError {
    /// Creates a not-found error.
    pub fn not_found(doc_id: impl Into<String>) -> Self {
        Self::NotFound {
            doc_id: doc_id.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(doc_id: impl Into<String>) -> Self {
        Self::Conflict {
            doc_id: doc_id.into(),
        }
    }

    /// Creates an invalid parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates an unexpected error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedError {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Returns true for [`CoreError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(doc_id) => Self::NotFound { doc_id },
            StorageError::Closed => Self::DatabaseClosed,
            StorageError::Corrupted(message) => Self::UnexpectedError { message },
            StorageError::Codec(codec) => Self::UnexpectedError {
                message: codec.to_string(),
            },
            other => Self::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_bridged() {
        assert!(CoreError::from(StorageError::NotFound("x".into())).is_not_found());
        assert!(matches!(
            CoreError::from(StorageError::Closed),
            CoreError::DatabaseClosed
        ));
        assert!(matches!(
            CoreError::from(StorageError::Corrupted("bad".into())),
            CoreError::UnexpectedError { .. }
        ));
        assert!(matches!(
            CoreError::from(StorageError::Locked),
            CoreError::Storage(StorageError::Locked)
        ));
    }

    #[test]
    fn messages() {
        assert_eq!(
            CoreError::not_found("doc").to_string(),
            "document not found: doc"
        );
        assert_eq!(CoreError::DatabaseClosed.to_string(), "database is closed");
    }
}
