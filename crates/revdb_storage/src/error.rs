//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Revision conflicts are not errors; they are reported through
/// [`crate::PutOutcome::Conflict`] and [`crate::ResolveOutcome::Conflict`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The document or revision does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The journal is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A stored body or record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] revdb_codec::CodecError),

    /// The connection is closed.
    #[error("storage is closed")]
    Closed,

    /// Another process holds the database directory lock.
    #[error("database directory is locked by another process")]
    Locked,

    /// A mutation was attempted outside a transaction.
    #[error("no transaction is active on this connection")]
    NoTransaction,

    /// A transaction was begun while one is already active.
    #[error("a transaction is already active on this connection")]
    TransactionActive,

    /// An argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
