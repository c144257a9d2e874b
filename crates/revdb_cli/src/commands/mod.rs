//! CLI command implementations.

pub mod compact;
pub mod conflicts;
pub mod documents;
pub mod inspect;

use clap::ValueEnum;
use revdb_core::{
    Conflict, ConflictResolver, CoreError, CoreResult, Database, DatabaseConfig,
    DefaultConflictResolver, Document,
};
use revdb_storage::{RevisionEngine, StorageError};
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// Bad command-line usage.
    #[error("usage: {0}")]
    Usage(&'static str),

    /// Database error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Storage error outside a database handle.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// JSON output or input error.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Where the database lives.
#[derive(Debug, Clone)]
pub struct DatabaseArgs {
    /// Parent directory.
    pub directory: PathBuf,
    /// Database name.
    pub name: String,
}

impl DatabaseArgs {
    /// Opens the database; only `put` may create it.
    pub fn open(&self, create: bool) -> CliResult<Database> {
        let config = DatabaseConfig::new()
            .directory(&self.directory)
            .create_if_missing(create);
        Ok(Database::open(&self.name, config)?)
    }

    /// Attaches to the engine under an open database, for journal stats.
    pub fn engine(&self, db: &Database) -> CliResult<Option<RevisionEngine>> {
        match db.path() {
            Some(path) => Ok(Some(RevisionEngine::open(path, true)?)),
            None => Ok(None),
        }
    }
}

/// Built-in conflict resolution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// Deletions win, then the higher generation.
    Default,
    /// Keep the local content.
    Local,
    /// Keep the remote content.
    Remote,
}

impl ConflictResolver for Strategy {
    fn resolve(&self, conflict: &Conflict) -> CoreResult<Option<Document>> {
        match self {
            Self::Default => DefaultConflictResolver.resolve(conflict),
            Self::Local => Ok(conflict.local().cloned()),
            Self::Remote => Ok(conflict.remote().cloned()),
        }
    }
}
