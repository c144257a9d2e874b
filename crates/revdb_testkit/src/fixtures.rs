//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and common test scenarios.

use crate::peer::RemotePeer;
use revdb_core::{Database, DatabaseConfig, Document};
use revdb_storage::RevisionEngine;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A test database with automatic cleanup.
///
/// The fixture keeps the revision engine so a [`RemotePeer`] can write to
/// the same store through its own connection.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    engine: RevisionEngine,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self::memory_with_config(DatabaseConfig::default())
    }

    /// Creates a new in-memory test database with a custom configuration.
    pub fn memory_with_config(config: DatabaseConfig) -> Self {
        let engine = RevisionEngine::in_memory();
        let store = engine
            .connect()
            .with_max_rev_tree_depth(config.max_rev_tree_depth);
        let db = Database::open_with_store("test", config, Box::new(store))
            .expect("Failed to open in-memory database");
        Self {
            db,
            engine,
            temp_dir: None,
        }
    }

    /// Creates a new file-based test database in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = DatabaseConfig::new()
            .directory(temp_dir.path())
            .sync_on_commit(false);
        let db = Database::open("test", config).expect("Failed to open file database");
        let path = db.path().expect("File database should have a path");
        let engine = RevisionEngine::open(path, false).expect("Failed to attach to engine");
        Self {
            db,
            engine,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.db.path().map(Path::to_path_buf)
    }

    /// Returns the temporary parent directory if file-based.
    pub fn directory(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// Returns a peer writing through another connection to the same store.
    pub fn peer(&self) -> RemotePeer {
        RemotePeer::new(&self.engine)
    }

    /// Opens a second handle on the same store.
    pub fn second_handle(&self, name: &str) -> Database {
        Database::open_with_store(name, DatabaseConfig::default(), Box::new(self.engine.connect()))
            .expect("Failed to open second handle")
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust
/// use revdb_testkit::with_temp_db;
///
/// with_temp_db(|db| {
///     assert_eq!(db.count().unwrap(), 0);
/// });
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Runs a test with a temporary file-based database.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Path) -> R,
{
    let test_db = TestDatabase::file();
    let path = test_db.path().expect("File database should have a path");
    f(&test_db.db, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a database with `count` documents `doc0..docN`, each holding
    /// its index under `"index"`.
    pub fn populated_database(count: usize) -> TestDatabase {
        let test_db = TestDatabase::memory();
        test_db
            .db
            .in_batch(|| {
                for i in 0..count {
                    let mut doc = Document::with_id(format!("doc{i}"));
                    doc.set("index", i as i64);
                    test_db.db.save(&mut doc)?;
                }
                Ok(())
            })
            .expect("Failed to populate database");
        test_db
    }

    /// Saves a document and returns it with its revision.
    pub fn saved_document(db: &Database, id: &str, json: &str) -> Document {
        let mut doc = Document::from_json(id, json).expect("Invalid JSON body");
        db.save(&mut doc).expect("Failed to save document");
        doc
    }
}
