//! Database handle, opening and read operations.

use crate::config::DatabaseConfig;
use crate::document::{DatabaseId, Document};
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::{LockedState, StoppableTable};
use crate::notify::DeliveryQueue;
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use revdb_storage::{Revision, RevisionEngine, RevisionId, RevisionStore};
use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, info_span, warn, Span};

/// Extension of a database directory.
pub const DATABASE_EXTENSION: &str = "revdb";

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state behind every clone of a [`Database`].
pub(crate) struct DatabaseInner {
    pub(crate) id: DatabaseId,
    pub(crate) name: String,
    pub(crate) path: Option<PathBuf>,
    pub(crate) config: DatabaseConfig,
    pub(crate) span: Span,
    pub(crate) lock: ReentrantMutex<RefCell<LockedState>>,
    pub(crate) stoppables: Mutex<StoppableTable>,
    pub(crate) stoppables_drained: Condvar,
    pub(crate) queue: Arc<DeliveryQueue>,
}

impl DatabaseInner {
    /// Runs `f` inside this database's log dispatcher and span.
    pub(crate) fn logged<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.config.log_dispatch {
            Some(dispatch) => {
                tracing::dispatcher::with_default(dispatch, || self.span.in_scope(f))
            }
            None => self.span.in_scope(f),
        }
    }
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            self.logged(|| warn!(error = %err, "close on drop failed"));
        }
    }
}

/// A handle to an open database.
///
/// Cloning is cheap; clones share the lock, the store and the listeners.
/// The database closes when [`close`](Self::close) is called or the last
/// clone is dropped.
///
/// ```rust
/// use revdb_core::{Database, Document};
///
/// let db = Database::open_in_memory("example").unwrap();
/// let mut doc = Document::with_id("greeting");
/// doc.set("text", "hello");
/// db.save(&mut doc).unwrap();
///
/// let loaded = db.get_document("greeting").unwrap().unwrap();
/// assert_eq!(loaded.revision_id(), doc.revision_id());
/// db.close().unwrap();
/// ```
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DatabaseInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (or creates) `<config.directory>/<name>.revdb`.
    ///
    /// Handles opened on the same path within one process share a single
    /// revision engine and see each other's writes as external changes.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidParameter`] for an empty name
    /// - [`CoreError::CantOpenFile`] if the directory is missing and
    ///   `create_if_missing` is false, or cannot be created
    /// - [`CoreError::Storage`] if another process holds the lock or the
    ///   journal cannot be replayed
    pub fn open(name: &str, config: DatabaseConfig) -> CoreResult<Self> {
        validate_name(name)?;
        let path = database_path(name, &config.directory);
        if !path.is_dir() {
            if !config.create_if_missing {
                return Err(CoreError::CantOpenFile {
                    path,
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "database does not exist",
                    ),
                });
            }
            std::fs::create_dir_all(&path).map_err(|source| CoreError::CantOpenFile {
                path: path.clone(),
                source,
            })?;
        }
        let engine = RevisionEngine::open(&path, config.sync_on_commit)?;
        let store = engine
            .connect()
            .with_max_rev_tree_depth(config.max_rev_tree_depth);
        Self::build(name, Some(path), config, Box::new(store))
    }

    /// Opens a database held only in memory.
    ///
    /// # Errors
    ///
    /// Fails if the name is empty or the delivery worker cannot start.
    pub fn open_in_memory(name: &str) -> CoreResult<Self> {
        validate_name(name)?;
        let config = DatabaseConfig::default();
        let store = RevisionEngine::in_memory()
            .connect()
            .with_max_rev_tree_depth(config.max_rev_tree_depth);
        Self::build(name, None, config, Box::new(store))
    }

    /// Opens a database over a caller-supplied revision store.
    ///
    /// # Errors
    ///
    /// Fails if the name is empty or the delivery worker cannot start.
    pub fn open_with_store(
        name: &str,
        config: DatabaseConfig,
        store: Box<dyn RevisionStore>,
    ) -> CoreResult<Self> {
        validate_name(name)?;
        Self::build(name, None, config, store)
    }

    /// Returns true if `<directory>/<name>.revdb` exists.
    #[must_use]
    pub fn exists(name: &str, directory: impl AsRef<Path>) -> bool {
        database_path(name, directory.as_ref()).is_dir()
    }

    fn build(
        name: &str,
        path: Option<PathBuf>,
        config: DatabaseConfig,
        store: Box<dyn RevisionStore>,
    ) -> CoreResult<Self> {
        let span = match &config.log_dispatch {
            Some(dispatch) => {
                tracing::dispatcher::with_default(dispatch, || info_span!("revdb", db = %name))
            }
            None => info_span!("revdb", db = %name),
        };
        let (queue, jobs) = DeliveryQueue::new();
        let inner = Arc::new(DatabaseInner {
            id: DatabaseId(NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.to_string(),
            path,
            config,
            span,
            lock: ReentrantMutex::new(RefCell::new(LockedState::new(store))),
            stoppables: Mutex::new(StoppableTable::default()),
            stoppables_drained: Condvar::new(),
            queue: Arc::new(queue),
        });
        DeliveryQueue::start(&inner, jobs)?;
        inner.logged(|| info!(path = ?inner.path, "database opened"));
        Ok(Self { inner })
    }

    /// Runs `f` inside this database's log dispatcher and span.
    pub(crate) fn logged<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.logged(f)
    }

    /// Returns the database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the database directory, `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Returns the configuration the database was opened with.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Returns the current revision of a document, deleted or not.
    pub(crate) fn current_revision(&self, doc_id: &str) -> CoreResult<Option<Revision>> {
        self.inner.with_store(|store| store.get_current_revision(doc_id))
    }

    /// Loads a document, `None` if it is missing or deleted.
    ///
    /// # Errors
    ///
    /// Fails after close or if the stored body cannot be decoded.
    pub fn get_document(&self, doc_id: &str) -> CoreResult<Option<Document>> {
        self.logged(|| match self.current_revision(doc_id)? {
            Some(revision) if !revision.is_deleted() => {
                Document::from_revision(&revision, self.inner.id).map(Some)
            }
            _ => Ok(None),
        })
    }

    /// Loads the current revision of a document even if it is deleted.
    pub(crate) fn get_document_with_deleted(&self, doc_id: &str) -> CoreResult<Option<Document>> {
        self.current_revision(doc_id)?
            .map(|revision| Document::from_revision(&revision, self.inner.id))
            .transpose()
    }

    /// Number of live documents.
    ///
    /// # Errors
    ///
    /// Fails after close.
    pub fn count(&self) -> CoreResult<u64> {
        self.inner.with_store(|store| store.document_count())
    }

    /// Highest committed sequence.
    ///
    /// # Errors
    ///
    /// Fails after close.
    pub fn last_sequence(&self) -> CoreResult<u64> {
        self.inner.with_store(|store| store.last_sequence())
    }

    /// Ids of every stored document, deleted ones included, in id order.
    ///
    /// # Errors
    ///
    /// Fails after close.
    pub fn document_ids(&self) -> CoreResult<Vec<String>> {
        self.inner.with_store(|store| store.document_ids())
    }

    /// Ids of documents with an unresolved conflict.
    ///
    /// # Errors
    ///
    /// Fails after close.
    pub fn documents_in_conflict(&self) -> CoreResult<Vec<String>> {
        self.inner.with_store(|store| store.conflicted_document_ids())
    }

    /// Revision ids of the current revision's ancestry, newest first.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] for an unknown document.
    pub fn revision_history(&self, doc_id: &str) -> CoreResult<Vec<RevisionId>> {
        self.inner.with_store(|store| {
            let current = store
                .get_current_revision(doc_id)?
                .ok_or_else(|| revdb_storage::StorageError::NotFound(doc_id.to_string()))?;
            store.revision_history(doc_id, &current.rev_id)
        })
    }

    /// Rewrites the journal from live state.
    ///
    /// # Errors
    ///
    /// Fails inside a batch or if the rewrite fails.
    pub fn compact(&self) -> CoreResult<()> {
        self.logged(|| {
            self.inner.with_store(|store| store.compact())?;
            info!("database compacted");
            Ok(())
        })
    }

    /// Sets or clears the time after which a document is purged by
    /// [`purge_expired_documents`](Self::purge_expired_documents).
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] for an unknown document.
    pub fn set_document_expiration(
        &self,
        doc_id: &str,
        expiration: Option<SystemTime>,
    ) -> CoreResult<()> {
        let expiration = expiration.map(to_millis);
        self.logged(|| {
            self.inner.in_batch(|| {
                self.inner
                    .with_store(|store| store.set_expiration(doc_id, expiration))
            })?;
            debug!(doc_id, ?expiration, "expiration set");
            Ok(())
        })
    }

    /// Returns the expiration of a document, if any.
    ///
    /// # Errors
    ///
    /// Fails after close.
    pub fn get_document_expiration(&self, doc_id: &str) -> CoreResult<Option<SystemTime>> {
        let millis = self.inner.with_store(|store| store.get_expiration(doc_id))?;
        Ok(millis.map(|ms| UNIX_EPOCH + Duration::from_millis(ms)))
    }

    /// Purges every document whose expiration has passed, in one batch.
    /// Returns how many were purged.
    ///
    /// # Errors
    ///
    /// Fails after close or if the batch cannot commit.
    pub fn purge_expired_documents(&self) -> CoreResult<usize> {
        let now = to_millis(SystemTime::now());
        self.logged(|| {
            let purged = self
                .inner
                .in_batch(|| self.inner.with_store(|store| store.purge_expired(now)))?;
            if !purged.is_empty() {
                info!(count = purged.len(), "expired documents purged");
            }
            Ok(purged.len())
        })
    }
}

fn validate_name(name: &str) -> CoreResult<()> {
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(CoreError::invalid_parameter(format!(
            "invalid database name {name:?}"
        )));
    }
    Ok(())
}

fn database_path(name: &str, directory: &Path) -> PathBuf {
    directory.join(format!("{name}.{DATABASE_EXTENSION}"))
}

fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::new().directory(dir.path());
        assert!(!Database::exists("db", dir.path()));

        let db = Database::open("db", config).unwrap();
        assert!(Database::exists("db", dir.path()));
        assert_eq!(db.path(), Some(dir.path().join("db.revdb").as_path()));
        assert_eq!(db.name(), "db");
        db.close().unwrap();
    }

    #[test]
    fn open_missing_without_create_fails() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::new()
            .directory(dir.path())
            .create_if_missing(false);
        assert!(matches!(
            Database::open("db", config),
            Err(CoreError::CantOpenFile { .. })
        ));
    }

    #[test]
    fn invalid_names_rejected() {
        assert!(matches!(
            Database::open_in_memory(""),
            Err(CoreError::InvalidParameter { .. })
        ));
        assert!(matches!(
            Database::open_in_memory("a/b"),
            Err(CoreError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn documents_survive_reopen() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::new().directory(dir.path());
        let rev = {
            let db = Database::open("db", config.clone()).unwrap();
            let mut doc = Document::with_id("a");
            doc.set("n", 1);
            db.save(&mut doc).unwrap();
            db.close().unwrap();
            doc.revision_id().cloned()
        };

        let db = Database::open("db", config).unwrap();
        let doc = db.get_document("a").unwrap().unwrap();
        assert_eq!(doc.revision_id().cloned(), rev);
        assert_eq!(doc.get("n"), Some(&revdb_codec::Value::Integer(1)));
        assert_eq!(db.last_sequence().unwrap(), 1);
    }

    #[test]
    fn reads_and_history() {
        let db = Database::open_in_memory("reads").unwrap();
        assert!(db.get_document("missing").unwrap().is_none());

        let mut doc = Document::with_id("a");
        db.save(&mut doc).unwrap();
        doc.set("n", 2);
        db.save(&mut doc).unwrap();

        let history = db.revision_history("a").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(Some(&history[0]), doc.revision_id());
        assert_eq!(db.document_ids().unwrap(), vec!["a".to_string()]);
        assert!(db.documents_in_conflict().unwrap().is_empty());
        assert!(db.revision_history("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn expiration_purges_due_documents() {
        let db = Database::open_in_memory("expiry").unwrap();
        db.save(&mut Document::with_id("old")).unwrap();
        db.save(&mut Document::with_id("new")).unwrap();

        let past = SystemTime::now() - Duration::from_secs(60);
        let future = SystemTime::now() + Duration::from_secs(3600);
        db.set_document_expiration("old", Some(past)).unwrap();
        db.set_document_expiration("new", Some(future)).unwrap();
        assert!(db.get_document_expiration("new").unwrap().is_some());

        assert_eq!(db.purge_expired_documents().unwrap(), 1);
        assert!(db.get_document("old").unwrap().is_none());
        assert!(db.get_document("new").unwrap().is_some());

        db.set_document_expiration("new", None).unwrap();
        assert!(db.get_document_expiration("new").unwrap().is_none());
        assert!(db
            .set_document_expiration("missing", Some(past))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn compact_keeps_documents() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::new().directory(dir.path());
        let db = Database::open("db", config.clone()).unwrap();
        let mut doc = Document::with_id("a");
        for n in 0..5 {
            doc.set("n", n);
            db.save(&mut doc).unwrap();
        }
        db.compact().unwrap();
        db.close().unwrap();

        let db = Database::open("db", config).unwrap();
        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(db.get_document("a").unwrap().unwrap().generation(), 5);
    }

    #[test]
    fn drop_closes_database() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::new().directory(dir.path());
        drop(Database::open("db", config.clone()).unwrap());
        let db = Database::open("db", config).unwrap();
        db.close().unwrap();
    }
}
