//! Database configuration.

use revdb_storage::DEFAULT_MAX_REV_TREE_DEPTH;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Dispatch;

/// Configuration for opening a database. Frozen once the database is open.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Parent directory of the `<name>.revdb` database directory.
    pub directory: PathBuf,

    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to sync the journal on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// How often `close()` logs while waiting for active stoppables.
    pub close_poll_interval: Duration,

    /// Maximum number of changes drained from the store at once.
    pub change_page_size: usize,

    /// Maximum number of document ids carried by one change event.
    pub max_change_batch: usize,

    /// Revisions kept along each branch of a document's history. Older
    /// ancestors are pruned when the document is written.
    pub max_rev_tree_depth: usize,

    /// Logging sink for this database. `None` uses the process default.
    pub log_dispatch: Option<Dispatch>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            create_if_missing: true,
            sync_on_commit: true,
            close_poll_interval: Duration::from_secs(5),
            change_page_size: 100,
            max_change_batch: 1000,
            max_rev_tree_depth: DEFAULT_MAX_REV_TREE_DEPTH,
            log_dispatch: None,
        }
    }
}

impl DatabaseConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the parent directory.
    #[must_use]
    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the journal on every commit.
    #[must_use]
    pub fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the close-drain diagnostic interval.
    #[must_use]
    pub fn close_poll_interval(mut self, interval: Duration) -> Self {
        self.close_poll_interval = interval;
        self
    }

    /// Sets the change page size (at least 1).
    #[must_use]
    pub fn change_page_size(mut self, size: usize) -> Self {
        self.change_page_size = size.max(1);
        self
    }

    /// Sets the maximum ids per change event (at least 1).
    #[must_use]
    pub fn max_change_batch(mut self, size: usize) -> Self {
        self.max_change_batch = size.max(1);
        self
    }

    /// Sets how many revisions each branch keeps (at least 1).
    #[must_use]
    pub fn max_rev_tree_depth(mut self, depth: usize) -> Self {
        self.max_rev_tree_depth = depth.max(1);
        self
    }

    /// Routes this database's logs to `dispatch`.
    #[must_use]
    pub fn log_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.log_dispatch = Some(dispatch);
        self
    }

    /// Page size actually used when draining: never above the batch bound.
    pub(crate) fn effective_page_size(&self) -> usize {
        self.change_page_size.min(self.max_change_batch).max(1)
    }
}
