//! The revision store capability set consumed by the database core.

use crate::error::StorageResult;
use crate::revision::{Revision, RevisionFlags, RevisionId};

/// Outcome of creating or updating a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The revision was staged in the current transaction.
    Created(Revision),
    /// The base revision is stale or the document already exists.
    Conflict,
}

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The conflict was resolved; carries the new current revision.
    Resolved(Revision),
    /// Another writer changed the document first.
    Conflict,
}

/// Outcome of inserting a replicated revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The revision was added. `conflict` is set if it opened a sibling branch.
    Inserted {
        /// The inserted revision.
        revision: Revision,
        /// Whether the revision conflicts with the current one.
        conflict: bool,
    },
    /// The revision was already present.
    AlreadyPresent,
}

/// One entry of the change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Changed document.
    pub doc_id: String,
    /// New current revision, `None` after a purge.
    pub rev_id: Option<RevisionId>,
    /// Sequence of the change.
    pub sequence: u64,
    /// Flags of the new current revision.
    pub flags: RevisionFlags,
}

/// A page of changes drained from a [`ChangeObserver`].
///
/// Every entry in a batch has the same origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    /// Entries in commit order.
    pub entries: Vec<ChangeEntry>,
    /// True if the changes were committed through another connection.
    pub external: bool,
}

impl ChangeBatch {
    /// Returns true if the batch holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Callback fired (outside any store lock) when new changes are available.
pub type ChangeCallback = Box<dyn Fn() + Send + Sync>;

/// Callback fired with `(doc_id, sequence)` when an observed document changes.
pub type DocumentCallback = Box<dyn Fn(&str, u64) + Send + Sync>;

/// A database-wide change observer.
///
/// The callback fires once when changes become available and is not fired
/// again until the observer has been drained empty. Dropping the observer
/// unregisters it.
pub trait ChangeObserver: Send {
    /// Takes up to `max` pending changes sharing one origin.
    fn drain(&mut self, max: usize) -> ChangeBatch;
}

/// A single-document change observer. Dropping it unregisters it.
pub trait DocumentObserver: Send {
    /// Returns the observed document id.
    fn doc_id(&self) -> &str;
}

/// Transactional access to a revision store.
///
/// Mutations must run inside [`begin_transaction`](Self::begin_transaction)
/// and [`end_transaction`](Self::end_transaction); reads inside a
/// transaction see its staged writes.
pub trait RevisionStore: Send {
    /// Starts a transaction, waiting for any other writer to finish.
    ///
    /// # Errors
    ///
    /// Fails if a transaction is already active or the store is closed.
    fn begin_transaction(&mut self) -> StorageResult<()>;

    /// Commits (`commit == true`) or rolls back the active transaction.
    ///
    /// # Errors
    ///
    /// Fails if no transaction is active or the journal write fails; on
    /// failure nothing is applied.
    fn end_transaction(&mut self, commit: bool) -> StorageResult<()>;

    /// Returns true if a transaction is active.
    fn in_transaction(&self) -> bool;

    /// Creates the first revision of a document, or recreates a deleted one.
    ///
    /// # Errors
    ///
    /// Fails outside a transaction.
    fn create_revision(
        &mut self,
        doc_id: &str,
        body: Vec<u8>,
        flags: RevisionFlags,
    ) -> StorageResult<PutOutcome>;

    /// Adds a revision on top of `base`.
    ///
    /// # Errors
    ///
    /// Fails outside a transaction.
    fn update_revision(
        &mut self,
        doc_id: &str,
        base: &RevisionId,
        body: Vec<u8>,
        flags: RevisionFlags,
    ) -> StorageResult<PutOutcome>;

    /// Returns the current revision of a document.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed.
    fn get_current_revision(&self, doc_id: &str) -> StorageResult<Option<Revision>>;

    /// Returns the unresolved conflicting revision of a document, if any.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed.
    fn get_conflicting_revision(&self, doc_id: &str) -> StorageResult<Option<Revision>>;

    /// Resolves a conflict: `winning` stays in the ancestry of the new
    /// current revision, `losing` is closed. With `merged_body` a new child of
    /// `winning` carries the merged content.
    ///
    /// Returns [`ResolveOutcome::Conflict`] if `local` is no longer current or
    /// either side is no longer an open leaf.
    ///
    /// # Errors
    ///
    /// Fails outside a transaction or if the document does not exist.
    fn resolve_conflict(
        &mut self,
        doc_id: &str,
        local: &RevisionId,
        winning: &RevisionId,
        losing: &RevisionId,
        merged_body: Option<Vec<u8>>,
        merged_flags: RevisionFlags,
    ) -> StorageResult<ResolveOutcome>;

    /// Inserts a revision with its ancestry (newest first).
    ///
    /// # Errors
    ///
    /// Fails outside a transaction or on a malformed history.
    fn insert_existing_revision(
        &mut self,
        doc_id: &str,
        history: &[RevisionId],
        body: Vec<u8>,
        flags: RevisionFlags,
    ) -> StorageResult<InsertOutcome>;

    /// Returns the ancestry of `rev_id`, newest first.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if the document or revision is unknown.
    fn revision_history(&self, doc_id: &str, rev_id: &RevisionId)
        -> StorageResult<Vec<RevisionId>>;

    /// Removes a document and its whole revision tree.
    ///
    /// # Errors
    ///
    /// Fails outside a transaction, or with `NotFound` if the document does
    /// not exist.
    fn purge(&mut self, doc_id: &str) -> StorageResult<()>;

    /// Sets or clears the expiration (milliseconds since the Unix epoch).
    ///
    /// # Errors
    ///
    /// Fails outside a transaction, or with `NotFound` if the document does
    /// not exist.
    fn set_expiration(&mut self, doc_id: &str, expiration: Option<u64>) -> StorageResult<()>;

    /// Returns the expiration of a document.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed.
    fn get_expiration(&self, doc_id: &str) -> StorageResult<Option<u64>>;

    /// Purges every document whose expiration is at or before `now_ms` and
    /// returns their ids.
    ///
    /// # Errors
    ///
    /// Fails outside a transaction.
    fn purge_expired(&mut self, now_ms: u64) -> StorageResult<Vec<String>>;

    /// Number of live (non-deleted) documents.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed.
    fn document_count(&self) -> StorageResult<u64>;

    /// Highest committed sequence.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed.
    fn last_sequence(&self) -> StorageResult<u64>;

    /// Ids of every document, including deleted ones, in id order.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed.
    fn document_ids(&self) -> StorageResult<Vec<String>>;

    /// Ids of documents with an unresolved conflict.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed.
    fn conflicted_document_ids(&self) -> StorageResult<Vec<String>>;

    /// Registers a database-wide change observer.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed.
    fn observe_database(&mut self, callback: ChangeCallback)
        -> StorageResult<Box<dyn ChangeObserver>>;

    /// Registers an observer for one document.
    ///
    /// # Errors
    ///
    /// Fails if the store is closed.
    fn observe_document(
        &mut self,
        doc_id: &str,
        callback: DocumentCallback,
    ) -> StorageResult<Box<dyn DocumentObserver>>;

    /// Rewrites the journal from live state.
    ///
    /// # Errors
    ///
    /// Fails inside a transaction or if the rewrite fails.
    fn compact(&mut self) -> StorageResult<()>;

    /// Closes the store, rolling back any active transaction.
    ///
    /// # Errors
    ///
    /// Fails if the rollback fails.
    fn close(&mut self) -> StorageResult<()>;
}
