//! The shared revision engine.
//!
//! One engine owns the committed document trees, the journal and the change
//! log. Any number of [`EngineConnection`]s read from it and take turns as
//! the single writer. Engines opened on the same directory within a process
//! are shared, so writes through one connection show up as external changes
//! on the others.
//!
//! ## Directory layout
//!
//! ```text
//! <name>.revdb/
//! ├─ LOCK                # advisory lock, held while the engine is alive
//! └─ revisions.journal   # append-only commit journal
//! ```

use crate::connection::EngineConnection;
use crate::error::{StorageError, StorageResult};
use crate::file::FileJournal;
use crate::journal::Journal;
use crate::memory::MemoryJournal;
use crate::record::{self, JournalRecord};
use crate::store::{ChangeBatch, ChangeEntry};
use crate::tree::RevTree;
use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Lock file name inside a database directory.
pub const LOCK_FILE: &str = "LOCK";

/// Journal file name inside a database directory.
pub const JOURNAL_FILE: &str = "revisions.journal";

/// Journal size below which commits never trigger compaction.
pub const AUTO_COMPACT_MIN_BYTES: u64 = 4 * 1024 * 1024;

/// A commit compacts once the journal outgrows its last compacted size by
/// this factor.
const AUTO_COMPACT_RATIO: u64 = 4;

pub(crate) type ConnId = u64;

pub(crate) type SharedChangeCallback = Arc<dyn Fn() + Send + Sync>;
pub(crate) type SharedDocumentCallback = Arc<dyn Fn(&str, u64) + Send + Sync>;

static REGISTRY: Mutex<BTreeMap<PathBuf, Weak<EngineShared>>> =
    parking_lot::const_mutex(BTreeMap::new());

/// A change staged by a transaction.
#[derive(Debug, Clone)]
pub(crate) enum Staged {
    Tree(RevTree),
    Purged,
}

/// Writes of one open transaction, applied as a unit on commit.
#[derive(Debug)]
pub(crate) struct PendingTransaction {
    pub(crate) staged: BTreeMap<String, Staged>,
    pub(crate) changes: Vec<ChangeEntry>,
    pub(crate) next_sequence: u64,
}

impl PendingTransaction {
    fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    fn to_record(&self) -> JournalRecord {
        let mut trees = Vec::new();
        let mut purged = Vec::new();
        for (doc_id, staged) in &self.staged {
            match staged {
                Staged::Tree(tree) => trees.push(tree.clone()),
                Staged::Purged => purged.push(doc_id.clone()),
            }
        }
        JournalRecord::Commit {
            last_sequence: self.next_sequence - 1,
            trees,
            purged,
        }
    }
}

struct LoggedChange {
    origin: ConnId,
    entry: ChangeEntry,
}

struct DbObserverSlot {
    origin: ConnId,
    cursor: u64,
    signalled: bool,
    callback: SharedChangeCallback,
}

struct DocObserverSlot {
    doc_id: String,
    callback: SharedDocumentCallback,
}

/// Callbacks collected under the state lock and fired after it is released.
#[derive(Default)]
#[must_use]
pub(crate) struct Notifications {
    database: Vec<SharedChangeCallback>,
    documents: Vec<(SharedDocumentCallback, String, u64)>,
}

impl Notifications {
    pub(crate) fn fire(self) {
        for callback in self.database {
            callback();
        }
        for (callback, doc_id, sequence) in self.documents {
            callback(&doc_id, sequence);
        }
    }
}

pub(crate) struct EngineState {
    pub(crate) docs: BTreeMap<String, RevTree>,
    pub(crate) last_sequence: u64,
    journal: Box<dyn Journal>,
    sync_on_commit: bool,
    compacted_len: u64,
    auto_compact_min: u64,
    log_base: u64,
    log: VecDeque<LoggedChange>,
    db_observers: BTreeMap<u64, DbObserverSlot>,
    doc_observers: BTreeMap<u64, DocObserverSlot>,
    next_observer: u64,
}

impl EngineState {
    fn write_frame(&mut self, frame: &[u8]) -> StorageResult<()> {
        let before = self.journal.size()?;
        let written = self.journal.append(frame).and_then(|_| {
            if self.sync_on_commit {
                self.journal.sync()
            } else {
                self.journal.flush()
            }
        });
        if let Err(err) = written {
            tracing::error!(error = %err, "journal append failed, rolling back");
            if let Err(cut) = self.journal.truncate(before) {
                warn!(error = %cut, "could not cut partial journal frame");
            }
            return Err(err);
        }
        Ok(())
    }

    fn apply(&mut self, origin: ConnId, pending: PendingTransaction) -> Notifications {
        for (doc_id, staged) in pending.staged {
            match staged {
                Staged::Tree(tree) => {
                    self.docs.insert(doc_id, tree);
                }
                Staged::Purged => {
                    self.docs.remove(&doc_id);
                }
            }
        }
        self.last_sequence = self.last_sequence.max(pending.next_sequence - 1);

        let mut notes = Notifications::default();
        if pending.changes.is_empty() {
            return notes;
        }
        for slot in self.db_observers.values_mut() {
            if !slot.signalled {
                slot.signalled = true;
                notes.database.push(Arc::clone(&slot.callback));
            }
        }
        for entry in &pending.changes {
            for slot in self.doc_observers.values() {
                if slot.doc_id == entry.doc_id {
                    notes.documents.push((
                        Arc::clone(&slot.callback),
                        entry.doc_id.clone(),
                        entry.sequence,
                    ));
                }
            }
        }
        if self.db_observers.is_empty() {
            self.log_base += self.log.len() as u64;
            self.log.clear();
        } else {
            self.log.extend(
                pending
                    .changes
                    .into_iter()
                    .map(|entry| LoggedChange { origin, entry }),
            );
        }
        notes
    }

    fn log_end(&self) -> u64 {
        self.log_base + self.log.len() as u64
    }

    fn trim_log(&mut self) {
        let keep_from = self
            .db_observers
            .values()
            .map(|slot| slot.cursor)
            .min()
            .unwrap_or_else(|| self.log_end());
        while self.log_base < keep_from && self.log.pop_front().is_some() {
            self.log_base += 1;
        }
    }

    fn drain(&mut self, observer: u64, max: usize) -> ChangeBatch {
        let log_end = self.log_end();
        let Some(slot) = self.db_observers.get_mut(&observer) else {
            return ChangeBatch::default();
        };

        let start = usize::try_from(slot.cursor - self.log_base).unwrap_or(usize::MAX);
        let mut batch = ChangeBatch::default();
        let mut origin: Option<bool> = None;
        for logged in self.log.iter().skip(start).take(max) {
            let external = logged.origin != slot.origin;
            if origin.is_some_and(|seen| seen != external) {
                break;
            }
            origin = Some(external);
            batch.entries.push(logged.entry.clone());
        }
        batch.external = origin.unwrap_or(false);
        slot.cursor += batch.entries.len() as u64;
        if slot.cursor >= log_end {
            slot.signalled = false;
        }
        self.trim_log();
        batch
    }

    fn snapshot(&self) -> JournalRecord {
        JournalRecord::Snapshot {
            last_sequence: self.last_sequence,
            trees: self.docs.values().cloned().collect(),
        }
    }

    fn compact(&mut self) -> StorageResult<()> {
        let frame = self.snapshot().encode_frame()?;
        let before = self.journal.size()?;
        self.journal.replace(&frame)?;
        self.compacted_len = frame.len() as u64;
        info!(
            before,
            after = frame.len(),
            documents = self.docs.len(),
            "journal compacted"
        );
        Ok(())
    }

    fn wants_compaction(&self) -> StorageResult<bool> {
        let limit = self
            .compacted_len
            .saturating_mul(AUTO_COMPACT_RATIO)
            .max(self.auto_compact_min);
        Ok(self.journal.size()? > limit)
    }
}

pub(crate) struct EngineShared {
    pub(crate) state: Mutex<EngineState>,
    writer: Mutex<Option<ConnId>>,
    writer_released: Condvar,
    next_connection: AtomicU64,
    location: Option<PathBuf>,
    _lock_file: Option<File>,
}

impl EngineShared {
    pub(crate) fn acquire_writer(&self, conn: ConnId) {
        let mut writer = self.writer.lock();
        while writer.is_some() {
            self.writer_released.wait(&mut writer);
        }
        *writer = Some(conn);
    }

    pub(crate) fn release_writer(&self, conn: ConnId) {
        let mut writer = self.writer.lock();
        if *writer == Some(conn) {
            *writer = None;
            self.writer_released.notify_one();
        }
    }

    /// Writes and applies a transaction. The caller still holds the writer.
    pub(crate) fn commit(
        &self,
        conn: ConnId,
        pending: PendingTransaction,
    ) -> StorageResult<Notifications> {
        if pending.is_empty() {
            return Ok(Notifications::default());
        }
        let frame = pending.to_record().encode_frame()?;
        let mut state = self.state.lock();
        state.write_frame(&frame)?;
        debug!(
            documents = pending.staged.len(),
            last_sequence = pending.next_sequence - 1,
            "transaction committed"
        );
        let notes = state.apply(conn, pending);
        // The commit is already durable; a failed compaction only leaves
        // the journal long.
        match state.wants_compaction() {
            Ok(true) => {
                if let Err(err) = state.compact() {
                    warn!(error = %err, "automatic journal compaction failed");
                }
            }
            Ok(false) => {}
            Err(err) => warn!(error = %err, "could not read journal size"),
        }
        Ok(notes)
    }

    pub(crate) fn compact(&self) -> StorageResult<()> {
        self.state.lock().compact()
    }

    pub(crate) fn register_db_observer(&self, origin: ConnId, callback: SharedChangeCallback) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_observer;
        state.next_observer += 1;
        let cursor = state.log_end();
        state.db_observers.insert(
            id,
            DbObserverSlot {
                origin,
                cursor,
                signalled: false,
                callback,
            },
        );
        id
    }

    pub(crate) fn unregister_db_observer(&self, id: u64) {
        let mut state = self.state.lock();
        state.db_observers.remove(&id);
        state.trim_log();
    }

    pub(crate) fn drain(&self, id: u64, max: usize) -> ChangeBatch {
        self.state.lock().drain(id, max)
    }

    pub(crate) fn register_doc_observer(
        &self,
        doc_id: &str,
        callback: SharedDocumentCallback,
    ) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_observer;
        state.next_observer += 1;
        state.doc_observers.insert(
            id,
            DocObserverSlot {
                doc_id: doc_id.to_string(),
                callback,
            },
        );
        id
    }

    pub(crate) fn unregister_doc_observer(&self, id: u64) {
        self.state.lock().doc_observers.remove(&id);
    }
}

/// Handle to a shared revision engine.
#[derive(Clone)]
pub struct RevisionEngine {
    shared: Arc<EngineShared>,
}

impl RevisionEngine {
    /// Opens (or joins) the engine stored in `dir`.
    ///
    /// The directory is created if needed. Within one process every call for
    /// the same directory returns the same engine; across processes the
    /// `LOCK` file keeps a second engine out. `sync_on_commit` applies only
    /// when this call creates the engine.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Locked`] if another process holds the directory
    /// - [`StorageError::Corrupted`] if the journal is damaged before its tail
    /// - [`StorageError::Io`] on filesystem failures
    pub fn open(dir: &Path, sync_on_commit: bool) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        let dir = dir.canonicalize()?;

        let mut registry = REGISTRY.lock();
        registry.retain(|_, weak| weak.strong_count() > 0);
        if let Some(shared) = registry.get(&dir).and_then(Weak::upgrade) {
            debug!(path = %dir.display(), "joining open revision engine");
            return Ok(Self { shared });
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        let journal = FileJournal::open(&dir.join(JOURNAL_FILE))?;
        let state = load_state(Box::new(journal), sync_on_commit)?;
        let shared = Arc::new(EngineShared {
            state: Mutex::new(state),
            writer: Mutex::new(None),
            writer_released: Condvar::new(),
            next_connection: AtomicU64::new(1),
            location: Some(dir.clone()),
            _lock_file: Some(lock_file),
        });
        registry.insert(dir, Arc::downgrade(&shared));
        Ok(Self { shared })
    }

    /// Creates a private engine with an in-memory journal.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_state(empty_state(Box::new(MemoryJournal::new()), false))
    }

    /// Creates a private engine over an arbitrary journal, replaying it.
    ///
    /// # Errors
    ///
    /// Fails if the journal cannot be read or is corrupted.
    pub fn with_journal(journal: Box<dyn Journal>, sync_on_commit: bool) -> StorageResult<Self> {
        Ok(Self::from_state(load_state(journal, sync_on_commit)?))
    }

    fn from_state(state: EngineState) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(state),
                writer: Mutex::new(None),
                writer_released: Condvar::new(),
                next_connection: AtomicU64::new(1),
                location: None,
                _lock_file: None,
            }),
        }
    }

    /// Opens a new connection.
    #[must_use]
    pub fn connect(&self) -> EngineConnection {
        let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
        EngineConnection::new(Arc::clone(&self.shared), id)
    }

    /// Returns the engine directory, `None` for in-memory engines.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.shared.location.as_deref()
    }

    /// Returns the committed journal size in bytes.
    ///
    /// # Errors
    ///
    /// Fails if the journal size cannot be read.
    pub fn journal_size(&self) -> StorageResult<u64> {
        self.shared.state.lock().journal.size()
    }

    /// Sets the journal size below which commits never trigger compaction.
    ///
    /// Above it, a commit rewrites the journal as a snapshot once the journal
    /// is several times larger than it was after the last compaction.
    /// Defaults to [`AUTO_COMPACT_MIN_BYTES`].
    pub fn set_auto_compact_min_bytes(&self, bytes: u64) {
        self.shared.state.lock().auto_compact_min = bytes;
    }
}

impl std::fmt::Debug for RevisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionEngine")
            .field("path", &self.shared.location)
            .finish_non_exhaustive()
    }
}

fn load_state(mut journal: Box<dyn Journal>, sync_on_commit: bool) -> StorageResult<EngineState> {
    let image = journal.read_all()?;
    let replayed = record::replay(&image)?;
    if replayed.has_torn_tail(image.len() as u64) {
        warn!(
            valid = replayed.valid_len,
            total = image.len(),
            "truncating torn journal tail"
        );
        journal.truncate(replayed.valid_len)?;
    }

    let mut docs = BTreeMap::new();
    let mut last_sequence = 0;
    for record in replayed.records {
        match record {
            JournalRecord::Commit {
                last_sequence: seq,
                trees,
                purged,
            } => {
                for doc_id in purged {
                    docs.remove(&doc_id);
                }
                for tree in trees {
                    docs.insert(tree.doc_id().to_string(), tree);
                }
                last_sequence = seq;
            }
            JournalRecord::Snapshot {
                last_sequence: seq,
                trees,
            } => {
                docs = trees
                    .into_iter()
                    .map(|tree| (tree.doc_id().to_string(), tree))
                    .collect();
                last_sequence = seq;
            }
        }
    }
    info!(documents = docs.len(), last_sequence, "revision journal loaded");

    let mut state = empty_state(journal, sync_on_commit);
    state.docs = docs;
    state.last_sequence = last_sequence;
    state.compacted_len = replayed.valid_len;
    Ok(state)
}

fn empty_state(journal: Box<dyn Journal>, sync_on_commit: bool) -> EngineState {
    EngineState {
        docs: BTreeMap::new(),
        last_sequence: 0,
        journal,
        sync_on_commit,
        compacted_len: 0,
        auto_compact_min: AUTO_COMPACT_MIN_BYTES,
        log_base: 0,
        log: VecDeque::new(),
        db_observers: BTreeMap::new(),
        doc_observers: BTreeMap::new(),
        next_observer: 1,
    }
}
