//! # revdb Storage
//!
//! The revision store behind a revdb database.
//!
//! Documents are kept as revision trees ([`RevTree`]). A [`RevisionEngine`]
//! owns the committed trees, appends every committed transaction to a
//! [`Journal`] and keeps a change log for observers. Callers work through
//! connections that implement [`RevisionStore`]:
//!
//! - single writer at a time, staged writes applied atomically on commit
//! - stale bases are reported as [`PutOutcome::Conflict`], not errors
//! - conflicting siblings stay queryable until resolved
//!
//! ## Example
//!
//! ```rust
//! use revdb_storage::{PutOutcome, RevisionEngine, RevisionFlags, RevisionStore};
//!
//! let engine = RevisionEngine::in_memory();
//! let mut conn = engine.connect();
//! conn.begin_transaction().unwrap();
//! let outcome = conn.create_revision("doc", vec![0xa0], RevisionFlags::NONE).unwrap();
//! conn.end_transaction(true).unwrap();
//! assert!(matches!(outcome, PutOutcome::Created(_)));
//! assert_eq!(conn.document_count().unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod engine;
mod error;
mod file;
mod journal;
mod memory;
mod observer;
mod record;
mod revision;
mod store;
mod tree;

pub use connection::EngineConnection;
pub use engine::{RevisionEngine, AUTO_COMPACT_MIN_BYTES, JOURNAL_FILE, LOCK_FILE};
pub use error::{StorageError, StorageResult};
pub use file::FileJournal;
pub use journal::Journal;
pub use memory::MemoryJournal;
pub use observer::{EngineChangeObserver, EngineDocumentObserver};
pub use record::{compute_crc32, replay, JournalRecord, Replay, JOURNAL_MAGIC, MAX_FRAME_LEN};
pub use revision::{Revision, RevisionFlags, RevisionId};
pub use store::{
    ChangeBatch, ChangeCallback, ChangeEntry, ChangeObserver, DocumentCallback, DocumentObserver,
    InsertOutcome, PutOutcome, ResolveOutcome, RevisionStore,
};
pub use tree::{RevNode, RevTree, DEFAULT_MAX_REV_TREE_DEPTH};
