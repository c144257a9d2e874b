//! # revdb Core
//!
//! Document database core over a revision store.
//!
//! This crate provides:
//! - optimistic saves with last-write-wins, fail-on-conflict and
//!   caller-mediated merge modes
//! - conflict resolution that keeps the remote revision in the ancestry
//! - atomic, nestable batches
//! - change notifications delivered in bounded, single-origin batches on a
//!   dedicated worker
//! - a close that waits for registered stoppables
//!
//! ## Example
//!
//! ```rust
//! use revdb_core::{ConcurrencyControl, Database, Document};
//!
//! let db = Database::open_in_memory("example").unwrap();
//! let mut doc = Document::with_id("x");
//! doc.set("a", 1);
//! db.save(&mut doc).unwrap();
//! assert_eq!(db.count().unwrap(), 1);
//!
//! let mut stale = db.get_document("x").unwrap().unwrap();
//! doc.set("a", 2);
//! db.save(&mut doc).unwrap();
//! stale.set("a", 3);
//! let saved = db
//!     .save_with_concurrency(&mut stale, ConcurrencyControl::FailOnConflict)
//!     .unwrap();
//! assert!(!saved);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod config;
mod conflict;
mod database;
mod document;
mod error;
mod lifecycle;
mod notify;
mod save;

pub use config::DatabaseConfig;
pub use conflict::{Conflict, ConflictResolver, DefaultConflictResolver};
pub use database::{Database, DATABASE_EXTENSION};
pub use document::Document;
pub use error::{CoreError, CoreResult};
pub use lifecycle::{DatabaseState, Stoppable, StoppableToken};
pub use notify::{DatabaseChange, DocumentChange, ListenerKind, ListenerToken, Scheduler};
pub use save::ConcurrencyControl;

pub use revdb_codec::{Dict, Value};
pub use revdb_storage::{RevisionFlags, RevisionId, RevisionStore};

/// Version of the core crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
