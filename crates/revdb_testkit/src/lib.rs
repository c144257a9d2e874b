//! # revdb Testkit
//!
//! Test utilities for revdb.
//!
//! This crate provides:
//! - Test fixtures and database helpers
//! - A remote peer that injects conflicting revisions
//! - Fake stoppables for close-drain tests
//! - Change recorders for notification tests
//! - Crash simulation for journal recovery
//! - Property-based test generators using proptest
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust
//! use revdb_testkit::prelude::*;
//!
//! let test_db = TestDatabase::memory();
//! let recorder = ChangeRecorder::new();
//! recorder.listen(&test_db);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod peer;
pub mod recorder;
pub mod stoppable;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::peer::*;
    pub use crate::recorder::*;
    pub use crate::stoppable::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use peer::*;
pub use recorder::*;
pub use stoppable::*;
pub use stress::*;
