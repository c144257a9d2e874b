//! Crash simulation for journal recovery tests.
//!
//! [`CrashableJournal`] wraps a [`MemoryJournal`] and can be told to fail
//! part-way through a write or on sync. The bytes present at the moment of
//! the crash are captured so a test can replay them into a fresh engine, as
//! a process restart would.
//!
//! ## Usage
//!
//! ```rust
//! use revdb_testkit::crash::CrashableJournal;
//!
//! let (journal, switch) = CrashableJournal::new();
//! switch.crash_after(10);
//! // hand `journal` to RevisionEngine::with_journal, write, then
//! // replay `switch.image_at_crash()`
//! # drop(journal);
//! ```

use revdb_core::{Database, DatabaseConfig};
use revdb_storage::{Journal, MemoryJournal, RevisionEngine, StorageError, StorageResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared controls of a [`CrashableJournal`].
#[derive(Debug)]
pub struct CrashSwitch {
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    crashed: AtomicBool,
    fail_on_sync: AtomicBool,
    image: Mutex<Option<Vec<u8>>>,
}

impl CrashSwitch {
    /// Crashes once `bytes` more bytes have been written.
    pub fn crash_after(&self, bytes: usize) {
        let written = self.bytes_written.load(Ordering::SeqCst);
        self.crash_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Sets whether flush and sync should fail.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Clears the crash state so writes succeed again.
    pub fn reset(&self) {
        self.crash_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.fail_on_sync.store(false, Ordering::SeqCst);
    }

    /// Returns whether a crash was simulated.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Journal bytes as they were when the crash happened.
    pub fn image_at_crash(&self) -> Option<Vec<u8>> {
        self.image.lock().clone()
    }

    fn crash(&self, image: &[u8]) -> StorageError {
        self.crashed.store(true, Ordering::SeqCst);
        *self.image.lock() = Some(image.to_vec());
        StorageError::Io(std::io::Error::other("simulated crash"))
    }
}

/// A memory journal that fails on command.
#[derive(Debug)]
pub struct CrashableJournal {
    inner: MemoryJournal,
    switch: Arc<CrashSwitch>,
}

impl CrashableJournal {
    /// Creates an empty journal and its switch.
    pub fn new() -> (Self, Arc<CrashSwitch>) {
        let switch = Arc::new(CrashSwitch {
            crash_after_bytes: AtomicUsize::new(usize::MAX),
            bytes_written: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            fail_on_sync: AtomicBool::new(false),
            image: Mutex::new(None),
        });
        let journal = Self {
            inner: MemoryJournal::new(),
            switch: Arc::clone(&switch),
        };
        (journal, switch)
    }
}

impl Journal for CrashableJournal {
    fn read_all(&mut self) -> StorageResult<Vec<u8>> {
        self.inner.read_all()
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let written = self.switch.bytes_written.load(Ordering::SeqCst);
        let threshold = self.switch.crash_after_bytes.load(Ordering::SeqCst);
        if written >= threshold {
            return Err(self.switch.crash(self.inner.data()));
        }
        if written + data.len() > threshold {
            let partial = threshold - written;
            self.inner.append(&data[..partial])?;
            self.switch.bytes_written.store(threshold, Ordering::SeqCst);
            return Err(self.switch.crash(self.inner.data()));
        }
        self.switch
            .bytes_written
            .fetch_add(data.len(), Ordering::SeqCst);
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.switch.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.switch.crash(self.inner.data()));
        }
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.switch.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.switch.crash(self.inner.data()));
        }
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        self.inner.replace(data)
    }
}

/// Opens a database over a crashable journal.
pub fn crashable_database(name: &str) -> (Database, Arc<CrashSwitch>) {
    let (journal, switch) = CrashableJournal::new();
    let engine =
        RevisionEngine::with_journal(Box::new(journal), true).expect("Failed to open engine");
    let db = Database::open_with_store(name, DatabaseConfig::default(), Box::new(engine.connect()))
        .expect("Failed to open database");
    (db, switch)
}

/// Reopens a database from captured journal bytes, as after a restart.
pub fn recover(name: &str, image: Vec<u8>) -> Database {
    let engine = RevisionEngine::with_journal(Box::new(MemoryJournal::with_data(image)), true)
        .expect("Failed to replay journal");
    Database::open_with_store(name, DatabaseConfig::default(), Box::new(engine.connect()))
        .expect("Failed to open database")
}
