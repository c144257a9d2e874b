//! Journal byte-store trait.

use crate::error::StorageResult;

/// An append-only byte store holding the revision journal.
///
/// Journals are opaque: they know nothing about records or revisions.
/// Framing and replay live in [`crate::record`].
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_all` returns every byte appended and not truncated
/// - `replace` is atomic: a crash leaves either the old or the new content
///
/// # Implementors
///
/// - [`crate::MemoryJournal`] - for tests and in-memory databases
/// - [`crate::FileJournal`] - for persistent databases
pub trait Journal: Send {
    /// Reads the whole journal.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read_all(&mut self) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the journal and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes appended data to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Makes appended data and metadata durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Drops everything after `new_size`. Used to cut a torn tail.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` exceeds the current size or the
    /// truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole journal with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the new content cannot be written.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;
}
