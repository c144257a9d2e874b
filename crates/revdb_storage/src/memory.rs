//! In-memory journal.

use crate::error::{StorageError, StorageResult};
use crate::journal::Journal;

/// A journal kept in a `Vec<u8>`. Nothing survives the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryJournal {
    data: Vec<u8>,
}

impl MemoryJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a journal holding `data`, e.g. to replay a captured image.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Journal for MemoryJournal {
    fn read_all(&mut self) -> StorageResult<Vec<u8>> {
        Ok(self.data.clone())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let len = usize::try_from(new_size)
            .ok()
            .filter(|n| *n <= self.data.len())
            .ok_or_else(|| {
                StorageError::InvalidArgument(format!(
                    "cannot truncate journal to {new_size} bytes, it holds {}",
                    self.data.len()
                ))
            })?;
        self.data.truncate(len);
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        self.data = data.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_offsets() {
        let mut journal = MemoryJournal::new();
        assert_eq!(journal.append(b"ab").unwrap(), 0);
        assert_eq!(journal.append(b"cd").unwrap(), 2);
        assert_eq!(journal.read_all().unwrap(), b"abcd");
    }

    #[test]
    fn truncate_past_end_fails() {
        let mut journal = MemoryJournal::with_data(b"xyz".to_vec());
        assert!(journal.truncate(4).is_err());
        journal.truncate(1).unwrap();
        assert_eq!(journal.data(), b"x");
    }
}
