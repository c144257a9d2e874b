//! Journal record framing and replay.
//!
//! Each committed transaction is appended as one frame:
//!
//! ```text
//! | magic (4) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload is a CBOR-encoded [`JournalRecord`]. The checksum covers magic,
//! length and payload. All integers are little-endian.

use crate::error::{StorageError, StorageResult};
use crate::tree::RevTree;
use revdb_codec::{from_cbor, to_cbor};
use serde::{Deserialize, Serialize};

/// Frame magic.
pub const JOURNAL_MAGIC: [u8; 4] = *b"RVJ1";

/// Largest payload a frame may declare.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const HEADER_SIZE: usize = 8;
const CRC_SIZE: usize = 4;

/// A unit of journal replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// One committed transaction: the full trees of every touched document.
    Commit {
        /// Highest sequence after the commit.
        last_sequence: u64,
        /// Trees written by the transaction.
        trees: Vec<RevTree>,
        /// Documents purged by the transaction.
        purged: Vec<String>,
    },
    /// Complete state, written by compaction. Replaces everything before it.
    Snapshot {
        /// Highest sequence at snapshot time.
        last_sequence: u64,
        /// Every document tree.
        trees: Vec<RevTree>,
    },
}

impl JournalRecord {
    /// Encodes the record into a checksummed frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded.
    pub fn encode_frame(&self) -> StorageResult<Vec<u8>> {
        let payload = to_cbor(self)?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|&len| len as usize <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                StorageError::InvalidArgument(format!(
                    "journal record too large: {}",
                    payload.len()
                ))
            })?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&JOURNAL_MAGIC);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = compute_crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }
}

/// Result of scanning a journal image.
#[derive(Debug, Default)]
pub struct Replay {
    /// Records in journal order.
    pub records: Vec<JournalRecord>,
    /// Length of the valid prefix. Anything after it is a torn tail.
    pub valid_len: u64,
}

impl Replay {
    /// Returns true if bytes after the valid prefix must be cut.
    #[must_use]
    pub fn has_torn_tail(&self, total_len: u64) -> bool {
        self.valid_len < total_len
    }
}

/// Scans a journal image.
///
/// An incomplete final frame, or a final frame whose checksum does not match,
/// is treated as a torn write and excluded from `valid_len`. A frame is only
/// torn if no intact frame follows it.
///
/// # Errors
///
/// Returns [`StorageError::Corrupted`] if a damaged frame is followed by more
/// data or by an intact frame, or if a checksummed payload fails to decode.
pub fn replay(data: &[u8]) -> StorageResult<Replay> {
    let mut out = Replay::default();
    let mut pos = 0usize;

    while pos < data.len() {
        let rest = &data[pos..];
        if rest.len() < HEADER_SIZE {
            break;
        }
        if rest[..4] != JOURNAL_MAGIC {
            return Err(StorageError::Corrupted(format!(
                "invalid journal magic at offset {pos}"
            )));
        }
        let len = declared_len(rest);
        if len > MAX_FRAME_LEN || rest.len() < HEADER_SIZE + len + CRC_SIZE {
            if let Some(at) = next_intact_frame(rest) {
                return Err(StorageError::Corrupted(format!(
                    "journal frame at offset {pos} declares {len} bytes but an intact frame starts at offset {}",
                    pos + at
                )));
            }
            break;
        }

        let total = HEADER_SIZE + len + CRC_SIZE;
        let body_end = HEADER_SIZE + len;
        let stored = stored_crc(rest, body_end);
        let computed = compute_crc32(&rest[..body_end]);
        if stored != computed {
            if rest.len() == total {
                break;
            }
            return Err(StorageError::Corrupted(format!(
                "journal checksum mismatch at offset {pos}: expected {stored:#010x}, got {computed:#010x}"
            )));
        }

        let record: JournalRecord = from_cbor(&rest[HEADER_SIZE..body_end]).map_err(|e| {
            StorageError::Corrupted(format!("undecodable journal record at offset {pos}: {e}"))
        })?;
        out.records.push(record);
        pos += total;
        out.valid_len = pos as u64;
    }
    Ok(out)
}

fn declared_len(frame: &[u8]) -> usize {
    u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize
}

fn stored_crc(frame: &[u8], body_end: usize) -> u32 {
    u32::from_le_bytes([
        frame[body_end],
        frame[body_end + 1],
        frame[body_end + 2],
        frame[body_end + 3],
    ])
}

/// Returns true if `data` starts with a complete frame whose checksum holds.
fn is_intact_frame(data: &[u8]) -> bool {
    if data.len() < HEADER_SIZE || data[..4] != JOURNAL_MAGIC {
        return false;
    }
    let len = declared_len(data);
    if len > MAX_FRAME_LEN || data.len() < HEADER_SIZE + len + CRC_SIZE {
        return false;
    }
    let body_end = HEADER_SIZE + len;
    stored_crc(data, body_end) == compute_crc32(&data[..body_end])
}

/// Offset of the first intact frame after the start of `rest`.
fn next_intact_frame(rest: &[u8]) -> Option<usize> {
    rest.windows(JOURNAL_MAGIC.len())
        .enumerate()
        .skip(1)
        .filter(|(_, window)| *window == JOURNAL_MAGIC)
        .map(|(at, _)| at)
        .find(|&at| is_intact_frame(&rest[at..]))
}

/// Computes the IEEE CRC32 of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::RevisionFlags;

    fn commit(seq: u64, doc: &str) -> JournalRecord {
        let mut tree = RevTree::new(doc);
        tree.put(None, b"body".to_vec(), RevisionFlags::NONE, seq);
        JournalRecord::Commit {
            last_sequence: seq,
            trees: vec![tree],
            purged: vec![],
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn frames_replay_in_order() {
        let mut image = commit(1, "a").encode_frame().unwrap();
        image.extend(commit(2, "b").encode_frame().unwrap());
        let replayed = replay(&image).unwrap();
        assert_eq!(replayed.records, vec![commit(1, "a"), commit(2, "b")]);
        assert!(!replayed.has_torn_tail(image.len() as u64));
    }

    #[test]
    fn short_tail_is_torn() {
        let mut image = commit(1, "a").encode_frame().unwrap();
        let first = image.len() as u64;
        let second = commit(2, "b").encode_frame().unwrap();
        image.extend_from_slice(&second[..second.len() - 3]);
        let replayed = replay(&image).unwrap();
        assert_eq!(replayed.records.len(), 1);
        assert_eq!(replayed.valid_len, first);
        assert!(replayed.has_torn_tail(image.len() as u64));
    }

    #[test]
    fn bad_checksum_on_last_frame_is_torn() {
        let mut image = commit(1, "a").encode_frame().unwrap();
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        let replayed = replay(&image).unwrap();
        assert!(replayed.records.is_empty());
        assert_eq!(replayed.valid_len, 0);
    }

    #[test]
    fn bad_checksum_before_tail_is_corruption() {
        let mut image = commit(1, "a").encode_frame().unwrap();
        image[HEADER_SIZE] ^= 0xFF;
        image.extend(commit(2, "b").encode_frame().unwrap());
        assert!(matches!(replay(&image), Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn damaged_length_before_intact_frames_is_corruption() {
        let mut image = commit(1, "a").encode_frame().unwrap();
        image.extend(commit(2, "b").encode_frame().unwrap());
        image.extend(commit(3, "c").encode_frame().unwrap());
        image[7] ^= 0x01;
        assert!(matches!(replay(&image), Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn oversized_length_on_last_frame_is_torn() {
        let mut image = commit(1, "a").encode_frame().unwrap();
        let first = image.len() as u64;
        let mut second = commit(2, "b").encode_frame().unwrap();
        second[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        image.extend(second);
        let replayed = replay(&image).unwrap();
        assert_eq!(replayed.records, vec![commit(1, "a")]);
        assert_eq!(replayed.valid_len, first);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let image = b"XXXXXXXXXXXX".to_vec();
        assert!(matches!(replay(&image), Err(StorageError::Corrupted(_))));
    }
}
