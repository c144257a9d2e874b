//! Revision identifiers, flags and revision snapshots.

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Number of digest bytes kept in a revision id.
const DIGEST_LEN: usize = 20;

/// Identifier of one revision of a document: `<generation>-<hex digest>`.
///
/// The generation is the depth of the revision in its branch (1 for a root).
/// Revision ids order by generation first, then digest, which is also the
/// tie-break used when picking a winning leaf.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    generation: u32,
    digest: String,
}

impl RevisionId {
    /// Creates a revision id from its parts.
    ///
    /// # Errors
    ///
    /// Fails if the generation is zero or the digest is empty or not hex.
    pub fn new(generation: u32, digest: impl Into<String>) -> Result<Self, StorageError> {
        let digest = digest.into();
        if generation == 0 {
            return Err(StorageError::InvalidArgument(
                "revision generation must be positive".into(),
            ));
        }
        if digest.is_empty() || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidArgument(format!(
                "revision digest must be hex: {digest:?}"
            )));
        }
        Ok(Self {
            generation,
            digest: digest.to_ascii_lowercase(),
        })
    }

    /// Derives the id of a new child revision.
    ///
    /// The digest covers the parent id, the deletion flag and the encoded
    /// body, so identical edits made on different peers get identical ids.
    #[must_use]
    pub fn derive(parent: Option<&RevisionId>, deleted: bool, body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        match parent {
            Some(p) => {
                let text = p.to_string();
                hasher.update([text.len() as u8]);
                hasher.update(text.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update([u8::from(deleted)]);
        hasher.update(body);
        let digest = hasher.finalize();
        let digest = digest[..DIGEST_LEN]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        Self {
            generation: parent.map_or(1, |p| p.generation.saturating_add(1)),
            digest,
        }
    }

    /// Returns the generation (branch depth).
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl fmt::Debug for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevisionId({self})")
    }
}

impl FromStr for RevisionId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| StorageError::InvalidArgument(format!("malformed revision id: {s}")))?;
        let generation = generation
            .parse::<u32>()
            .map_err(|_| StorageError::InvalidArgument(format!("malformed revision id: {s}")))?;
        Self::new(generation, digest)
    }
}

impl TryFrom<String> for RevisionId {
    type Error = StorageError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RevisionId> for String {
    fn from(id: RevisionId) -> Self {
        id.to_string()
    }
}

/// Flags attached to a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionFlags(u8);

impl RevisionFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Revision is a deletion (tombstone).
    pub const DELETED: Self = Self(0x01);
    /// Revision body references attachments.
    pub const HAS_ATTACHMENTS: Self = Self(0x02);
    /// Revision sits on an unresolved conflicting branch.
    pub const CONFLICT: Self = Self(0x04);
    /// Leaf closes a branch that lost a conflict resolution.
    pub const CLOSED: Self = Self(0x08);

    /// Creates flags from a raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        Self(b)
    }

    /// Returns the raw byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Checks whether all bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns these flags with the bits of `other` added.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns these flags with the bits of `other` removed.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Checks the deletion flag.
    #[must_use]
    pub const fn is_deleted(self) -> bool {
        self.contains(Self::DELETED)
    }

    /// Checks the attachments flag.
    #[must_use]
    pub const fn has_attachments(self) -> bool {
        self.contains(Self::HAS_ATTACHMENTS)
    }

    /// Checks the conflict flag.
    #[must_use]
    pub const fn is_conflict(self) -> bool {
        self.contains(Self::CONFLICT)
    }

    /// Checks the closed flag.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        self.contains(Self::CLOSED)
    }

    /// Returns only the flags a caller may set on a new revision.
    #[must_use]
    pub const fn content_flags(self) -> Self {
        Self(self.0 & (Self::DELETED.0 | Self::HAS_ATTACHMENTS.0))
    }
}

/// A snapshot of one revision as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    /// Document the revision belongs to.
    pub doc_id: String,
    /// Revision identifier.
    pub rev_id: RevisionId,
    /// Revision flags.
    pub flags: RevisionFlags,
    /// Sequence number assigned when the revision was committed.
    pub sequence: u64,
    /// Encoded body (empty for tombstones).
    pub body: Vec<u8>,
}

impl Revision {
    /// Returns true if this revision is a tombstone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags.is_deleted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let id: RevisionId = "3-abc123".parse().unwrap();
        assert_eq!(id.generation(), 3);
        assert_eq!(id.digest(), "abc123");
        assert_eq!(id.to_string(), "3-abc123");
    }

    #[test]
    fn malformed_ids_rejected() {
        assert!("abc".parse::<RevisionId>().is_err());
        assert!("0-ab".parse::<RevisionId>().is_err());
        assert!("2-".parse::<RevisionId>().is_err());
        assert!("2-xyz".parse::<RevisionId>().is_err());
    }

    #[test]
    fn derive_increments_generation() {
        let root = RevisionId::derive(None, false, b"body");
        assert_eq!(root.generation(), 1);
        assert_eq!(root.digest().len(), DIGEST_LEN * 2);
        let child = RevisionId::derive(Some(&root), false, b"body");
        assert_eq!(child.generation(), 2);
        assert_ne!(root.digest(), child.digest());
    }

    #[test]
    fn derive_is_deterministic() {
        let a = RevisionId::derive(None, false, b"x");
        let b = RevisionId::derive(None, false, b"x");
        let deleted = RevisionId::derive(None, true, b"x");
        assert_eq!(a, b);
        assert_ne!(a, deleted);
    }

    #[test]
    fn ordering_is_generation_first() {
        let low: RevisionId = "2-ff".parse().unwrap();
        let high: RevisionId = "10-00".parse().unwrap();
        assert!(low < high);
    }

    #[test]
    fn flag_operations() {
        let flags = RevisionFlags::DELETED.with(RevisionFlags::CONFLICT);
        assert!(flags.is_deleted());
        assert!(flags.is_conflict());
        assert!(!flags.without(RevisionFlags::CONFLICT).is_conflict());
        assert_eq!(flags.content_flags(), RevisionFlags::DELETED);
    }
}
