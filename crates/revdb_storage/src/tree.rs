//! Per-document revision trees.
//!
//! A tree is an arena of [`RevNode`]s linked by parent index. Only leaves
//! keep a body; adding a child drops the parent's body.
//!
//! ## Winner selection
//!
//! Among *open* leaves (leaves without [`RevisionFlags::CLOSED`]) the current
//! revision is the best by, in order:
//!
//! 1. not flagged [`RevisionFlags::CONFLICT`]
//! 2. not deleted
//! 3. larger [`RevisionId`] (generation, then digest)
//!
//! The conflicting revision is the best open leaf flagged `CONFLICT` that is
//! not the current one.
//!
//! ## Pruning
//!
//! [`RevTree::prune`] keeps at most `max_depth` revisions along each branch,
//! counted from its leaf. A closed branch is dropped entirely once the current
//! revision is `max_depth` generations past its tombstone.

use crate::error::{StorageError, StorageResult};
use crate::revision::{Revision, RevisionFlags, RevisionId};
use serde::{Deserialize, Serialize};

/// Default number of revisions kept along each branch.
pub const DEFAULT_MAX_REV_TREE_DEPTH: usize = 20;

/// One revision node in a [`RevTree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevNode {
    /// Revision identifier.
    pub rev_id: RevisionId,
    /// Index of the parent node, `None` for roots.
    pub parent: Option<usize>,
    /// Revision flags.
    pub flags: RevisionFlags,
    /// Sequence assigned when the node was committed.
    pub sequence: u64,
    /// Encoded body; only leaves keep one.
    pub body: Option<Vec<u8>>,
}

/// The revision tree of a single document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevTree {
    doc_id: String,
    nodes: Vec<RevNode>,
    expiration: Option<u64>,
}

impl RevTree {
    /// Creates an empty tree for `doc_id`.
    #[must_use]
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            nodes: Vec::new(),
            expiration: None,
        }
    }

    /// Returns the document id.
    #[must_use]
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Returns all nodes in insertion order.
    #[must_use]
    pub fn nodes(&self) -> &[RevNode] {
        &self.nodes
    }

    /// Returns the expiration timestamp (milliseconds since the Unix epoch).
    #[must_use]
    pub fn expiration(&self) -> Option<u64> {
        self.expiration
    }

    pub(crate) fn set_expiration(&mut self, expiration: Option<u64>) {
        self.expiration = expiration;
    }

    /// Finds the node holding `rev_id`.
    #[must_use]
    pub fn find(&self, rev_id: &RevisionId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.rev_id == rev_id)
    }

    fn leaf_mask(&self) -> Vec<bool> {
        let mut leaf = vec![true; self.nodes.len()];
        for node in &self.nodes {
            if let Some(p) = node.parent {
                leaf[p] = false;
            }
        }
        leaf
    }

    fn open_leaves(&self) -> impl Iterator<Item = usize> + '_ {
        let mask = self.leaf_mask();
        (0..self.nodes.len()).filter(move |&i| mask[i] && !self.nodes[i].flags.is_closed())
    }

    fn is_open_leaf(&self, idx: usize) -> bool {
        !self.nodes[idx].flags.is_closed() && !self.nodes.iter().any(|n| n.parent == Some(idx))
    }

    fn rank(&self, idx: usize) -> (bool, bool, &RevisionId) {
        let node = &self.nodes[idx];
        (
            !node.flags.is_conflict(),
            !node.flags.is_deleted(),
            &node.rev_id,
        )
    }

    /// Returns the index of the current (winning) leaf.
    #[must_use]
    pub fn current_index(&self) -> Option<usize> {
        self.open_leaves().max_by(|&a, &b| self.rank(a).cmp(&self.rank(b)))
    }

    /// Returns the index of the best unresolved conflicting leaf.
    #[must_use]
    pub fn conflicting_index(&self) -> Option<usize> {
        let current = self.current_index();
        self.open_leaves()
            .filter(|&i| Some(i) != current && self.nodes[i].flags.is_conflict())
            .max_by(|&a, &b| self.rank(a).cmp(&self.rank(b)))
    }

    /// Builds a revision snapshot for the node at `idx`.
    #[must_use]
    pub fn revision(&self, idx: usize) -> Revision {
        let node = &self.nodes[idx];
        Revision {
            doc_id: self.doc_id.clone(),
            rev_id: node.rev_id.clone(),
            flags: node.flags,
            sequence: node.sequence,
            body: node.body.clone().unwrap_or_default(),
        }
    }

    /// Returns the current revision.
    #[must_use]
    pub fn current(&self) -> Option<Revision> {
        self.current_index().map(|i| self.revision(i))
    }

    /// Returns the conflicting revision, if any.
    #[must_use]
    pub fn conflicting(&self) -> Option<Revision> {
        self.conflicting_index().map(|i| self.revision(i))
    }

    /// Returns true if the current revision exists and is not a deletion.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.current_index()
            .is_some_and(|i| !self.nodes[i].flags.is_deleted())
    }

    /// Returns true if an unresolved conflict exists.
    #[must_use]
    pub fn in_conflict(&self) -> bool {
        self.conflicting_index().is_some()
    }

    /// Returns the ancestry of the node at `idx`, newest first.
    #[must_use]
    pub fn history(&self, idx: usize) -> Vec<RevisionId> {
        let mut out = Vec::new();
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            out.push(self.nodes[i].rev_id.clone());
            cursor = self.nodes[i].parent;
        }
        out
    }

    /// Drops revisions more than `max_depth` steps behind every retained
    /// leaf. A depth of zero is treated as one. Returns the number of nodes
    /// removed.
    pub(crate) fn prune(&mut self, max_depth: usize) -> usize {
        let max_depth = max_depth.max(1);
        let newest = self
            .current_index()
            .map_or(0, |c| u64::from(self.nodes[c].rev_id.generation()));
        let mask = self.leaf_mask();

        let mut keep = vec![false; self.nodes.len()];
        for leaf in (0..self.nodes.len()).filter(|&i| mask[i]) {
            let node = &self.nodes[leaf];
            if node.flags.is_closed()
                && u64::from(node.rev_id.generation()) + max_depth as u64 <= newest
            {
                continue;
            }
            let mut cursor = Some(leaf);
            for _ in 0..max_depth {
                let Some(i) = cursor else { break };
                keep[i] = true;
                cursor = self.nodes[i].parent;
            }
        }

        let removed = keep.iter().filter(|kept| !**kept).count();
        if removed == 0 {
            return 0;
        }
        let mut remap = vec![None; self.nodes.len()];
        for (next, (i, _)) in keep.iter().enumerate().filter(|(_, kept)| **kept).enumerate() {
            remap[i] = Some(next);
        }
        let nodes = std::mem::take(&mut self.nodes);
        self.nodes = nodes
            .into_iter()
            .zip(keep)
            .filter(|(_, kept)| *kept)
            .map(|(mut node, _)| {
                node.parent = node.parent.and_then(|p| remap[p]);
                node
            })
            .collect();
        removed
    }

    fn push_child(
        &mut self,
        parent: Option<usize>,
        rev_id: RevisionId,
        flags: RevisionFlags,
        sequence: u64,
        body: Option<Vec<u8>>,
    ) -> usize {
        if let Some(p) = parent {
            self.nodes[p].body = None;
        }
        self.nodes.push(RevNode {
            rev_id,
            parent,
            flags,
            sequence,
            body,
        });
        self.nodes.len() - 1
    }

    /// Adds a locally written revision on top of `base`.
    ///
    /// Returns `None` when `base` is not the current leaf. Without a base the
    /// document must be absent or deleted; the new revision then extends the
    /// tombstone.
    pub(crate) fn put(
        &mut self,
        base: Option<&RevisionId>,
        body: Vec<u8>,
        flags: RevisionFlags,
        sequence: u64,
    ) -> Option<usize> {
        let current = self.current_index();
        let parent = match (base, current) {
            (None, None) => None,
            (None, Some(c)) if self.nodes[c].flags.is_deleted() => Some(c),
            (None, Some(_)) => return None,
            (Some(base), Some(c)) if &self.nodes[c].rev_id == base => Some(c),
            (Some(_), _) => return None,
        };
        let flags = flags.content_flags();
        let rev_id = RevisionId::derive(
            parent.map(|p| &self.nodes[p].rev_id),
            flags.is_deleted(),
            &body,
        );
        Some(self.push_child(parent, rev_id, flags, sequence, Some(body)))
    }

    /// Inserts a revision with its ancestry (newest first), as a replicator
    /// would.
    ///
    /// Returns `Ok(None)` if the revision is already present. A revision that
    /// branches off anything but a live current leaf is flagged as a
    /// conflict.
    pub(crate) fn insert_existing(
        &mut self,
        history: &[RevisionId],
        body: Vec<u8>,
        flags: RevisionFlags,
        sequence: u64,
    ) -> StorageResult<Option<usize>> {
        let Some(newest) = history.first() else {
            return Err(StorageError::InvalidArgument(
                "revision history must not be empty".into(),
            ));
        };
        if history
            .windows(2)
            .any(|w| w[0].generation() <= w[1].generation())
        {
            return Err(StorageError::InvalidArgument(format!(
                "revision history of {} must be strictly descending",
                self.doc_id
            )));
        }
        if self.find(newest).is_some() {
            return Ok(None);
        }

        let (anchor, missing) = history
            .iter()
            .enumerate()
            .skip(1)
            .find_map(|(i, rev)| self.find(rev).map(|idx| (Some(idx), i)))
            .unwrap_or((None, history.len()));

        let conflict = match self.current_index() {
            Some(c) if !self.nodes[c].flags.is_deleted() => anchor != Some(c),
            _ => false,
        };
        let marker = if conflict {
            RevisionFlags::CONFLICT
        } else {
            RevisionFlags::NONE
        };

        let mut parent = anchor;
        for rev in history[1..missing].iter().rev() {
            parent = Some(self.push_child(parent, rev.clone(), marker, sequence, None));
        }
        let leaf_flags = flags.content_flags().with(marker);
        Ok(Some(self.push_child(
            parent,
            newest.clone(),
            leaf_flags,
            sequence,
            Some(body),
        )))
    }

    /// Resolves a conflict between two open leaves.
    ///
    /// The losing leaf is closed with a tombstone child; the winning branch
    /// loses its conflict marks and, if `merged` is given, gets a child with
    /// the merged body. Returns the new current index, or `None` if `local`
    /// is no longer current or either side is not an open leaf.
    pub(crate) fn resolve(
        &mut self,
        local: &RevisionId,
        winning: &RevisionId,
        losing: &RevisionId,
        merged: Option<(Vec<u8>, RevisionFlags)>,
        next_sequence: &mut u64,
    ) -> Option<usize> {
        let current = self.current_index()?;
        if &self.nodes[current].rev_id != local {
            return None;
        }
        let win = self.find(winning)?;
        let lose = self.find(losing)?;
        if win == lose || !self.is_open_leaf(win) || !self.is_open_leaf(lose) {
            return None;
        }

        let tombstone = RevisionId::derive(Some(losing), true, &[]);
        let closed = RevisionFlags::DELETED.with(RevisionFlags::CLOSED);
        self.push_child(Some(lose), tombstone, closed, take(next_sequence), None);

        let mut cursor = Some(win);
        while let Some(i) = cursor {
            let node = &mut self.nodes[i];
            node.flags = node.flags.without(RevisionFlags::CONFLICT);
            cursor = node.parent;
        }

        if let Some((body, flags)) = merged {
            let flags = flags.content_flags();
            let rev_id = RevisionId::derive(Some(winning), flags.is_deleted(), &body);
            self.push_child(Some(win), rev_id, flags, take(next_sequence), Some(body));
        }
        self.current_index()
    }
}

fn take(next: &mut u64) -> u64 {
    let seq = *next;
    *next += 1;
    seq
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(s: &str) -> RevisionId {
        s.parse().unwrap()
    }

    fn tree_with_chain() -> (RevTree, RevisionId, RevisionId) {
        let mut tree = RevTree::new("doc");
        let a = tree.put(None, b"a".to_vec(), RevisionFlags::NONE, 1).unwrap();
        let a = tree.nodes()[a].rev_id.clone();
        let b = tree
            .put(Some(&a), b"b".to_vec(), RevisionFlags::NONE, 2)
            .unwrap();
        let b = tree.nodes()[b].rev_id.clone();
        (tree, a, b)
    }

    #[test]
    fn put_chain_drops_parent_body() {
        let (tree, a, b) = tree_with_chain();
        let current = tree.current().unwrap();
        assert_eq!(current.rev_id, b);
        assert_eq!(current.body, b"b");
        assert_eq!(current.rev_id.generation(), 2);
        assert_eq!(tree.nodes()[tree.find(&a).unwrap()].body, None);
        assert_eq!(tree.history(tree.current_index().unwrap()), vec![b, a]);
    }

    #[test]
    fn stale_base_conflicts() {
        let (mut tree, a, _) = tree_with_chain();
        assert!(tree.put(Some(&a), b"c".to_vec(), RevisionFlags::NONE, 3).is_none());
        assert!(tree.put(None, b"c".to_vec(), RevisionFlags::NONE, 3).is_none());
        assert!(tree
            .put(Some(&rev("9-ab")), b"c".to_vec(), RevisionFlags::NONE, 3)
            .is_none());
    }

    #[test]
    fn create_over_tombstone() {
        let (mut tree, _, b) = tree_with_chain();
        let del = tree
            .put(Some(&b), Vec::new(), RevisionFlags::DELETED, 3)
            .unwrap();
        assert!(!tree.is_live());
        let again = tree.put(None, b"new".to_vec(), RevisionFlags::NONE, 4).unwrap();
        assert_eq!(tree.nodes()[again].parent, Some(del));
        assert!(tree.is_live());
    }

    #[test]
    fn sibling_insert_is_conflict_and_local_stays_current() {
        let (mut tree, a, b) = tree_with_chain();
        let remote = rev("2-ffff");
        tree.insert_existing(&[remote.clone(), a.clone()], b"r".to_vec(), RevisionFlags::NONE, 3)
            .unwrap()
            .unwrap();
        assert_eq!(tree.current().unwrap().rev_id, b);
        let conflicting = tree.conflicting().unwrap();
        assert_eq!(conflicting.rev_id, remote);
        assert!(conflicting.flags.is_conflict());
        assert!(tree.in_conflict());
    }

    #[test]
    fn fast_forward_insert_is_not_conflict() {
        let (mut tree, a, b) = tree_with_chain();
        let next = rev("3-abcd");
        tree.insert_existing(&[next.clone(), b, a], b"n".to_vec(), RevisionFlags::NONE, 3)
            .unwrap();
        assert_eq!(tree.current().unwrap().rev_id, next);
        assert!(!tree.in_conflict());
    }

    #[test]
    fn insert_existing_is_idempotent() {
        let (mut tree, a, b) = tree_with_chain();
        let out = tree
            .insert_existing(&[b, a], b"b".to_vec(), RevisionFlags::NONE, 9)
            .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn insert_rejects_unordered_history() {
        let mut tree = RevTree::new("doc");
        let err = tree.insert_existing(&[rev("1-aa"), rev("2-bb")], vec![], RevisionFlags::NONE, 1);
        assert!(err.is_err());
    }

    #[test]
    fn insert_fills_missing_ancestors() {
        let mut tree = RevTree::new("doc");
        tree.insert_existing(
            &[rev("3-cc"), rev("2-bb"), rev("1-aa")],
            b"x".to_vec(),
            RevisionFlags::NONE,
            1,
        )
        .unwrap();
        assert_eq!(tree.nodes().len(), 3);
        let current = tree.current_index().unwrap();
        assert_eq!(
            tree.history(current),
            vec![rev("3-cc"), rev("2-bb"), rev("1-aa")]
        );
    }

    #[test]
    fn resolve_with_remote_winner_and_merged_body() {
        let (mut tree, a, local) = tree_with_chain();
        let remote = rev("2-ffff");
        tree.insert_existing(&[remote.clone(), a], b"r".to_vec(), RevisionFlags::NONE, 3)
            .unwrap();
        let mut seq = 4;
        let current = tree
            .resolve(
                &local,
                &remote,
                &local,
                Some((b"merged".to_vec(), RevisionFlags::NONE)),
                &mut seq,
            )
            .unwrap();
        assert_eq!(seq, 6);
        let resolved = tree.revision(current);
        assert_eq!(resolved.body, b"merged");
        assert_eq!(tree.history(current)[1], remote);
        assert!(!tree.in_conflict());
        assert!(tree.is_live());
    }

    #[test]
    fn resolve_without_body_promotes_remote() {
        let (mut tree, a, local) = tree_with_chain();
        let remote = rev("2-ffff");
        tree.insert_existing(&[remote.clone(), a], b"r".to_vec(), RevisionFlags::NONE, 3)
            .unwrap();
        let mut seq = 4;
        let current = tree.resolve(&local, &remote, &local, None, &mut seq).unwrap();
        assert_eq!(tree.nodes()[current].rev_id, remote);
        assert!(!tree.nodes()[current].flags.is_conflict());
        assert_eq!(tree.revision(current).body, b"r");
    }

    #[test]
    fn resolve_fails_when_local_moved() {
        let (mut tree, a, local) = tree_with_chain();
        let remote = rev("2-ffff");
        tree.insert_existing(&[remote.clone(), a.clone()], b"r".to_vec(), RevisionFlags::NONE, 3)
            .unwrap();
        let mut seq = 4;
        assert!(tree.resolve(&a, &remote, &a, None, &mut seq).is_none());
        assert!(tree.resolve(&local, &remote, &remote, None, &mut seq).is_none());
        assert_eq!(seq, 4);
    }

    fn linear(saves: usize) -> RevTree {
        let mut tree = RevTree::new("doc");
        let mut base: Option<RevisionId> = None;
        for i in 0..saves {
            let idx = tree
                .put(base.as_ref(), vec![i as u8], RevisionFlags::NONE, i as u64 + 1)
                .unwrap();
            base = Some(tree.nodes()[idx].rev_id.clone());
        }
        tree
    }

    #[test]
    fn prune_keeps_the_newest_revisions() {
        let mut tree = linear(30);
        let before = tree.current().unwrap();
        assert_eq!(tree.prune(DEFAULT_MAX_REV_TREE_DEPTH), 10);
        assert_eq!(tree.nodes().len(), DEFAULT_MAX_REV_TREE_DEPTH);
        assert_eq!(tree.current().unwrap(), before);

        let history = tree.history(tree.current_index().unwrap());
        assert_eq!(history.len(), DEFAULT_MAX_REV_TREE_DEPTH);
        assert_eq!(history.last().unwrap().generation(), 11);
        assert_eq!(tree.nodes()[0].parent, None);
    }

    #[test]
    fn prune_within_depth_is_a_no_op() {
        let mut tree = linear(5);
        let before = tree.clone();
        assert_eq!(tree.prune(5), 0);
        assert_eq!(tree, before);
    }

    #[test]
    fn prune_keeps_both_sides_of_a_conflict() {
        let (mut tree, a, b) = tree_with_chain();
        let remote = rev("2-ffff");
        tree.insert_existing(&[remote.clone(), a], b"r".to_vec(), RevisionFlags::NONE, 3)
            .unwrap();
        tree.prune(1);
        assert_eq!(tree.nodes().len(), 2);
        assert_eq!(tree.current().unwrap().rev_id, b);
        assert_eq!(tree.conflicting().unwrap().rev_id, remote);
    }

    #[test]
    fn prune_keeps_fresh_resolution_and_drops_old_closed_branches() {
        let (mut tree, a, local) = tree_with_chain();
        let remote = rev("2-ffff");
        tree.insert_existing(&[remote.clone(), a], b"r".to_vec(), RevisionFlags::NONE, 3)
            .unwrap();
        let mut seq = 4;
        let merged = tree
            .resolve(
                &local,
                &remote,
                &local,
                Some((b"m".to_vec(), RevisionFlags::NONE)),
                &mut seq,
            )
            .unwrap();
        let merged = tree.nodes()[merged].rev_id.clone();

        tree.prune(2);
        let current = tree.current_index().unwrap();
        assert_eq!(tree.history(current), vec![merged.clone(), remote]);
        assert!(tree.find(&local).is_some());

        let mut base = merged;
        for i in 0..3u8 {
            let idx = tree
                .put(Some(&base), vec![i], RevisionFlags::NONE, seq)
                .unwrap();
            base = tree.nodes()[idx].rev_id.clone();
            seq += 1;
        }
        tree.prune(2);
        assert!(tree.find(&local).is_none());
        assert_eq!(tree.nodes().len(), 2);
        assert!(!tree.in_conflict());
    }

    #[test]
    fn deleted_current_does_not_flag_conflict() {
        let (mut tree, a, b) = tree_with_chain();
        tree.put(Some(&b), Vec::new(), RevisionFlags::DELETED, 3);
        tree.insert_existing(&[rev("2-eeee"), a], b"r".to_vec(), RevisionFlags::NONE, 4)
            .unwrap();
        assert!(!tree.in_conflict());
        assert_eq!(tree.current().unwrap().rev_id, rev("2-eeee"));
    }
}
