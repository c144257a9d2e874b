//! Connections to a shared revision engine.

use crate::engine::{ConnId, EngineShared, PendingTransaction, Staged};
use crate::error::{StorageError, StorageResult};
use crate::observer::{EngineChangeObserver, EngineDocumentObserver};
use crate::revision::{RevisionFlags, RevisionId};
use crate::store::{
    ChangeCallback, ChangeEntry, ChangeObserver, DocumentCallback, DocumentObserver,
    InsertOutcome, PutOutcome, ResolveOutcome, RevisionStore,
};
use crate::tree::{RevTree, DEFAULT_MAX_REV_TREE_DEPTH};
use crate::Revision;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// A connection to a [`crate::RevisionEngine`].
///
/// Each connection is one change origin: observers registered through it
/// report writes from other connections as external.
pub struct EngineConnection {
    shared: Arc<EngineShared>,
    id: ConnId,
    pending: Option<PendingTransaction>,
    max_depth: usize,
    closed: bool,
}

impl EngineConnection {
    pub(crate) fn new(shared: Arc<EngineShared>, id: ConnId) -> Self {
        Self {
            shared,
            id,
            pending: None,
            max_depth: DEFAULT_MAX_REV_TREE_DEPTH,
            closed: false,
        }
    }

    /// Sets how many revisions each branch keeps when this connection writes
    /// a document.
    #[must_use]
    pub fn with_max_rev_tree_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth.max(1);
        self
    }

    /// Returns the connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn pending_mut(&mut self) -> StorageResult<&mut PendingTransaction> {
        self.ensure_open()?;
        self.pending.as_mut().ok_or(StorageError::NoTransaction)
    }

    fn next_sequence(&mut self) -> StorageResult<u64> {
        Ok(self.pending_mut()?.next_sequence)
    }

    /// Runs `f` on the tree visible to this connection.
    fn read_tree<R>(&self, doc_id: &str, f: impl FnOnce(Option<&RevTree>) -> R) -> StorageResult<R> {
        self.ensure_open()?;
        if let Some(pending) = &self.pending {
            match pending.staged.get(doc_id) {
                Some(Staged::Tree(tree)) => return Ok(f(Some(tree))),
                Some(Staged::Purged) => return Ok(f(None)),
                None => {}
            }
        }
        let state = self.shared.state.lock();
        Ok(f(state.docs.get(doc_id)))
    }

    /// Runs `f` on every tree visible to this connection.
    fn for_each_visible(&self, mut f: impl FnMut(&RevTree)) -> StorageResult<()> {
        self.ensure_open()?;
        let staged = self.pending.as_ref().map(|p| &p.staged);
        let state = self.shared.state.lock();
        for (doc_id, tree) in &state.docs {
            if staged.is_some_and(|s| s.contains_key(doc_id)) {
                continue;
            }
            f(tree);
        }
        for staged in staged.into_iter().flat_map(|s| s.values()) {
            if let Staged::Tree(tree) = staged {
                f(tree);
            }
        }
        Ok(())
    }

    fn checkout(&mut self, doc_id: &str) -> StorageResult<RevTree> {
        self.pending_mut()?;
        Ok(self
            .read_tree(doc_id, |tree| tree.cloned())?
            .unwrap_or_else(|| RevTree::new(doc_id)))
    }

    /// Prunes and stages a mutated tree and logs its new current revision.
    fn stage(&mut self, mut tree: RevTree, next_sequence: u64) -> StorageResult<()> {
        let pruned = tree.prune(self.max_depth);
        if pruned > 0 {
            debug!(doc_id = tree.doc_id(), pruned, "revision tree pruned");
        }
        let pending = self.pending_mut()?;
        pending.next_sequence = next_sequence;
        if let Some(current) = tree.current() {
            pending.changes.push(ChangeEntry {
                doc_id: current.doc_id,
                rev_id: Some(current.rev_id),
                sequence: next_sequence - 1,
                flags: current.flags,
            });
        }
        pending
            .staged
            .insert(tree.doc_id().to_string(), Staged::Tree(tree));
        Ok(())
    }

    fn put(
        &mut self,
        doc_id: &str,
        base: Option<&RevisionId>,
        body: Vec<u8>,
        flags: RevisionFlags,
    ) -> StorageResult<PutOutcome> {
        let mut tree = self.checkout(doc_id)?;
        let sequence = self.next_sequence()?;
        match tree.put(base, body, flags, sequence) {
            None => Ok(PutOutcome::Conflict),
            Some(idx) => {
                let revision = tree.revision(idx);
                self.stage(tree, sequence + 1)?;
                Ok(PutOutcome::Created(revision))
            }
        }
    }

    fn rollback(&mut self) {
        if self.pending.take().is_some() {
            self.shared.release_writer(self.id);
            debug!(connection = self.id, "transaction rolled back");
        }
    }
}

impl RevisionStore for EngineConnection {
    fn begin_transaction(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        if self.pending.is_some() {
            return Err(StorageError::TransactionActive);
        }
        self.shared.acquire_writer(self.id);
        let next_sequence = self.shared.state.lock().last_sequence + 1;
        self.pending = Some(PendingTransaction {
            staged: std::collections::BTreeMap::new(),
            changes: Vec::new(),
            next_sequence,
        });
        Ok(())
    }

    fn end_transaction(&mut self, commit: bool) -> StorageResult<()> {
        let pending = self.pending.take().ok_or(StorageError::NoTransaction)?;
        if !commit {
            self.shared.release_writer(self.id);
            debug!(connection = self.id, "transaction rolled back");
            return Ok(());
        }
        let committed = self.shared.commit(self.id, pending);
        self.shared.release_writer(self.id);
        committed?.fire();
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }

    fn create_revision(
        &mut self,
        doc_id: &str,
        body: Vec<u8>,
        flags: RevisionFlags,
    ) -> StorageResult<PutOutcome> {
        self.put(doc_id, None, body, flags)
    }

    fn update_revision(
        &mut self,
        doc_id: &str,
        base: &RevisionId,
        body: Vec<u8>,
        flags: RevisionFlags,
    ) -> StorageResult<PutOutcome> {
        self.put(doc_id, Some(base), body, flags)
    }

    fn get_current_revision(&self, doc_id: &str) -> StorageResult<Option<Revision>> {
        self.read_tree(doc_id, |tree| tree.and_then(RevTree::current))
    }

    fn get_conflicting_revision(&self, doc_id: &str) -> StorageResult<Option<Revision>> {
        self.read_tree(doc_id, |tree| tree.and_then(RevTree::conflicting))
    }

    fn resolve_conflict(
        &mut self,
        doc_id: &str,
        local: &RevisionId,
        winning: &RevisionId,
        losing: &RevisionId,
        merged_body: Option<Vec<u8>>,
        merged_flags: RevisionFlags,
    ) -> StorageResult<ResolveOutcome> {
        let mut tree = self.checkout(doc_id)?;
        if tree.nodes().is_empty() {
            return Err(StorageError::NotFound(doc_id.to_string()));
        }
        let mut sequence = self.next_sequence()?;
        let merged = merged_body.map(|body| (body, merged_flags));
        match tree.resolve(local, winning, losing, merged, &mut sequence) {
            None => Ok(ResolveOutcome::Conflict),
            Some(idx) => {
                let revision = tree.revision(idx);
                self.stage(tree, sequence)?;
                Ok(ResolveOutcome::Resolved(revision))
            }
        }
    }

    fn insert_existing_revision(
        &mut self,
        doc_id: &str,
        history: &[RevisionId],
        body: Vec<u8>,
        flags: RevisionFlags,
    ) -> StorageResult<InsertOutcome> {
        let mut tree = self.checkout(doc_id)?;
        let sequence = self.next_sequence()?;
        match tree.insert_existing(history, body, flags, sequence)? {
            None => Ok(InsertOutcome::AlreadyPresent),
            Some(idx) => {
                let revision = tree.revision(idx);
                let conflict = revision.flags.is_conflict();
                self.stage(tree, sequence + 1)?;
                Ok(InsertOutcome::Inserted { revision, conflict })
            }
        }
    }

    fn revision_history(
        &self,
        doc_id: &str,
        rev_id: &RevisionId,
    ) -> StorageResult<Vec<RevisionId>> {
        self.read_tree(doc_id, |tree| {
            tree.and_then(|t| t.find(rev_id).map(|idx| t.history(idx)))
        })?
        .ok_or_else(|| StorageError::NotFound(format!("{doc_id}@{rev_id}")))
    }

    fn purge(&mut self, doc_id: &str) -> StorageResult<()> {
        self.pending_mut()?;
        if !self.read_tree(doc_id, |tree| tree.is_some())? {
            return Err(StorageError::NotFound(doc_id.to_string()));
        }
        let pending = self.pending_mut()?;
        let sequence = pending.next_sequence;
        pending.next_sequence += 1;
        pending.changes.push(ChangeEntry {
            doc_id: doc_id.to_string(),
            rev_id: None,
            sequence,
            flags: RevisionFlags::NONE,
        });
        pending.staged.insert(doc_id.to_string(), Staged::Purged);
        Ok(())
    }

    fn set_expiration(&mut self, doc_id: &str, expiration: Option<u64>) -> StorageResult<()> {
        let mut tree = self.checkout(doc_id)?;
        if tree.nodes().is_empty() {
            return Err(StorageError::NotFound(doc_id.to_string()));
        }
        tree.set_expiration(expiration);
        self.pending_mut()?
            .staged
            .insert(doc_id.to_string(), Staged::Tree(tree));
        Ok(())
    }

    fn get_expiration(&self, doc_id: &str) -> StorageResult<Option<u64>> {
        self.read_tree(doc_id, |tree| tree.and_then(RevTree::expiration))
    }

    fn purge_expired(&mut self, now_ms: u64) -> StorageResult<Vec<String>> {
        self.pending_mut()?;
        let mut expired = Vec::new();
        self.for_each_visible(|tree| {
            if tree.expiration().is_some_and(|at| at <= now_ms) {
                expired.push(tree.doc_id().to_string());
            }
        })?;
        for doc_id in &expired {
            self.purge(doc_id)?;
        }
        Ok(expired)
    }

    fn document_count(&self) -> StorageResult<u64> {
        let mut count = 0;
        self.for_each_visible(|tree| {
            if tree.is_live() {
                count += 1;
            }
        })?;
        Ok(count)
    }

    fn last_sequence(&self) -> StorageResult<u64> {
        self.ensure_open()?;
        Ok(self.shared.state.lock().last_sequence)
    }

    fn document_ids(&self) -> StorageResult<Vec<String>> {
        let mut ids = BTreeSet::new();
        self.for_each_visible(|tree| {
            ids.insert(tree.doc_id().to_string());
        })?;
        Ok(ids.into_iter().collect())
    }

    fn conflicted_document_ids(&self) -> StorageResult<Vec<String>> {
        let mut ids = BTreeSet::new();
        self.for_each_visible(|tree| {
            if tree.in_conflict() {
                ids.insert(tree.doc_id().to_string());
            }
        })?;
        Ok(ids.into_iter().collect())
    }

    fn observe_database(
        &mut self,
        callback: ChangeCallback,
    ) -> StorageResult<Box<dyn ChangeObserver>> {
        self.ensure_open()?;
        let id = self.shared.register_db_observer(self.id, Arc::from(callback));
        Ok(Box::new(EngineChangeObserver::new(
            Arc::clone(&self.shared),
            id,
        )))
    }

    fn observe_document(
        &mut self,
        doc_id: &str,
        callback: DocumentCallback,
    ) -> StorageResult<Box<dyn DocumentObserver>> {
        self.ensure_open()?;
        let id = self.shared.register_doc_observer(doc_id, Arc::from(callback));
        Ok(Box::new(EngineDocumentObserver::new(
            Arc::clone(&self.shared),
            id,
            doc_id.to_string(),
        )))
    }

    fn compact(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        if self.pending.is_some() {
            return Err(StorageError::TransactionActive);
        }
        self.shared.acquire_writer(self.id);
        let result = self.shared.compact();
        self.shared.release_writer(self.id);
        result
    }

    fn close(&mut self) -> StorageResult<()> {
        self.rollback();
        self.closed = true;
        Ok(())
    }
}

impl Drop for EngineConnection {
    fn drop(&mut self) {
        self.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RevisionEngine;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn created(outcome: PutOutcome) -> Revision {
        match outcome {
            PutOutcome::Created(rev) => rev,
            PutOutcome::Conflict => panic!("unexpected conflict"),
        }
    }

    fn save(conn: &mut EngineConnection, doc_id: &str, body: &[u8]) -> Revision {
        conn.begin_transaction().unwrap();
        let base = conn.get_current_revision(doc_id).unwrap().map(|r| r.rev_id);
        let rev = match base {
            Some(base) => created(
                conn.update_revision(doc_id, &base, body.to_vec(), RevisionFlags::NONE)
                    .unwrap(),
            ),
            None => created(
                conn.create_revision(doc_id, body.to_vec(), RevisionFlags::NONE)
                    .unwrap(),
            ),
        };
        conn.end_transaction(true).unwrap();
        rev
    }

    #[test]
    fn mutation_requires_transaction() {
        let mut conn = RevisionEngine::in_memory().connect();
        let err = conn.create_revision("a", vec![], RevisionFlags::NONE);
        assert!(matches!(err, Err(StorageError::NoTransaction)));
    }

    #[test]
    fn nested_begin_rejected() {
        let mut conn = RevisionEngine::in_memory().connect();
        conn.begin_transaction().unwrap();
        assert!(matches!(
            conn.begin_transaction(),
            Err(StorageError::TransactionActive)
        ));
        conn.end_transaction(false).unwrap();
    }

    #[test]
    fn staged_writes_visible_only_after_commit() {
        let engine = RevisionEngine::in_memory();
        let mut writer = engine.connect();
        let reader = engine.connect();

        writer.begin_transaction().unwrap();
        writer
            .create_revision("a", b"1".to_vec(), RevisionFlags::NONE)
            .unwrap();
        assert!(writer.get_current_revision("a").unwrap().is_some());
        assert!(reader.get_current_revision("a").unwrap().is_none());
        writer.end_transaction(true).unwrap();

        let rev = reader.get_current_revision("a").unwrap().unwrap();
        assert_eq!(rev.body, b"1");
        assert_eq!(rev.sequence, 1);
        assert_eq!(reader.last_sequence().unwrap(), 1);
        assert_eq!(reader.document_count().unwrap(), 1);
    }

    #[test]
    fn rollback_discards_writes() {
        let mut conn = RevisionEngine::in_memory().connect();
        conn.begin_transaction().unwrap();
        conn.create_revision("a", b"1".to_vec(), RevisionFlags::NONE)
            .unwrap();
        conn.end_transaction(false).unwrap();
        assert!(conn.get_current_revision("a").unwrap().is_none());
        assert_eq!(conn.last_sequence().unwrap(), 0);
    }

    #[test]
    fn stale_update_conflicts() {
        let mut conn = RevisionEngine::in_memory().connect();
        let first = save(&mut conn, "a", b"1");
        save(&mut conn, "a", b"2");

        conn.begin_transaction().unwrap();
        let outcome = conn
            .update_revision("a", &first.rev_id, b"3".to_vec(), RevisionFlags::NONE)
            .unwrap();
        assert_eq!(outcome, PutOutcome::Conflict);
        conn.end_transaction(true).unwrap();
        assert_eq!(conn.get_current_revision("a").unwrap().unwrap().body, b"2");
    }

    #[test]
    fn purge_and_expiration() {
        let mut conn = RevisionEngine::in_memory().connect();
        save(&mut conn, "a", b"1");
        save(&mut conn, "b", b"2");

        conn.begin_transaction().unwrap();
        conn.set_expiration("a", Some(100)).unwrap();
        conn.set_expiration("b", Some(500)).unwrap();
        conn.end_transaction(true).unwrap();
        assert_eq!(conn.get_expiration("a").unwrap(), Some(100));

        conn.begin_transaction().unwrap();
        assert_eq!(conn.purge_expired(200).unwrap(), vec!["a".to_string()]);
        conn.end_transaction(true).unwrap();
        assert_eq!(conn.document_ids().unwrap(), vec!["b".to_string()]);

        conn.begin_transaction().unwrap();
        assert!(matches!(conn.purge("zzz"), Err(StorageError::NotFound(_))));
        conn.end_transaction(false).unwrap();
    }

    #[test]
    fn conflict_roundtrip_through_store() {
        let engine = RevisionEngine::in_memory();
        let mut local = engine.connect();
        let first = save(&mut local, "doc", b"base");
        let mine = save(&mut local, "doc", b"mine");

        let remote_id = RevisionId::derive(Some(&first.rev_id), false, b"theirs");
        let mut remote = engine.connect();
        remote.begin_transaction().unwrap();
        let inserted = remote
            .insert_existing_revision(
                "doc",
                &[remote_id.clone(), first.rev_id.clone()],
                b"theirs".to_vec(),
                RevisionFlags::NONE,
            )
            .unwrap();
        assert!(matches!(inserted, InsertOutcome::Inserted { conflict: true, .. }));
        remote.end_transaction(true).unwrap();

        assert_eq!(local.conflicted_document_ids().unwrap(), vec!["doc".to_string()]);
        let conflicting = local.get_conflicting_revision("doc").unwrap().unwrap();
        assert_eq!(conflicting.rev_id, remote_id);

        local.begin_transaction().unwrap();
        let outcome = local
            .resolve_conflict(
                "doc",
                &mine.rev_id,
                &remote_id,
                &mine.rev_id,
                Some(b"merged".to_vec()),
                RevisionFlags::NONE,
            )
            .unwrap();
        local.end_transaction(true).unwrap();

        let ResolveOutcome::Resolved(resolved) = outcome else {
            panic!("resolution conflicted");
        };
        let history = local.revision_history("doc", &resolved.rev_id).unwrap();
        assert_eq!(history[1], remote_id);
        assert!(local.conflicted_document_ids().unwrap().is_empty());
    }

    #[test]
    fn observer_batches_split_by_origin() {
        let engine = RevisionEngine::in_memory();
        let mut mine = engine.connect();
        let mut other = engine.connect();

        let signals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&signals);
        let mut observer = mine
            .observe_database(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        save(&mut mine, "a", b"1");
        save(&mut mine, "b", b"1");
        save(&mut other, "c", b"1");
        assert_eq!(signals.load(Ordering::SeqCst), 1);

        let local = observer.drain(100);
        assert!(!local.external);
        assert_eq!(local.entries.len(), 2);
        let external = observer.drain(100);
        assert!(external.external);
        assert_eq!(external.entries[0].doc_id, "c");
        assert!(observer.drain(100).is_empty());

        save(&mut other, "d", b"1");
        assert_eq!(signals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drain_respects_page_size() {
        let engine = RevisionEngine::in_memory();
        let mut conn = engine.connect();
        let mut observer = conn.observe_database(Box::new(|| {})).unwrap();
        conn.begin_transaction().unwrap();
        for i in 0..5 {
            conn.create_revision(&format!("d{i}"), vec![], RevisionFlags::NONE)
                .unwrap();
        }
        conn.end_transaction(true).unwrap();
        assert_eq!(observer.drain(2).entries.len(), 2);
        assert_eq!(observer.drain(2).entries.len(), 2);
        assert_eq!(observer.drain(2).entries.len(), 1);
        assert!(observer.drain(2).is_empty());
    }

    #[test]
    fn document_observer_fires_for_its_id() {
        let engine = RevisionEngine::in_memory();
        let mut conn = engine.connect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer = conn
            .observe_document(
                "watched",
                Box::new(move |id, seq| sink.lock().push((id.to_string(), seq))),
            )
            .unwrap();
        save(&mut conn, "other", b"1");
        save(&mut conn, "watched", b"1");
        assert_eq!(*seen.lock(), vec![("watched".to_string(), 2)]);

        drop(observer);
        save(&mut conn, "watched", b"2");
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn file_engine_persists_and_is_shared() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.revdb");
        {
            let engine = RevisionEngine::open(&path, true).unwrap();
            let same = RevisionEngine::open(&path, true).unwrap();
            let mut conn = engine.connect();
            save(&mut conn, "a", b"persisted");
            assert!(same.connect().get_current_revision("a").unwrap().is_some());
        }
        let engine = RevisionEngine::open(&path, true).unwrap();
        let rev = engine.connect().get_current_revision("a").unwrap().unwrap();
        assert_eq!(rev.body, b"persisted");
    }

    #[test]
    fn compaction_keeps_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.revdb");
        {
            let engine = RevisionEngine::open(&path, false).unwrap();
            let mut conn = engine.connect();
            for i in 0..10 {
                save(&mut conn, "a", format!("v{i}").as_bytes());
            }
            let before = engine.journal_size().unwrap();
            conn.compact().unwrap();
            assert!(engine.journal_size().unwrap() < before);
        }
        let engine = RevisionEngine::open(&path, false).unwrap();
        let conn = engine.connect();
        assert_eq!(conn.get_current_revision("a").unwrap().unwrap().body, b"v9");
        assert_eq!(conn.last_sequence().unwrap(), 10);
    }

    #[test]
    fn purge_takes_a_fresh_sequence() {
        let engine = RevisionEngine::in_memory();
        let mut conn = engine.connect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _observer = conn
            .observe_document("a", Box::new(move |_, seq| sink.lock().push(seq)))
            .unwrap();
        save(&mut conn, "a", b"1");
        save(&mut conn, "b", b"1");

        conn.begin_transaction().unwrap();
        conn.purge("a").unwrap();
        conn.end_transaction(true).unwrap();

        assert_eq!(*seen.lock(), vec![1, 3]);
        assert_eq!(conn.last_sequence().unwrap(), 3);
        let next = save(&mut conn, "c", b"1");
        assert_eq!(next.sequence, 4);
    }

    #[test]
    fn writes_prune_history_to_the_connection_depth() {
        let engine = RevisionEngine::in_memory();
        let mut conn = engine.connect().with_max_rev_tree_depth(3);
        let mut last = save(&mut conn, "a", b"0");
        for i in 1..10 {
            last = save(&mut conn, "a", format!("{i}").as_bytes());
        }
        let history = conn.revision_history("a", &last.rev_id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].generation(), 10);
        assert_eq!(history[2].generation(), 8);

        let reader = engine.connect();
        assert_eq!(reader.revision_history("a", &last.rev_id).unwrap().len(), 3);
    }

    #[test]
    fn closed_connection_rejects_calls() {
        let mut conn = RevisionEngine::in_memory().connect();
        conn.close().unwrap();
        assert!(matches!(
            conn.get_current_revision("a"),
            Err(StorageError::Closed)
        ));
        assert!(matches!(conn.begin_transaction(), Err(StorageError::Closed)));
    }
}
