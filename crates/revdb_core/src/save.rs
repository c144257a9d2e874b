//! Optimistic saves, deletes and purges.
//!
//! A save names the revision it was based on. If that revision is no longer
//! current the store reports a conflict and the concurrency mode decides:
//! `FailOnConflict` gives up, `LastWriteWins` re-reads the current revision
//! and writes on top of it once.

use crate::database::Database;
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use revdb_codec::encode_body;
use revdb_storage::{PutOutcome, Revision, RevisionFlags, RevisionId};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

/// Body stored for deletions and empty documents: an empty CBOR map.
pub(crate) const EMPTY_BODY: &[u8] = &[0xa0];

/// What to do when a save finds its base revision is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyControl {
    /// Write on top of whatever is current.
    #[default]
    LastWriteWins,
    /// Report the conflict and write nothing.
    FailOnConflict,
}

enum SaveOutcome {
    Stored(Revision),
    Adopted(Revision),
    AlreadyGone,
    Rejected,
}

pub(crate) fn encode_document(doc: &Document, deletion: bool) -> CoreResult<(Vec<u8>, RevisionFlags)> {
    if deletion {
        return Ok((EMPTY_BODY.to_vec(), RevisionFlags::DELETED));
    }
    if doc.body().is_empty() {
        return Ok((EMPTY_BODY.to_vec(), RevisionFlags::NONE));
    }
    let flags = if doc.has_attachments() {
        RevisionFlags::HAS_ATTACHMENTS
    } else {
        RevisionFlags::NONE
    };
    Ok((encode_body(doc.body())?, flags))
}

impl Database {
    fn put_revision(
        &self,
        doc_id: &str,
        base: Option<&RevisionId>,
        body: Vec<u8>,
        flags: RevisionFlags,
    ) -> CoreResult<PutOutcome> {
        self.inner.with_store(|store| match base {
            Some(base) => store.update_revision(doc_id, base, body, flags),
            None => store.create_revision(doc_id, body, flags),
        })
    }

    pub(crate) fn save_internal(
        &self,
        doc: &mut Document,
        base: Option<&Document>,
        concurrency: ConcurrencyControl,
        deletion: bool,
    ) -> CoreResult<bool> {
        if deletion && doc.revision_id().is_none() {
            return Err(CoreError::not_found(doc.id()));
        }
        doc.bind(self.inner.id)?;

        let doc_id = doc.id().to_string();
        let base_rev = base
            .and_then(Document::revision_id)
            .or_else(|| doc.revision_id())
            .cloned();
        let snapshot: &Document = doc;

        let outcome = self.inner.in_batch(|| {
            let (body, flags) = encode_document(snapshot, deletion)?;
            let retry_body = body.clone();
            if let PutOutcome::Created(revision) =
                self.put_revision(&doc_id, base_rev.as_ref(), body, flags)?
            {
                return Ok(SaveOutcome::Stored(revision));
            }
            debug!(doc_id = %doc_id, base = ?base_rev, "save conflicted");
            if concurrency == ConcurrencyControl::FailOnConflict {
                return Ok(SaveOutcome::Rejected);
            }

            let current = self.current_revision(&doc_id)?;
            if deletion {
                match current {
                    None => return Ok(SaveOutcome::AlreadyGone),
                    Some(current) if current.is_deleted() => {
                        return Ok(SaveOutcome::Adopted(current))
                    }
                    Some(_) => {}
                }
            }
            let current_rev = current.map(|c| c.rev_id);
            match self.put_revision(&doc_id, current_rev.as_ref(), retry_body, flags)? {
                PutOutcome::Created(revision) => Ok(SaveOutcome::Stored(revision)),
                PutOutcome::Conflict => Err(CoreError::conflict(doc_id.as_str())),
            }
        })?;

        match outcome {
            SaveOutcome::Stored(revision) => {
                debug!(doc_id = %doc_id, rev = %revision.rev_id, deletion, "document saved");
                doc.apply_revision(&revision);
                Ok(true)
            }
            SaveOutcome::Adopted(revision) => {
                debug!(doc_id = %doc_id, rev = %revision.rev_id, "already deleted");
                doc.apply_revision(&revision);
                Ok(true)
            }
            SaveOutcome::AlreadyGone => {
                debug!(doc_id = %doc_id, "deleted document no longer exists");
                doc.clear_revision();
                Ok(true)
            }
            SaveOutcome::Rejected => Ok(false),
        }
    }

    /// Saves a document, overwriting concurrent changes.
    ///
    /// On success the document carries its new revision id.
    ///
    /// # Errors
    ///
    /// Fails if the document belongs to another database, the body cannot
    /// be encoded, or the write keeps conflicting.
    pub fn save(&self, doc: &mut Document) -> CoreResult<()> {
        self.save_with_concurrency(doc, ConcurrencyControl::LastWriteWins)
            .map(|_| ())
    }

    /// Saves a document. Returns false if `FailOnConflict` found a newer
    /// revision.
    ///
    /// # Errors
    ///
    /// See [`save`](Self::save).
    pub fn save_with_concurrency(
        &self,
        doc: &mut Document,
        concurrency: ConcurrencyControl,
    ) -> CoreResult<bool> {
        self.logged(|| self.save_internal(doc, None, concurrency, false))
    }

    /// Saves a document, letting `handler` merge conflicting changes.
    ///
    /// On conflict the handler receives the document being saved and the
    /// current stored version (`None` if that is a deletion). Returning true
    /// retries the save on top of the stored version; returning false (or
    /// panicking) gives up and returns false. Retries are unbounded.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] if the document was purged while
    /// resolving, or with any non-conflict save error.
    pub fn save_with_handler<F>(&self, doc: &mut Document, mut handler: F) -> CoreResult<bool>
    where
        F: FnMut(&mut Document, Option<&Document>) -> bool,
    {
        self.logged(|| {
            let mut base: Option<Document> = None;
            loop {
                if self.save_internal(
                    doc,
                    base.as_ref(),
                    ConcurrencyControl::FailOnConflict,
                    false,
                )? {
                    return Ok(true);
                }

                let current = self
                    .get_document_with_deleted(doc.id())?
                    .ok_or_else(|| CoreError::not_found(doc.id()))?;
                let visible = (!current.is_deleted()).then_some(&current);
                let accepted = panic::catch_unwind(AssertUnwindSafe(|| handler(doc, visible)))
                    .unwrap_or_else(|_| {
                        warn!(doc_id = %current.id(), "conflict handler panicked");
                        false
                    });
                if !accepted {
                    debug!(doc_id = %current.id(), "conflict handler declined");
                    return Ok(false);
                }
                base = Some(current);
            }
        })
    }

    /// Deletes a document, replacing whatever is current.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] if the document was never saved.
    pub fn delete(&self, doc: &mut Document) -> CoreResult<()> {
        self.delete_with_concurrency(doc, ConcurrencyControl::LastWriteWins)
            .map(|_| ())
    }

    /// Deletes a document. Returns false if `FailOnConflict` found a newer
    /// revision.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] if the document was never saved.
    pub fn delete_with_concurrency(
        &self,
        doc: &mut Document,
        concurrency: ConcurrencyControl,
    ) -> CoreResult<bool> {
        self.logged(|| self.save_internal(doc, None, concurrency, true))
    }

    /// Removes a document and its history without leaving a deletion.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] if the document is not stored.
    pub fn purge(&self, doc: &mut Document) -> CoreResult<()> {
        doc.bind(self.inner.id)?;
        self.purge_by_id(doc.id())?;
        doc.clear_revision();
        Ok(())
    }

    /// Removes a document by id.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] if the document is not stored.
    pub fn purge_by_id(&self, doc_id: &str) -> CoreResult<()> {
        self.logged(|| {
            self.inner
                .in_batch(|| self.inner.with_store(|store| store.purge(doc_id)))?;
            debug!(doc_id, "document purged");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revdb_codec::Value;

    fn open() -> Database {
        Database::open_in_memory("save").unwrap()
    }

    fn saved(db: &Database, id: &str, n: i64) -> Document {
        let mut doc = Document::with_id(id);
        doc.set("n", n);
        db.save(&mut doc).unwrap();
        doc
    }

    #[test]
    fn first_save_and_update() {
        let db = open();
        let mut doc = saved(&db, "a", 1);
        assert_eq!(doc.generation(), 1);
        assert!(doc.exists());

        doc.set("n", 2);
        db.save(&mut doc).unwrap();
        assert_eq!(doc.generation(), 2);
        assert_eq!(doc.sequence(), 2);
        let stored = db.get_document("a").unwrap().unwrap();
        assert_eq!(stored.get("n"), Some(&Value::Integer(2)));
    }

    #[test]
    fn empty_body_saves() {
        let db = open();
        let mut doc = Document::with_id("empty");
        db.save(&mut doc).unwrap();
        let stored = db.current_revision("empty").unwrap().unwrap();
        assert_eq!(stored.body, EMPTY_BODY);
    }

    #[test]
    fn attachments_flagged() {
        let db = open();
        let mut doc = Document::with_id("a");
        doc.set("data", Value::Bytes(vec![1, 2]));
        db.save(&mut doc).unwrap();
        let stored = db.current_revision("a").unwrap().unwrap();
        assert!(stored.flags.has_attachments());
    }

    #[test]
    fn fail_on_conflict_rejects_stale_base() {
        let db = open();
        saved(&db, "a", 1);
        let mut first = db.get_document("a").unwrap().unwrap();
        let mut second = db.get_document("a").unwrap().unwrap();

        first.set("n", 2);
        assert!(db
            .save_with_concurrency(&mut first, ConcurrencyControl::FailOnConflict)
            .unwrap());
        second.set("n", 3);
        assert!(!db
            .save_with_concurrency(&mut second, ConcurrencyControl::FailOnConflict)
            .unwrap());
        assert_eq!(second.generation(), 1);
        let stored = db.get_document("a").unwrap().unwrap();
        assert_eq!(stored.get("n"), Some(&Value::Integer(2)));
    }

    #[test]
    fn last_write_wins_forces_onto_current() {
        let db = open();
        saved(&db, "a", 1);
        let mut first = db.get_document("a").unwrap().unwrap();
        let mut second = db.get_document("a").unwrap().unwrap();

        first.set("n", 2);
        db.save(&mut first).unwrap();
        second.set("n", 3);
        db.save(&mut second).unwrap();

        assert_eq!(second.generation(), 3);
        let stored = db.get_document("a").unwrap().unwrap();
        assert_eq!(stored.get("n"), Some(&Value::Integer(3)));
        assert!(db.documents_in_conflict().unwrap().is_empty());
    }

    #[test]
    fn deleting_unsaved_document_is_not_found() {
        let db = open();
        let mut doc = Document::with_id("a");
        assert!(db.delete(&mut doc).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_adopts_existing_deletion() {
        let db = open();
        saved(&db, "a", 1);
        let mut first = db.get_document("a").unwrap().unwrap();
        let mut second = db.get_document("a").unwrap().unwrap();

        db.delete(&mut first).unwrap();
        let sequence = db.last_sequence().unwrap();
        db.delete(&mut second).unwrap();

        assert!(second.is_deleted());
        assert_eq!(second.revision_id(), first.revision_id());
        assert_eq!(db.last_sequence().unwrap(), sequence);
        assert!(db.get_document("a").unwrap().is_none());
    }

    #[test]
    fn delete_of_purged_document_is_noop() {
        let db = open();
        let mut doc = saved(&db, "a", 1);
        let mut copy = doc.clone();
        db.purge(&mut doc).unwrap();
        assert!(!doc.exists());

        db.delete(&mut copy).unwrap();
        assert!(!copy.exists());
        assert!(copy.revision_id().is_none());
        assert_eq!(copy.sequence(), 0);
        assert!(db.current_revision("a").unwrap().is_none());
        assert!(db.purge_by_id("a").unwrap_err().is_not_found());

        assert!(db.delete(&mut copy).unwrap_err().is_not_found());
    }

    #[test]
    fn recreate_after_delete() {
        let db = open();
        let mut doc = saved(&db, "a", 1);
        db.delete(&mut doc).unwrap();

        let mut again = Document::with_id("a");
        again.set("n", 5);
        db.save(&mut again).unwrap();
        assert_eq!(again.generation(), 3);
        assert_eq!(db.count().unwrap(), 1);
    }

    #[test]
    fn handler_merges_and_retries() {
        let db = open();
        saved(&db, "a", 1);
        let mut first = db.get_document("a").unwrap().unwrap();
        let mut second = db.get_document("a").unwrap().unwrap();
        first.set("left", 1);
        db.save(&mut first).unwrap();

        second.set("right", 1);
        let mut calls = 0;
        let saved = db
            .save_with_handler(&mut second, |mine, current| {
                calls += 1;
                if let Some(current) = current {
                    for (key, value) in current.body() {
                        if !mine.contains(key) {
                            mine.set(key.clone(), value.clone());
                        }
                    }
                }
                true
            })
            .unwrap();
        assert!(saved);
        assert_eq!(calls, 1);
        let stored = db.get_document("a").unwrap().unwrap();
        assert!(stored.contains("left"));
        assert!(stored.contains("right"));
        assert_eq!(stored.generation(), 3);
    }

    #[test]
    fn handler_decline_or_panic_returns_false() {
        let db = open();
        saved(&db, "a", 1);
        let mut stale = db.get_document("a").unwrap().unwrap();
        let mut fresh = db.get_document("a").unwrap().unwrap();
        fresh.set("n", 2);
        db.save(&mut fresh).unwrap();

        stale.set("n", 9);
        assert!(!db.save_with_handler(&mut stale, |_, _| false).unwrap());
        assert!(!db
            .save_with_handler(&mut stale, |_, _| panic!("handler failure"))
            .unwrap());
        let stored = db.get_document("a").unwrap().unwrap();
        assert_eq!(stored.get("n"), Some(&Value::Integer(2)));
    }

    #[test]
    fn handler_sees_none_for_deleted_current() {
        let db = open();
        saved(&db, "a", 1);
        let mut stale = db.get_document("a").unwrap().unwrap();
        let mut other = db.get_document("a").unwrap().unwrap();
        db.delete(&mut other).unwrap();

        stale.set("n", 2);
        let mut seen_none = false;
        assert!(db
            .save_with_handler(&mut stale, |_, current| {
                seen_none = current.is_none();
                true
            })
            .unwrap());
        assert!(seen_none);
        assert!(db.get_document("a").unwrap().is_some());
    }

    #[test]
    fn handler_on_purged_document_is_not_found() {
        let db = open();
        saved(&db, "a", 1);
        let mut stale = db.get_document("a").unwrap().unwrap();
        db.purge_by_id("a").unwrap();
        let err = db.save_with_handler(&mut stale, |_, _| true).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn documents_bound_to_one_database() {
        let first = open();
        let second = Database::open_in_memory("other").unwrap();
        let mut doc = saved(&first, "a", 1);
        assert!(matches!(
            second.save(&mut doc),
            Err(CoreError::InvalidParameter { .. })
        ));
    }
}
