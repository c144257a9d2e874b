//! A replicator stand-in.
//!
//! [`RemotePeer`] writes to a store through its own connection, so its
//! writes are external to every [`Database`](revdb_core::Database) handle on
//! that store. It can also insert revisions with explicit ancestry, which is
//! how conflicting siblings appear.

use revdb_codec::{encode_body, Dict};
use revdb_core::Document;
use revdb_storage::{
    EngineConnection, InsertOutcome, PutOutcome, RevisionEngine, RevisionFlags, RevisionId,
    RevisionStore,
};

const EMPTY_BODY: &[u8] = &[0xa0];

/// Writes to a shared store as another connection.
pub struct RemotePeer {
    conn: EngineConnection,
}

impl RemotePeer {
    /// Connects to `engine`.
    pub fn new(engine: &RevisionEngine) -> Self {
        Self {
            conn: engine.connect(),
        }
    }

    /// Inserts a live revision branching from `parent`, as if pulled from a
    /// peer. Returns its id.
    pub fn insert_sibling(&mut self, doc_id: &str, parent: &RevisionId, body: &Dict) -> RevisionId {
        let body = encode_body(body).expect("Failed to encode body");
        self.insert(doc_id, parent, body, RevisionFlags::NONE)
    }

    /// Inserts a deletion branching from `parent`.
    pub fn insert_deletion(&mut self, doc_id: &str, parent: &RevisionId) -> RevisionId {
        self.insert(doc_id, parent, EMPTY_BODY.to_vec(), RevisionFlags::DELETED)
    }

    /// Creates a sibling of `doc`'s parent revision: the result conflicts
    /// with `doc`'s current revision.
    pub fn conflict_with(&mut self, doc: &Document, body: &Dict) -> RevisionId {
        let current = doc.revision_id().expect("Document was never saved");
        let history = self
            .conn
            .revision_history(doc.id(), current)
            .expect("Failed to read history");
        let parent = history.get(1).expect("Document needs a parent revision");
        self.insert_sibling(doc.id(), parent, body)
    }

    /// Writes `body` on top of the current revision (or creates the
    /// document). Returns the new revision id.
    pub fn update(&mut self, doc_id: &str, body: &Dict) -> RevisionId {
        let body = encode_body(body).expect("Failed to encode body");
        self.conn.begin_transaction().expect("Failed to begin");
        let current = self
            .conn
            .get_current_revision(doc_id)
            .expect("Failed to read current revision");
        let outcome = match current {
            Some(current) if !current.is_deleted() => self
                .conn
                .update_revision(doc_id, &current.rev_id, body, RevisionFlags::NONE),
            _ => self.conn.create_revision(doc_id, body, RevisionFlags::NONE),
        }
        .expect("Failed to write revision");
        self.conn.end_transaction(true).expect("Failed to commit");
        match outcome {
            PutOutcome::Created(revision) => revision.rev_id,
            PutOutcome::Conflict => panic!("peer write conflicted on {doc_id}"),
        }
    }

    /// Number of live documents as seen by the peer.
    pub fn count(&self) -> u64 {
        self.conn.document_count().expect("Failed to count")
    }

    fn insert(
        &mut self,
        doc_id: &str,
        parent: &RevisionId,
        body: Vec<u8>,
        flags: RevisionFlags,
    ) -> RevisionId {
        let rev = RevisionId::derive(Some(parent), flags.is_deleted(), &body);
        let mut history = vec![rev.clone()];
        history.extend(
            self.conn
                .revision_history(doc_id, parent)
                .expect("Parent revision unknown"),
        );
        self.conn.begin_transaction().expect("Failed to begin");
        let outcome = self
            .conn
            .insert_existing_revision(doc_id, &history, body, flags)
            .expect("Failed to insert revision");
        self.conn.end_transaction(true).expect("Failed to commit");
        if let InsertOutcome::AlreadyPresent = outcome {
            panic!("revision {rev} already present");
        }
        rev
    }
}
