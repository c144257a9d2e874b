//! Documents: an id, a body and the revision they were last read or saved at.

use crate::error::{CoreError, CoreResult};
use revdb_codec::{body_from_json_str, body_to_json, decode_body, dict_has_attachments, Dict, Value};
use revdb_storage::{Revision, RevisionFlags, RevisionId};
use uuid::Uuid;

/// Identity of an open database handle, used to bind documents to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct DatabaseId(pub(crate) u64);

/// A mutable document.
///
/// A document that has never been saved has no revision id. Once saved or
/// read through a database it is bound to that database; saving it through
/// another database fails with [`CoreError::InvalidParameter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    id: String,
    body: Dict,
    revision: Option<RevisionId>,
    sequence: u64,
    flags: RevisionFlags,
    exists: bool,
    owner: Option<DatabaseId>,
}

impl Document {
    /// Creates an empty document with a random UUID id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Creates an empty document with the given id.
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self::with_body(id, Dict::new())
    }

    /// Creates a document with the given id and body.
    #[must_use]
    pub fn with_body(id: impl Into<String>, body: Dict) -> Self {
        Self {
            id: id.into(),
            body,
            revision: None,
            sequence: 0,
            flags: RevisionFlags::NONE,
            exists: false,
            owner: None,
        }
    }

    /// Creates a document from a JSON object string.
    ///
    /// # Errors
    ///
    /// Fails if the text is not a JSON object or holds fractional numbers.
    pub fn from_json(id: impl Into<String>, json: &str) -> CoreResult<Self> {
        Ok(Self::with_body(id, body_from_json_str(json)?))
    }

    /// Returns the document id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the body.
    #[must_use]
    pub fn body(&self) -> &Dict {
        &self.body
    }

    /// Returns the body for editing.
    pub fn body_mut(&mut self) -> &mut Dict {
        &mut self.body
    }

    /// Replaces the body.
    pub fn set_body(&mut self, body: Dict) {
        self.body = body;
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.body.insert(key.into(), value.into())
    }

    /// Removes `key` from the body.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.body.remove(key)
    }

    /// Returns true if the body has `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.body.contains_key(key)
    }

    /// Returns the revision id, `None` if never saved.
    #[must_use]
    pub fn revision_id(&self) -> Option<&RevisionId> {
        self.revision.as_ref()
    }

    /// Returns the sequence of the last known revision (0 if never saved).
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the generation of the last known revision (0 if never saved).
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.revision.as_ref().map_or(0, RevisionId::generation)
    }

    /// Returns true if the last known revision is a deletion.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.flags.is_deleted()
    }

    /// Returns true if the document has been stored.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Returns true if the body holds blobs or raw bytes.
    #[must_use]
    pub fn has_attachments(&self) -> bool {
        dict_has_attachments(&self.body)
    }

    /// Returns the body as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        body_to_json(&self.body)
    }

    /// Copies the body into a new unsaved document with another id.
    #[must_use]
    pub fn clone_with_id(&self, id: impl Into<String>) -> Self {
        Self::with_body(id, self.body.clone())
    }

    /// Builds a document from a stored revision. Deleted revisions get an
    /// empty body.
    pub(crate) fn from_revision(revision: &Revision, owner: DatabaseId) -> CoreResult<Self> {
        let body = if revision.is_deleted() {
            Dict::new()
        } else {
            decode_body(&revision.body).map_err(|e| {
                CoreError::unexpected(format!(
                    "unreadable body for {}@{}: {e}",
                    revision.doc_id, revision.rev_id
                ))
            })?
        };
        let mut doc = Self::with_body(revision.doc_id.clone(), body);
        doc.apply_revision(revision);
        doc.owner = Some(owner);
        Ok(doc)
    }

    /// Records `revision` as the document's last known revision.
    pub(crate) fn apply_revision(&mut self, revision: &Revision) {
        self.revision = Some(revision.rev_id.clone());
        self.sequence = revision.sequence;
        self.flags = revision.flags;
        self.exists = true;
        if revision.is_deleted() {
            self.body.clear();
        }
    }

    /// Forgets the revision after a purge.
    pub(crate) fn clear_revision(&mut self) {
        self.revision = None;
        self.sequence = 0;
        self.flags = RevisionFlags::NONE;
        self.exists = false;
    }

    /// Binds the document to a database, once.
    pub(crate) fn bind(&mut self, owner: DatabaseId) -> CoreResult<()> {
        match self.owner {
            Some(current) if current != owner => Err(CoreError::invalid_parameter(format!(
                "document {} belongs to another database",
                self.id
            ))),
            _ => {
                self.owner = Some(owner);
                Ok(())
            }
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}
