//! Resolution of divergent revisions.
//!
//! A conflict exists when a document has a current (local) revision and an
//! open sibling (remote) revision, typically inserted by a replicator. The
//! resolver picks the content; the remote revision always stays in the
//! ancestry of the result and the local branch is closed.

use crate::database::Database;
use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::save::{encode_document, EMPTY_BODY};
use revdb_storage::{ResolveOutcome, Revision, RevisionFlags};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Both sides of a conflicted document. A side is `None` if it is a deletion.
#[derive(Debug, Clone)]
pub struct Conflict {
    document_id: String,
    local: Option<Document>,
    remote: Option<Document>,
}

impl Conflict {
    /// Creates a conflict description.
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        local: Option<Document>,
        remote: Option<Document>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            local,
            remote,
        }
    }

    /// The conflicted document id.
    #[must_use]
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// The current local version, `None` if deleted.
    #[must_use]
    pub fn local(&self) -> Option<&Document> {
        self.local.as_ref()
    }

    /// The conflicting remote version, `None` if deleted.
    #[must_use]
    pub fn remote(&self) -> Option<&Document> {
        self.remote.as_ref()
    }
}

/// Decides the content of a conflicted document.
///
/// Return `Some(document)` for the merged content or `None` to resolve to a
/// deletion. Errors abort [`Database::resolve_conflict`] and leave the
/// conflict in place. Closures with the same signature are resolvers too.
pub trait ConflictResolver {
    /// Resolves `conflict`.
    ///
    /// # Errors
    ///
    /// Any error is returned unchanged to the caller of `resolve_conflict`.
    fn resolve(&self, conflict: &Conflict) -> CoreResult<Option<Document>>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict) -> CoreResult<Option<Document>>,
{
    fn resolve(&self, conflict: &Conflict) -> CoreResult<Option<Document>> {
        self(conflict)
    }
}

/// Deletions win; otherwise the higher generation, then the larger revision
/// id.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConflictResolver;

impl ConflictResolver for DefaultConflictResolver {
    fn resolve(&self, conflict: &Conflict) -> CoreResult<Option<Document>> {
        let (Some(local), Some(remote)) = (conflict.local(), conflict.remote()) else {
            return Ok(None);
        };
        let by_generation = local.generation().cmp(&remote.generation());
        let winner = match by_generation.then_with(|| local.revision_id().cmp(&remote.revision_id()))
        {
            Ordering::Greater => local,
            Ordering::Less | Ordering::Equal => remote,
        };
        Ok(Some(winner.clone()))
    }
}

enum Resolution {
    Done,
    Sides(Revision, Revision),
}

impl Database {
    /// Resolves the conflict on `doc_id`, if there is one.
    ///
    /// The sides are re-read on every attempt; if another writer changes the
    /// document while the resolver runs, the resolver is called again with
    /// the new sides. Returns `Ok` immediately if there is nothing to
    /// resolve.
    ///
    /// If both sides are deletions the resolver is not called; a deletion is
    /// written on top of the remote revision so the result descends from it.
    ///
    /// # Errors
    ///
    /// Returns resolver errors unchanged, [`CoreError::NotFound`] for an
    /// unknown document and [`CoreError::InvalidParameter`] if the resolved
    /// document belongs to another database.
    pub fn resolve_conflict<R>(&self, doc_id: &str, resolver: &R) -> CoreResult<()>
    where
        R: ConflictResolver + ?Sized,
    {
        self.logged(|| loop {
            let sides = self.inner.in_batch(|| {
                let local = self
                    .current_revision(doc_id)?
                    .ok_or_else(|| CoreError::not_found(doc_id))?;
                let remote = self
                    .inner
                    .with_store(|store| store.get_conflicting_revision(doc_id))?;
                Ok(match remote {
                    Some(remote) => Resolution::Sides(local, remote),
                    None => Resolution::Done,
                })
            })?;
            let Resolution::Sides(local, remote) = sides else {
                debug!(doc_id, "no conflict to resolve");
                return Ok(());
            };

            let merged = if local.is_deleted() && remote.is_deleted() {
                Some((EMPTY_BODY.to_vec(), RevisionFlags::DELETED))
            } else {
                let resolved = self.run_resolver(doc_id, &local, &remote, resolver)?;
                self.merged_content(&remote, resolved)?
            };

            let outcome = self.inner.in_batch(|| {
                let (body, flags) = match merged.clone() {
                    Some((body, flags)) => (Some(body), flags),
                    None => (None, RevisionFlags::NONE),
                };
                self.inner.with_store(|store| {
                    store.resolve_conflict(
                        doc_id,
                        &local.rev_id,
                        &remote.rev_id,
                        &local.rev_id,
                        body,
                        flags,
                    )
                })
            })?;
            match outcome {
                ResolveOutcome::Resolved(revision) => {
                    debug!(
                        doc_id,
                        winner = %remote.rev_id,
                        rev = %revision.rev_id,
                        "conflict resolved"
                    );
                    return Ok(());
                }
                ResolveOutcome::Conflict => {
                    debug!(doc_id, "document changed during resolution, retrying");
                }
            }
        })
    }

    fn run_resolver<R>(
        &self,
        doc_id: &str,
        local: &Revision,
        remote: &Revision,
        resolver: &R,
    ) -> CoreResult<Option<Document>>
    where
        R: ConflictResolver + ?Sized,
    {
        let side = |revision: &Revision| -> CoreResult<Option<Document>> {
            if revision.is_deleted() {
                Ok(None)
            } else {
                Document::from_revision(revision, self.inner.id).map(Some)
            }
        };
        let conflict = Conflict::new(doc_id, side(local)?, side(remote)?);
        let Some(mut resolved) = resolver.resolve(&conflict)? else {
            return Ok(None);
        };
        if resolved.id() != doc_id {
            warn!(
                doc_id,
                resolved_id = %resolved.id(),
                "resolver returned a document with another id, correcting"
            );
            resolved = resolved.clone_with_id(doc_id);
        }
        resolved.bind(self.inner.id)?;
        Ok(Some(resolved))
    }

    /// Content to write under the remote revision; `None` if the remote
    /// revision itself is the result.
    fn merged_content(
        &self,
        remote: &Revision,
        resolved: Option<Document>,
    ) -> CoreResult<Option<(Vec<u8>, RevisionFlags)>> {
        match resolved {
            None if remote.is_deleted() => Ok(None),
            None => Ok(Some((EMPTY_BODY.to_vec(), RevisionFlags::DELETED))),
            Some(doc) => {
                let unchanged = doc.revision_id() == Some(&remote.rev_id)
                    && !remote.is_deleted()
                    && Document::from_revision(remote, self.inner.id)
                        .is_ok_and(|stored| stored.body() == doc.body());
                if unchanged {
                    Ok(None)
                } else {
                    encode_document(&doc, false).map(Some)
                }
            }
        }
    }
}
