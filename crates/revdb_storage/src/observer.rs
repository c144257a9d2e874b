//! Observer handles returned by engine connections.

use crate::engine::EngineShared;
use crate::store::{ChangeBatch, ChangeObserver, DocumentObserver};
use std::sync::Arc;

/// Database-wide observer registered on a [`crate::RevisionEngine`].
pub struct EngineChangeObserver {
    shared: Arc<EngineShared>,
    id: u64,
}

impl EngineChangeObserver {
    pub(crate) fn new(shared: Arc<EngineShared>, id: u64) -> Self {
        Self { shared, id }
    }
}

impl ChangeObserver for EngineChangeObserver {
    fn drain(&mut self, max: usize) -> ChangeBatch {
        if max == 0 {
            return ChangeBatch::default();
        }
        self.shared.drain(self.id, max)
    }
}

impl Drop for EngineChangeObserver {
    fn drop(&mut self) {
        self.shared.unregister_db_observer(self.id);
    }
}

/// Single-document observer registered on a [`crate::RevisionEngine`].
pub struct EngineDocumentObserver {
    shared: Arc<EngineShared>,
    id: u64,
    doc_id: String,
}

impl EngineDocumentObserver {
    pub(crate) fn new(shared: Arc<EngineShared>, id: u64, doc_id: String) -> Self {
        Self { shared, id, doc_id }
    }
}

impl DocumentObserver for EngineDocumentObserver {
    fn doc_id(&self) -> &str {
        &self.doc_id
    }
}

impl Drop for EngineDocumentObserver {
    fn drop(&mut self) {
        self.shared.unregister_doc_observer(self.id);
    }
}
