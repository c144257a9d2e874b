//! Listeners that record change events for later assertions.

use parking_lot::{Condvar, Mutex};
use revdb_core::{Database, ListenerToken};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One delivered change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedChange {
    /// Changed ids, in delivery order.
    pub document_ids: Vec<String>,
    /// Whether the change came through another handle.
    pub is_external: bool,
}

/// Records database and document change events.
#[derive(Default)]
pub struct ChangeRecorder {
    changes: Mutex<Vec<RecordedChange>>,
    changes_arrived: Condvar,
    documents: Mutex<Vec<String>>,
    documents_arrived: Condvar,
}

impl ChangeRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records every database change of `db`.
    pub fn listen(self: &Arc<Self>, db: &Database) -> ListenerToken {
        let recorder = Arc::clone(self);
        db.add_change_listener(None, move |change| {
            recorder.changes.lock().push(RecordedChange {
                document_ids: change.document_ids.clone(),
                is_external: change.is_external,
            });
            recorder.changes_arrived.notify_all();
        })
        .expect("Failed to add change listener")
    }

    /// Records changes of one document of `db`.
    pub fn listen_document(self: &Arc<Self>, db: &Database, doc_id: &str) -> ListenerToken {
        let recorder = Arc::clone(self);
        db.add_document_change_listener(doc_id, None, move |change| {
            recorder.documents.lock().push(change.document_id.clone());
            recorder.documents_arrived.notify_all();
        })
        .expect("Failed to add document listener")
    }

    /// Recorded database changes so far.
    pub fn changes(&self) -> Vec<RecordedChange> {
        self.changes.lock().clone()
    }

    /// Recorded document change ids so far.
    pub fn document_changes(&self) -> Vec<String> {
        self.documents.lock().clone()
    }

    /// All recorded database change ids, flattened.
    pub fn all_ids(&self) -> Vec<String> {
        self.changes
            .lock()
            .iter()
            .flat_map(|c| c.document_ids.iter().cloned())
            .collect()
    }

    /// Waits until at least `count` ids were recorded across database
    /// changes. Returns false on timeout.
    pub fn wait_for_ids(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut changes = self.changes.lock();
        loop {
            let recorded: usize = changes.iter().map(|c| c.document_ids.len()).sum();
            if recorded >= count {
                return true;
            }
            if self.changes_arrived.wait_until(&mut changes, deadline).timed_out() {
                return false;
            }
        }
    }

    /// Waits until at least `count` document events were recorded.
    pub fn wait_for_document_changes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut documents = self.documents.lock();
        while documents.len() < count {
            if self.documents_arrived.wait_until(&mut documents, deadline).timed_out() {
                return documents.len() >= count;
            }
        }
        true
    }
}
