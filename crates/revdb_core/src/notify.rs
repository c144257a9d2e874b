//! Change notification pipeline.
//!
//! The store signals new changes from whatever thread committed them. Those
//! signals only enqueue a [`Job`] on the database's delivery queue: a single
//! worker thread that processes jobs in FIFO order. For a database-level job
//! the worker drains the store's change observer in pages under the database
//! lock, groups the ids into [`DatabaseChange`] events, releases the lock and
//! then calls the listeners.
//!
//! An event is flushed when the store has no more changes, when the origin
//! (local or external) changes between pages, or when adding the next page
//! would exceed the configured batch bound.
//!
//! Native observers are reference counted: the first database listener
//! creates the store observer and the last one removed drops it; the same
//! holds per document id.

use crate::database::{Database, DatabaseInner};
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::DatabaseState;
use revdb_storage::{ChangeCallback, ChangeObserver, DocumentCallback, DocumentObserver};
use std::collections::{hash_map::Entry, BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Runs listener callbacks somewhere other than the delivery worker.
pub trait Scheduler: Send + Sync {
    /// Schedules `job` to run once.
    fn schedule(&self, job: Box<dyn FnOnce() + Send>);
}

/// A group of document ids changed through one origin.
#[derive(Debug, Clone)]
pub struct DatabaseChange {
    /// The database that changed.
    pub database: Database,
    /// Changed ids, in commit order. An id may appear more than once.
    pub document_ids: Vec<String>,
    /// True if the changes were made through another handle.
    pub is_external: bool,
}

/// A change to one observed document.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    /// The database that changed.
    pub database: Database,
    /// The changed document.
    pub document_id: String,
}

/// What a [`ListenerToken`] is registered for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Database-wide changes.
    Database,
    /// Changes to a single document.
    Document(String),
}

/// Handle returned when adding a listener; pass it back to remove it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerToken {
    id: u64,
    kind: ListenerKind,
}

impl ListenerToken {
    /// Returns what the listener observes.
    #[must_use]
    pub fn kind(&self) -> &ListenerKind {
        &self.kind
    }
}

pub(crate) struct Listener<E> {
    handler: Arc<dyn Fn(&E) + Send + Sync>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<E: Send + 'static> Listener<E> {
    fn new(
        handler: impl Fn(&E) + Send + Sync + 'static,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            scheduler,
        }
    }

    fn dispatch(&self, event: E) {
        match &self.scheduler {
            None => invoke(self.handler.as_ref(), &event),
            Some(scheduler) => {
                let handler = Arc::clone(&self.handler);
                scheduler.schedule(Box::new(move || invoke(handler.as_ref(), &event)));
            }
        }
    }
}

fn invoke<E>(handler: &(dyn Fn(&E) + Send + Sync), event: &E) {
    if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        warn!("change listener panicked");
    }
}

struct ObservedDocument {
    _observer: Box<dyn DocumentObserver>,
    listeners: usize,
}

/// Observers and listeners of one database, guarded by the database lock.
#[derive(Default)]
pub(crate) struct ObserverTable {
    next_id: u64,
    db_observer: Option<Box<dyn ChangeObserver>>,
    db_listeners: BTreeMap<u64, Listener<DatabaseChange>>,
    doc_observers: HashMap<String, ObservedDocument>,
    doc_listeners: BTreeMap<u64, (String, Listener<DocumentChange>)>,
}

impl ObserverTable {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Drops every native observer and listener.
    pub(crate) fn clear(&mut self) {
        self.db_observer = None;
        self.db_listeners.clear();
        self.doc_observers.clear();
        self.doc_listeners.clear();
    }
}

/// One flushed group of ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChangeSet {
    pub(crate) ids: Vec<String>,
    pub(crate) external: bool,
}

/// Accumulates drained pages into bounded, single-origin change sets.
pub(crate) struct ChangeBatcher {
    max: usize,
    pending: Vec<String>,
    external: bool,
    flushed: Vec<ChangeSet>,
}

impl ChangeBatcher {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            pending: Vec::new(),
            external: false,
            flushed: Vec::new(),
        }
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.flushed.push(ChangeSet {
                ids: std::mem::take(&mut self.pending),
                external: self.external,
            });
        }
    }

    pub(crate) fn push_page(&mut self, ids: Vec<String>, external: bool) {
        if external != self.external {
            self.flush();
            self.external = external;
        }
        for chunk in ids.chunks(self.max) {
            if self.pending.len() + chunk.len() > self.max {
                self.flush();
            }
            self.pending.extend_from_slice(chunk);
        }
    }

    pub(crate) fn finish(mut self) -> Vec<ChangeSet> {
        self.flush();
        self.flushed
    }
}

/// Work for the delivery worker.
#[derive(Debug)]
pub(crate) enum Job {
    DatabaseChanged,
    DocumentChanged(String),
}

/// Single-worker FIFO queue between store callbacks and listeners.
pub(crate) struct DeliveryQueue {
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("open", &self.sender.lock().is_some())
            .finish()
    }
}

impl DeliveryQueue {
    pub(crate) fn new() -> (Self, Receiver<Job>) {
        let (sender, receiver) = mpsc::channel();
        let queue = Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(None),
        };
        (queue, receiver)
    }

    pub(crate) fn post(&self, job: Job) {
        if let Some(sender) = self.sender.lock().as_ref() {
            if sender.send(job).is_err() {
                debug!("delivery worker gone, dropping job");
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        drop(self.sender.lock().take());
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            warn!("delivery worker panicked");
        }
    }

    pub(crate) fn start(inner: &Arc<DatabaseInner>, jobs: Receiver<Job>) -> CoreResult<()> {
        let weak = Arc::downgrade(inner);
        let dispatch = inner.config.log_dispatch.clone();
        let span = inner.span.clone();
        let run = move || {
            let _entered = span.enter();
            for job in jobs {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Database { inner }.deliver(job);
            }
            debug!("delivery worker stopped");
        };
        let handle = thread::Builder::new()
            .name(format!("revdb-delivery-{}", inner.name))
            .spawn(move || match dispatch {
                Some(dispatch) => tracing::dispatcher::with_default(&dispatch, run),
                None => run(),
            })
            .map_err(|e| CoreError::unexpected(format!("cannot start delivery worker: {e}")))?;
        *inner.queue.worker.lock() = Some(handle);
        Ok(())
    }
}

fn post_to(queue: &Weak<DeliveryQueue>, job: Job) {
    if let Some(queue) = queue.upgrade() {
        queue.post(job);
    }
}

impl DatabaseInner {
    /// Drains the store observer into change sets and snapshots listeners.
    fn collect_changes(&self) -> (Vec<ChangeSet>, Vec<Listener<DatabaseChange>>) {
        let page_size = self.config.effective_page_size();
        let max_batch = self.config.max_change_batch;
        self.with_state(|s| {
            if s.state != DatabaseState::Open {
                return (Vec::new(), Vec::new());
            }
            let Some(observer) = s.observers.db_observer.as_mut() else {
                return (Vec::new(), Vec::new());
            };
            let mut batcher = ChangeBatcher::new(max_batch);
            loop {
                let page = observer.drain(page_size);
                if page.is_empty() {
                    break;
                }
                let ids = page.entries.into_iter().map(|e| e.doc_id).collect();
                batcher.push_page(ids, page.external);
            }
            let listeners = s.observers.db_listeners.values().cloned().collect();
            (batcher.finish(), listeners)
        })
    }

    fn document_listeners(&self, doc_id: &str) -> Vec<Listener<DocumentChange>> {
        self.with_state(|s| {
            if s.state != DatabaseState::Open {
                return Vec::new();
            }
            s.observers
                .doc_listeners
                .values()
                .filter(|(id, _)| id == doc_id)
                .map(|(_, listener)| listener.clone())
                .collect()
        })
    }
}

impl Database {
    fn deliver(&self, job: Job) {
        match job {
            Job::DatabaseChanged => {
                let (sets, listeners) = self.inner.collect_changes();
                for set in sets {
                    debug!(
                        count = set.ids.len(),
                        external = set.external,
                        "delivering database change"
                    );
                    let event = DatabaseChange {
                        database: self.clone(),
                        document_ids: set.ids,
                        is_external: set.external,
                    };
                    for listener in &listeners {
                        listener.dispatch(event.clone());
                    }
                }
            }
            Job::DocumentChanged(doc_id) => {
                for listener in self.inner.document_listeners(&doc_id) {
                    listener.dispatch(DocumentChange {
                        database: self.clone(),
                        document_id: doc_id.clone(),
                    });
                }
            }
        }
    }

    /// Adds a database-wide change listener.
    ///
    /// Without a scheduler the handler runs on the delivery worker. Panics in
    /// the handler are caught and logged.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::DatabaseClosed`] after close.
    pub fn add_change_listener<F>(
        &self,
        scheduler: Option<Arc<dyn Scheduler>>,
        handler: F,
    ) -> CoreResult<ListenerToken>
    where
        F: Fn(&DatabaseChange) + Send + Sync + 'static,
    {
        let queue = Arc::downgrade(&self.inner.queue);
        self.logged(|| {
            self.inner.with_state(|s| {
                s.ensure_open()?;
                if s.observers.db_observer.is_none() {
                    let callback: ChangeCallback =
                        Box::new(move || post_to(&queue, Job::DatabaseChanged));
                    let observer = s.store_mut()?.observe_database(callback)?;
                    s.observers.db_observer = Some(observer);
                    debug!("database observer created");
                }
                let id = s.observers.allocate_id();
                s.observers
                    .db_listeners
                    .insert(id, Listener::new(handler, scheduler));
                Ok(ListenerToken {
                    id,
                    kind: ListenerKind::Database,
                })
            })
        })
    }

    /// Adds a listener for changes to one document.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::DatabaseClosed`] after close.
    pub fn add_document_change_listener<F>(
        &self,
        doc_id: &str,
        scheduler: Option<Arc<dyn Scheduler>>,
        handler: F,
    ) -> CoreResult<ListenerToken>
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        let queue = Arc::downgrade(&self.inner.queue);
        self.logged(|| {
            self.inner.with_state(|s| {
                s.ensure_open()?;
                if !s.observers.doc_observers.contains_key(doc_id) {
                    let callback: DocumentCallback = Box::new(move |id: &str, _sequence: u64| {
                        post_to(&queue, Job::DocumentChanged(id.to_string()));
                    });
                    let observer = s.store_mut()?.observe_document(doc_id, callback)?;
                    s.observers.doc_observers.insert(
                        doc_id.to_string(),
                        ObservedDocument {
                            _observer: observer,
                            listeners: 0,
                        },
                    );
                    debug!(doc_id, "document observer created");
                }
                if let Some(observed) = s.observers.doc_observers.get_mut(doc_id) {
                    observed.listeners += 1;
                }
                let id = s.observers.allocate_id();
                s.observers
                    .doc_listeners
                    .insert(id, (doc_id.to_string(), Listener::new(handler, scheduler)));
                Ok(ListenerToken {
                    id,
                    kind: ListenerKind::Document(doc_id.to_string()),
                })
            })
        })
    }

    /// Removes a listener. Removing an unknown token is a no-op.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::DatabaseClosed`] after close.
    pub fn remove_change_listener(&self, token: &ListenerToken) -> CoreResult<()> {
        self.logged(|| {
            self.inner.with_state(|s| {
                s.ensure_open()?;
                match &token.kind {
                    ListenerKind::Database => {
                        if s.observers.db_listeners.remove(&token.id).is_some()
                            && s.observers.db_listeners.is_empty()
                        {
                            s.observers.db_observer = None;
                            debug!("database observer released");
                        }
                    }
                    ListenerKind::Document(doc_id) => {
                        if s.observers.doc_listeners.remove(&token.id).is_none() {
                            return Ok(());
                        }
                        if let Entry::Occupied(mut observed) =
                            s.observers.doc_observers.entry(doc_id.clone())
                        {
                            observed.get_mut().listeners -= 1;
                            if observed.get().listeners == 0 {
                                observed.remove();
                                debug!(doc_id = %doc_id, "document observer released");
                            }
                        }
                    }
                }
                Ok(())
            })
        })
    }
}
