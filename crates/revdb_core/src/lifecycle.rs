//! The database-wide lock, the open/closing/closed state machine and the
//! close drain of active stoppables.
//!
//! All mutable database state lives in [`LockedState`] behind one re-entrant
//! mutex. Short accessors borrow it for the duration of a single store call;
//! user code (handlers, resolvers, listeners) never runs while it is borrowed.
//!
//! Closing runs in three phases:
//!
//! 1. under the lock, mark the database `Closing` (new stoppables are refused)
//! 2. outside the lock, ask every active stoppable to stop and wait until all
//!    of them have deregistered, logging at every poll interval
//! 3. under the lock, release observers and the store and mark it `Closed`

use crate::database::{Database, DatabaseInner};
use crate::error::{CoreError, CoreResult};
use crate::notify::ObserverTable;
use revdb_storage::{RevisionStore, StorageResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle state of a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseState {
    /// Accepting operations.
    Open,
    /// Draining active stoppables; operations fail with `DatabaseClosed`.
    Closing,
    /// Resources released.
    Closed,
}

/// A long-lived dependent of a database (replicator, live query, ...) that
/// must stop before the database releases its store.
///
/// `stop` is a request: the stoppable confirms by calling
/// [`Database::deregister_stoppable`], possibly from another thread.
pub trait Stoppable: Send + Sync {
    /// Asks the stoppable to stop.
    fn stop(&self);

    /// Name used in close diagnostics.
    fn name(&self) -> String {
        "stoppable".to_string()
    }
}

/// Registration handle for a [`Stoppable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoppableToken(u64);

#[derive(Default)]
pub(crate) struct StoppableTable {
    next: u64,
    active: BTreeMap<u64, Arc<dyn Stoppable>>,
}

impl StoppableTable {
    fn names(&self) -> Vec<String> {
        self.active.values().map(|s| s.name()).collect()
    }
}

fn same_stoppable(a: &Arc<dyn Stoppable>, b: &Arc<dyn Stoppable>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

/// State guarded by the database lock.
pub(crate) struct LockedState {
    pub(crate) store: Option<Box<dyn RevisionStore>>,
    pub(crate) state: DatabaseState,
    pub(crate) batch_depth: usize,
    pub(crate) poisoned: bool,
    pub(crate) observers: ObserverTable,
}

impl LockedState {
    pub(crate) fn new(store: Box<dyn RevisionStore>) -> Self {
        Self {
            store: Some(store),
            state: DatabaseState::Open,
            batch_depth: 0,
            poisoned: false,
            observers: ObserverTable::default(),
        }
    }

    pub(crate) fn ensure_open(&self) -> CoreResult<()> {
        match self.state {
            DatabaseState::Open => Ok(()),
            DatabaseState::Closing | DatabaseState::Closed => Err(CoreError::DatabaseClosed),
        }
    }

    pub(crate) fn store_mut(&mut self) -> CoreResult<&mut (dyn RevisionStore + 'static)> {
        self.ensure_open()?;
        self.store.as_deref_mut().ok_or(CoreError::DatabaseClosed)
    }
}

impl DatabaseInner {
    /// Runs `op` while holding the database lock.
    pub(crate) fn locked<R>(&self, op: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        op()
    }

    /// Runs `op` on the locked state. `op` must not call back into the
    /// database.
    pub(crate) fn with_state<R>(&self, op: impl FnOnce(&mut LockedState) -> R) -> R {
        let guard = self.lock.lock();
        let mut state = guard.borrow_mut();
        op(&mut state)
    }

    /// Runs one store call under the lock and maps its error.
    pub(crate) fn with_store<R>(
        &self,
        op: impl FnOnce(&mut dyn RevisionStore) -> StorageResult<R>,
    ) -> CoreResult<R> {
        self.with_state(|state| {
            let store = state.store_mut()?;
            op(store).map_err(CoreError::from)
        })
    }

    pub(crate) fn close(&self) -> CoreResult<()> {
        self.logged(|| {
            let proceed = self.with_state(|s| match s.state {
                DatabaseState::Closed => false,
                DatabaseState::Open | DatabaseState::Closing => {
                    s.state = DatabaseState::Closing;
                    true
                }
            });
            if !proceed {
                return Ok(());
            }

            let active: Vec<Arc<dyn Stoppable>> =
                self.stoppables.lock().active.values().cloned().collect();
            if !active.is_empty() {
                info!(count = active.len(), "stopping active stoppables");
                for stoppable in &active {
                    stoppable.stop();
                }
            }
            drop(active);
            self.wait_for_stoppables();

            let result = self.with_state(|s| {
                if s.state == DatabaseState::Closed {
                    return Ok(());
                }
                s.observers.clear();
                let closed = match s.store.take() {
                    Some(mut store) => store.close().map_err(CoreError::from),
                    None => Ok(()),
                };
                s.state = DatabaseState::Closed;
                closed
            });
            self.queue.shutdown();
            info!("database closed");
            result
        })
    }

    fn wait_for_stoppables(&self) {
        let mut table = self.stoppables.lock();
        while !table.active.is_empty() {
            let waited = self
                .stoppables_drained
                .wait_for(&mut table, self.config.close_poll_interval);
            if waited.timed_out() && !table.active.is_empty() {
                warn!(
                    remaining = table.active.len(),
                    stoppables = ?table.names(),
                    "close is waiting for active stoppables"
                );
            }
        }
    }
}

impl Database {
    /// Registers a long-lived dependent that `close()` must wait for.
    ///
    /// Registering the same stoppable twice returns the existing token.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::DatabaseClosed`] once closing has started.
    pub fn register_stoppable(&self, stoppable: Arc<dyn Stoppable>) -> CoreResult<StoppableToken> {
        let inner = &self.inner;
        inner.locked(|| {
            inner.with_state(|s| s.ensure_open())?;
            let mut table = inner.stoppables.lock();
            if let Some((&id, _)) = table
                .active
                .iter()
                .find(|(_, existing)| same_stoppable(existing, &stoppable))
            {
                return Ok(StoppableToken(id));
            }
            table.next += 1;
            let id = table.next;
            inner.logged(|| debug!(name = %stoppable.name(), "stoppable registered"));
            table.active.insert(id, stoppable);
            Ok(StoppableToken(id))
        })
    }

    /// Removes a stoppable. Returns false if the token was not registered.
    ///
    /// Safe to call from any thread, including while `close()` is waiting.
    pub fn deregister_stoppable(&self, token: StoppableToken) -> bool {
        let mut table = self.inner.stoppables.lock();
        let removed = table.active.remove(&token.0).is_some();
        if table.active.is_empty() {
            self.inner.stoppables_drained.notify_all();
        }
        removed
    }

    /// Number of registered stoppables.
    #[must_use]
    pub fn active_stoppables(&self) -> usize {
        self.inner.stoppables.lock().active.len()
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> DatabaseState {
        self.inner.with_state(|s| s.state)
    }

    /// Closes the database.
    ///
    /// Blocks until every registered stoppable has deregistered; there is no
    /// timeout. Closing a closed database is a no-op.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be closed cleanly.
    pub fn close(&self) -> CoreResult<()> {
        self.inner.close()
    }
}
