//! Batches: atomic groups of store mutations.
//!
//! Batches nest by depth over one store transaction. The outermost batch
//! commits; a failure at any depth poisons the transaction so the outermost
//! end rolls back. A batch abandoned by a panic is rolled back as well.

use crate::database::{Database, DatabaseInner};
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::LockedState;
use tracing::{debug, warn};

impl LockedState {
    fn begin_batch(&mut self) -> CoreResult<()> {
        self.ensure_open()?;
        if self.batch_depth == 0 {
            self.store_mut()?.begin_transaction()?;
            self.poisoned = false;
        }
        self.batch_depth += 1;
        Ok(())
    }

    fn end_batch(&mut self, failed: bool) -> CoreResult<()> {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if failed {
            self.poisoned = true;
        }
        if self.batch_depth > 0 {
            return Ok(());
        }

        let poisoned = std::mem::take(&mut self.poisoned);
        let store = self.store.as_deref_mut().ok_or(CoreError::DatabaseClosed)?;
        if poisoned {
            store.end_transaction(false)?;
            debug!("batch rolled back");
            if failed {
                Ok(())
            } else {
                Err(CoreError::transaction_aborted(
                    "a nested batch failed; the transaction was rolled back",
                ))
            }
        } else {
            store.end_transaction(true)?;
            Ok(())
        }
    }

    fn abandon_batch(&mut self) {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth > 0 {
            self.poisoned = true;
            return;
        }
        self.poisoned = false;
        if let Some(store) = self.store.as_deref_mut() {
            if let Err(err) = store.end_transaction(false) {
                warn!(error = %err, "rollback of abandoned batch failed");
            }
        }
    }
}

/// Rolls the batch back if it is dropped before `finish`.
struct BatchScope<'a> {
    inner: &'a DatabaseInner,
    finished: bool,
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("batch abandoned by a panic, rolling back");
        let guard = self.inner.lock.lock();
        if let Ok(mut state) = guard.try_borrow_mut() {
            state.abandon_batch();
        };
    }
}

impl DatabaseInner {
    pub(crate) fn in_batch<T>(&self, work: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        let _guard = self.lock.lock();
        self.with_state(LockedState::begin_batch)?;

        let mut scope = BatchScope {
            inner: self,
            finished: false,
        };
        let result = work();
        scope.finished = true;

        let ended = self.with_state(|s| s.end_batch(result.is_err()));
        match (result, ended) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(end)) => {
                warn!(error = %end, "rollback after failed batch also failed");
                Err(err)
            }
        }
    }
}

impl Database {
    /// Runs `work` as one atomic batch.
    ///
    /// Every save, delete and purge made inside `work` commits together when
    /// it returns `Ok`; an `Err` (or a panic) rolls all of them back. Change
    /// notifications go out only after the commit. Batches may nest.
    ///
    /// # Errors
    ///
    /// Returns the error of `work`, [`CoreError::TransactionAborted`] if a
    /// nested batch failed, or the commit failure.
    pub fn in_batch<T>(&self, work: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        self.logged(|| self.inner.in_batch(work))
    }
}
