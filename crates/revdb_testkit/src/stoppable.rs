//! Fake stoppables for close-drain tests.

use parking_lot::Mutex;
use revdb_core::{Database, Stoppable, StoppableToken};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A stoppable that records stop requests.
///
/// A cooperative fake deregisters itself as soon as it is asked to stop; a
/// stubborn one ignores the request until [`force_stop`](Self::force_stop).
pub struct FakeStoppable {
    name: String,
    cooperative: bool,
    stops: AtomicUsize,
    registration: Mutex<Option<(Database, StoppableToken)>>,
}

impl FakeStoppable {
    /// Registers a fake that stops when asked.
    pub fn cooperative(db: &Database, name: &str) -> Arc<Self> {
        Self::register(db, name, true)
    }

    /// Registers a fake that never stops on its own.
    pub fn stubborn(db: &Database, name: &str) -> Arc<Self> {
        Self::register(db, name, false)
    }

    fn register(db: &Database, name: &str, cooperative: bool) -> Arc<Self> {
        let fake = Arc::new(Self {
            name: name.to_string(),
            cooperative,
            stops: AtomicUsize::new(0),
            registration: Mutex::new(None),
        });
        let token = db
            .register_stoppable(fake.clone())
            .expect("Failed to register stoppable");
        *fake.registration.lock() = Some((db.clone(), token));
        fake
    }

    /// Number of stop requests received.
    pub fn stop_requests(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Whether the fake is still registered.
    pub fn is_registered(&self) -> bool {
        self.registration.lock().is_some()
    }

    /// Deregisters the fake, releasing a blocked `close()`.
    pub fn force_stop(&self) -> bool {
        let registration = self.registration.lock().take();
        match registration {
            Some((db, token)) => db.deregister_stoppable(token),
            None => false,
        }
    }
}

impl Stoppable for FakeStoppable {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.cooperative {
            self.force_stop();
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
