//! Open, close and per-database logging.

use parking_lot::Mutex;
use revdb_core::{CoreError, Database, DatabaseConfig, DatabaseState, Document, Stoppable};
use revdb_testkit::prelude::*;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Dispatch, Level};

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capturing_dispatch() -> (Dispatch, SharedBuffer) {
    let buffer = SharedBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (Dispatch::new(subscriber), buffer)
}

#[test]
fn each_database_logs_to_its_own_sink() {
    let (first_sink, first_log) = capturing_dispatch();
    let (second_sink, second_log) = capturing_dispatch();
    let first = TestDatabase::memory_with_config(DatabaseConfig::new().log_dispatch(first_sink));
    let second = TestDatabase::memory_with_config(DatabaseConfig::new().log_dispatch(second_sink));

    first.save(&mut Document::with_id("only-first")).unwrap();
    second.save(&mut Document::with_id("only-second")).unwrap();

    let first_log = first_log.contents();
    let second_log = second_log.contents();
    assert!(first_log.contains("database opened"));
    assert!(first_log.contains("revdb{db=test}"));
    assert!(first_log.contains("only-first"));
    assert!(!first_log.contains("only-second"));
    assert!(second_log.contains("only-second"));
    assert!(!second_log.contains("only-first"));
}

#[test]
fn close_stops_cooperative_stoppables() {
    let test_db = TestDatabase::memory();
    let fakes: Vec<_> = (0..3)
        .map(|i| FakeStoppable::cooperative(&test_db, &format!("query{i}")))
        .collect();
    assert_eq!(test_db.active_stoppables(), 3);

    let started = Instant::now();
    test_db.close().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(fakes.iter().all(|f| f.stop_requests() == 1 && !f.is_registered()));
    assert_eq!(test_db.state(), DatabaseState::Closed);
}

#[test]
fn operations_fail_after_close() {
    let test_db = TestDatabase::memory();
    test_db.close().unwrap();
    test_db.close().unwrap();

    let err = test_db.save(&mut Document::with_id("a")).unwrap_err();
    assert!(matches!(err, CoreError::DatabaseClosed));
    assert!(test_db.get_document("a").is_err());
    assert!(matches!(
        test_db.register_stoppable(Arc::new(Idle)),
        Err(CoreError::DatabaseClosed)
    ));
}

struct Idle;

impl Stoppable for Idle {
    fn stop(&self) {}

    fn name(&self) -> String {
        "idle".into()
    }
}

#[test]
fn file_database_exists_after_open() {
    let test_db = TestDatabase::file();
    let directory = test_db.directory().unwrap();
    assert!(Database::exists("test", directory));
    assert!(!Database::exists("other", directory));
}
