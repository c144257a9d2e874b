//! Journal persistence, recovery and compaction.

use revdb_core::{CoreError, Database, DatabaseConfig, Document};
use revdb_storage::{RevisionEngine, JOURNAL_FILE};
use revdb_testkit::prelude::*;
use std::fs::OpenOptions;
use std::io::Write;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig::new()
        .directory(dir.path())
        .sync_on_commit(false)
}

#[test]
fn documents_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let (rev, history) = {
        let db = Database::open("notes", config(&dir)).unwrap();
        let mut doc = Document::from_json("a", r#"{"title": "first"}"#).unwrap();
        db.save(&mut doc).unwrap();
        doc.set("title", "second");
        db.save(&mut doc).unwrap();
        db.save(&mut Document::with_id("b")).unwrap();
        let history = db.revision_history("a").unwrap();
        db.close().unwrap();
        (doc.revision_id().cloned(), history)
    };

    let db = Database::open("notes", config(&dir)).unwrap();
    assert_eq!(db.count().unwrap(), 2);
    let doc = db.get_document("a").unwrap().unwrap();
    assert_eq!(doc.revision_id().cloned(), rev);
    assert_eq!(doc.to_json()["title"], "second");
    assert_eq!(db.revision_history("a").unwrap(), history);
}

#[test]
fn torn_tail_is_discarded_on_reopen() {
    let dir = TempDir::new().unwrap();
    let path = {
        let db = Database::open("torn", config(&dir)).unwrap();
        db.save(&mut Document::with_id("a")).unwrap();
        db.save(&mut Document::with_id("b")).unwrap();
        let path = db.path().unwrap().to_path_buf();
        db.close().unwrap();
        path
    };

    let mut journal = OpenOptions::new()
        .append(true)
        .open(path.join(JOURNAL_FILE))
        .unwrap();
    journal.write_all(&[0x52, 0x45, 0x56, 0x00, 0x13, 0x37]).unwrap();
    drop(journal);

    let db = Database::open("torn", config(&dir)).unwrap();
    assert_eq!(db.document_ids().unwrap(), vec!["a", "b"]);
    db.save(&mut Document::with_id("c")).unwrap();
    db.close().unwrap();

    let db = Database::open("torn", config(&dir)).unwrap();
    assert_eq!(db.count().unwrap(), 3);
}

#[test]
fn failed_batch_commit_leaves_nothing_behind() {
    let (db, switch) = crashable_database("crash");
    db.save(&mut Document::with_id("kept")).unwrap();

    switch.crash_after(16);
    let result = db.in_batch(|| {
        db.save(&mut Document::with_id("x"))?;
        db.save(&mut Document::with_id("y"))
    });
    assert!(matches!(result, Err(CoreError::Storage(_))));
    assert_eq!(db.document_ids().unwrap(), vec!["kept"]);

    let recovered = recover("crash", switch.image_at_crash().unwrap());
    assert_eq!(recovered.document_ids().unwrap(), vec!["kept"]);

    switch.reset();
    db.save(&mut Document::with_id("after")).unwrap();
    assert_eq!(db.count().unwrap(), 2);
}

#[test]
fn compaction_shrinks_the_journal_and_keeps_documents() {
    let test_db = TestDatabase::file();
    let mut doc = Document::with_id("busy");
    for i in 0..50 {
        doc.set("i", i);
        test_db.save(&mut doc).unwrap();
    }
    let path = test_db.path().unwrap();
    let engine = RevisionEngine::open(&path, false).unwrap();
    let before = engine.journal_size().unwrap();

    test_db.compact().unwrap();
    let after = engine.journal_size().unwrap();
    assert!(after < before, "journal grew from {before} to {after}");

    let current = test_db.get_document("busy").unwrap().unwrap();
    assert_eq!(current.generation(), 50);
    assert_eq!(current.revision_id(), doc.revision_id());
}

#[test]
fn long_edit_history_is_pruned_and_journal_grows_linearly() {
    let dir = TempDir::new().unwrap();
    let db = Database::open("long", config(&dir).max_rev_tree_depth(10)).unwrap();
    let journal = db.path().unwrap().join(JOURNAL_FILE);
    let size = || std::fs::metadata(&journal).unwrap().len();

    let mut doc = Document::with_id("busy");
    let mut sizes = Vec::new();
    for i in 1..=500 {
        doc.set("i", i);
        db.save(&mut doc).unwrap();
        if i % 100 == 0 {
            sizes.push(size());
        }
    }

    assert_eq!(doc.generation(), 500);
    let history = db.revision_history("busy").unwrap();
    assert_eq!(history.len(), 10);
    assert_eq!(history[0].generation(), 500);

    let early = sizes[1] - sizes[0];
    let late = sizes[4] - sizes[3];
    assert!(
        late * 4 < early * 5,
        "journal growth per 100 saves rose from {early} to {late} bytes"
    );

    db.close().unwrap();
    let db = Database::open("long", config(&dir)).unwrap();
    assert_eq!(db.revision_history("busy").unwrap(), history);
}

#[test]
fn handles_in_one_process_share_the_store() {
    let dir = TempDir::new().unwrap();
    let first = Database::open("shared", config(&dir)).unwrap();
    let second = Database::open("shared", config(&dir)).unwrap();

    let recorder = ChangeRecorder::new();
    recorder.listen(&second);
    first.save(&mut Document::with_id("a")).unwrap();

    assert!(second.get_document("a").unwrap().is_some());
    assert!(recorder.wait_for_ids(1, Duration::from_secs(5)));
    assert!(recorder.changes()[0].is_external);
}

#[test]
fn expiration_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let when = SystemTime::UNIX_EPOCH + Duration::from_millis(4_102_444_800_000);
    {
        let db = Database::open("ttl", config(&dir)).unwrap();
        db.save(&mut Document::with_id("a")).unwrap();
        db.set_document_expiration("a", Some(when)).unwrap();
        db.close().unwrap();
    }

    let db = Database::open("ttl", config(&dir)).unwrap();
    assert_eq!(db.get_document_expiration("a").unwrap(), Some(when));
    assert_eq!(db.purge_expired_documents().unwrap(), 0);
}
