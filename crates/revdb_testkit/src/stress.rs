//! Stress tests for revdb.
//!
//! These helpers drive a database from several threads to exercise the save
//! engine's conflict paths under contention.

use revdb_core::{ConcurrencyControl, Database, Document, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Operations that were rejected or failed.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Rejected or failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of distinct documents.
    pub doc_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
            doc_count: 8,
        }
    }
}

/// Saves `operations` documents sequentially.
pub fn stress_sequential_saves(db: &Database, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let mut doc = Document::with_id(format!("doc{}", i % config.doc_count.max(1)));
        if let Ok(Some(current)) = db.get_document(doc.id()) {
            doc = current;
        }
        doc.set("i", i as i64);
        match db.save(&mut doc) {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Read-modify-write from several threads with the given concurrency mode.
///
/// Under `FailOnConflict` a lost race counts as a failed operation.
pub fn stress_concurrent_updates(
    db: &Database,
    config: &StressConfig,
    concurrency: ConcurrencyControl,
) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let db = db.clone();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let config = config.clone();

            thread::spawn(move || {
                for i in 0..config.operations {
                    let id = format!("doc{}", (t + i) % config.doc_count.max(1));
                    let mut doc = match db.get_document(&id) {
                        Ok(Some(doc)) => doc,
                        _ => Document::with_id(id),
                    };
                    doc.set("writer", t as i64);
                    match db.save_with_concurrency(&mut doc, concurrency) {
                        Ok(true) => successful.fetch_add(1, Ordering::Relaxed),
                        _ => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Writer thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Increments `counter` on one document from several threads, merging
/// conflicts with a handler. Returns the final counter value.
pub fn stress_handler_increments(db: &Database, doc_id: &str, config: &StressConfig) -> i64 {
    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let db = db.clone();
            let doc_id = doc_id.to_string();
            let operations = config.operations;

            thread::spawn(move || {
                for _ in 0..operations {
                    let mut doc = db
                        .get_document(&doc_id)
                        .expect("Failed to read")
                        .unwrap_or_else(|| Document::with_id(doc_id.as_str()));
                    doc.set("counter", counter(&doc) + 1);
                    let saved = db
                        .save_with_handler(&mut doc, |mine, current| {
                            let base = current.map_or(0, counter);
                            mine.set("counter", base + 1);
                            true
                        })
                        .expect("Save failed");
                    assert!(saved);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Writer thread panicked");
    }

    db.get_document(doc_id)
        .expect("Failed to read")
        .map_or(0, |doc| counter(&doc))
}

fn counter(doc: &Document) -> i64 {
    match doc.get("counter") {
        Some(Value::Integer(n)) => *n,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_saves_all_succeed() {
        let db = Database::open_in_memory("stress").unwrap();
        let config = StressConfig {
            operations: 50,
            threads: 1,
            doc_count: 5,
        };
        let result = stress_sequential_saves(&db, &config);
        assert_eq!(result.successful_ops, 50);
        assert_eq!(db.count().unwrap(), 5);
    }

    #[test]
    fn last_write_wins_never_rejects() {
        let db = Database::open_in_memory("stress").unwrap();
        let config = StressConfig {
            operations: 50,
            threads: 4,
            doc_count: 2,
        };
        let result = stress_concurrent_updates(&db, &config, ConcurrencyControl::LastWriteWins);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 200);
    }
}
