//! Stress tests for yapdb.
//!
//! These tests verify behavior under heavy load and concurrent access.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use yapdb_core::{Connection, ConnectionProxy, CoreError, CoreResult, Database, Value};

const COLLECTION: &str = "stress";

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
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
        println!("\n=== {name} ===");
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Size of stored byte strings.
    pub value_size: usize,
    /// Number of distinct keys.
    pub key_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            value_size: 256,
            key_count: 1_000,
        }
    }
}

impl StressConfig {
    fn payload(&self) -> Value {
        Value::Bytes(vec![0xAB; self.value_size])
    }

    fn key(&self, i: usize) -> String {
        (i % self.key_count.max(1)).to_string()
    }
}

fn populate(db: &Database, config: &StressConfig) {
    let payload = config.payload();
    let _ = db.new_connection().read_write(|txn| {
        for i in 0..config.key_count {
            txn.set_object(&config.key(i), COLLECTION, payload.clone())?;
        }
        Ok(())
    });
}

/// Run a sequential write stress test. One transaction per operation.
pub fn stress_sequential_writes(db: &Database, config: &StressConfig) -> StressTestResult {
    let conn = db.new_connection();
    let payload = config.payload();

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        match conn.read_write(|txn| txn.set_object(&config.key(i), COLLECTION, payload.clone())) {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a sequential read stress test. Reads mostly hit the object cache.
pub fn stress_sequential_reads(db: &Database, config: &StressConfig) -> StressTestResult {
    populate(db, config);
    let conn = db.new_connection();

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        match conn.read(|txn| txn.object(&config.key(i), COLLECTION)) {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a mixed read/write/remove stress test on two connections, so that
/// every read catches up with the other connection's commits.
pub fn stress_mixed_operations(db: &Database, config: &StressConfig) -> StressTestResult {
    let writer = db.new_connection();
    let reader = db.new_connection();
    let payload = config.payload();

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let key = config.key(i);
        let result = match i % 3 {
            0 => writer.read_write(|txn| txn.set_object(&key, COLLECTION, payload.clone())),
            1 => reader.read(|txn| txn.object(&key, COLLECTION)).map(|_| ()),
            _ => writer.read_write(|txn| txn.remove_object(&key, COLLECTION)),
        };

        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

fn stamp_generation(conn: &Connection, keys: usize, generation: u64) -> CoreResult<()> {
    conn.read_write(|txn| {
        for k in 0..keys {
            txn.set_object(&k.to_string(), COLLECTION, Value::from(generation))?;
        }
        Ok(())
    })
}

/// Run concurrent readers against one writer.
///
/// Every write transaction stamps all keys with the same generation, so a
/// read that sees two different generations has observed a partial commit.
/// Such reads, and reads whose snapshot went backwards, count as failures.
pub fn stress_concurrent_readers(db: &Database, config: &StressConfig) -> StressTestResult {
    let keys = config.key_count.clamp(1, 32);
    stamp_generation(&db.new_connection(), keys, 0).expect("Failed to seed generation 0");

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let readers = config.threads.max(1);
    let ops_per_thread = config.operations / readers;

    let start = Instant::now();

    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let db = db.clone();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            thread::spawn(move || {
                let conn = db.new_connection();
                let mut last = conn.snapshot();
                for _ in 0..ops_per_thread {
                    let outcome = conn.read(|txn| {
                        let mut values = Vec::with_capacity(keys);
                        for k in 0..keys {
                            values.push(txn.object(&k.to_string(), COLLECTION)?);
                        }
                        let consistent = values.windows(2).all(|pair| pair[0] == pair[1]);
                        Ok((txn.snapshot(), consistent))
                    });
                    match outcome {
                        Ok((snapshot, consistent)) if consistent && snapshot >= last => {
                            last = snapshot;
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    let writer = {
        let db = db.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let conn = db.new_connection();
            let mut generation = 1;
            while !done.load(Ordering::Relaxed) {
                if stamp_generation(&conn, keys, generation).is_err() {
                    break;
                }
                generation += 1;
            }
        })
    };

    for handle in handles {
        handle.join().expect("Reader thread panicked");
    }
    done.store(true, Ordering::Relaxed);
    writer.join().expect("Writer thread panicked");

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run a transaction abort stress test. Every other transaction fails on
/// purpose after writing.
pub fn stress_transaction_aborts(db: &Database, config: &StressConfig) -> StressTestResult {
    let conn = db.new_connection();
    let payload = config.payload();

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let should_fail = i % 2 == 0;
        let result = conn.read_write(|txn| {
            txn.set_object(&config.key(i), COLLECTION, payload.clone())?;
            if should_fail {
                Err(CoreError::invalid_operation("intentional"))
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a large transaction stress test, 100 rows per transaction.
pub fn stress_large_transactions(db: &Database, config: &StressConfig) -> StressTestResult {
    let conn = db.new_connection();
    let payload = config.payload();
    let batch_size = 100;

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for batch in 0..(config.operations / batch_size) {
        let result = conn.read_write(|txn| {
            for i in 0..batch_size {
                txn.set_object(&config.key(batch * batch_size + i), COLLECTION, payload.clone())?;
            }
            Ok(())
        });

        match result {
            Ok(()) => successful += batch_size,
            Err(_) => failed += batch_size,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run buffered writes through a [`ConnectionProxy`], then flush.
pub fn stress_proxy_writes(db: &Database, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let Ok(proxy) = ConnectionProxy::new(db) else {
        return StressTestResult::new(0, config.operations, start.elapsed());
    };
    let payload = config.payload();

    for i in 0..config.operations {
        proxy.set_object(&config.key(i), COLLECTION, payload.clone());
    }
    let (successful, failed) = match proxy.flush() {
        Ok(()) => (config.operations, 0),
        Err(_) => (0, config.operations),
    };

    StressTestResult::new(successful, failed, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use yapdb_core::DatabaseOptions;

    fn create_test_db() -> Database {
        Database::open_in_memory(DatabaseOptions::default()).expect("Failed to create database")
    }

    #[test]
    fn test_sequential_writes() {
        let db = create_test_db();
        let config = StressConfig {
            operations: 1_000,
            value_size: 64,
            ..Default::default()
        };

        let result = stress_sequential_writes(&db, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 1_000);
        assert_eq!(db.snapshot().as_u64(), 1_000);
    }

    #[test]
    fn test_sequential_reads() {
        let db = create_test_db();
        let config = StressConfig {
            operations: 1_000,
            key_count: 100,
            value_size: 64,
            ..Default::default()
        };

        let result = stress_sequential_reads(&db, &config);
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_mixed_operations() {
        let db = create_test_db();
        let config = StressConfig {
            operations: 1_000,
            key_count: 100,
            value_size: 64,
            ..Default::default()
        };

        let result = stress_mixed_operations(&db, &config);
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_concurrent_readers() {
        let db = create_test_db();
        let config = StressConfig {
            operations: 400,
            threads: 4,
            key_count: 16,
            value_size: 0,
        };

        let result = stress_concurrent_readers(&db, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, 400);
    }

    #[test]
    fn test_transaction_aborts() {
        let db = create_test_db();
        let config = StressConfig {
            operations: 100,
            value_size: 64,
            ..Default::default()
        };

        let result = stress_transaction_aborts(&db, &config);
        // Half should succeed, half should fail (intentionally)
        assert_eq!(result.successful_ops, 50);
        assert_eq!(result.failed_ops, 50);
        assert_eq!(db.snapshot().as_u64(), 50);
    }

    #[test]
    fn test_large_transactions() {
        let db = create_test_db();
        let config = StressConfig {
            operations: 1_000,
            value_size: 64,
            ..Default::default()
        };

        let result = stress_large_transactions(&db, &config);
        assert_eq!(result.failed_ops, 0);
    }

    #[test]
    fn test_proxy_writes() {
        let db = create_test_db();
        let config = StressConfig {
            operations: 500,
            key_count: 50,
            value_size: 16,
            ..Default::default()
        };

        let result = stress_proxy_writes(&db, &config);
        assert_eq!(result.failed_ops, 0);
        let rows = db
            .new_connection()
            .read(|txn| Ok(txn.number_of_keys_in_collection(COLLECTION)))
            .unwrap();
        assert_eq!(rows, 50);
    }
}
