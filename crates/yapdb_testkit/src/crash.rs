//! Crash recovery testing for yapdb.
//!
//! This module provides utilities for testing crash recovery behavior.
//! It simulates crashes at various points during commits and verifies
//! that the database recovers to a committed prefix.
//!
//! ## Test Strategy
//!
//! 1. **Crash after commit** - Committed rows survive a reopen
//! 2. **Torn WAL tail** - A transaction cut short is discarded, and the log
//!    stays appendable
//! 3. **Crash after checkpoint** - Main store plus WAL tail replay correctly
//! 4. **Crash during WAL write** - A failed append leaves no trace
//! 5. **Corrupt WAL** - Detected on open; `CorruptAction` decides the outcome
//!
//! ## Usage
//!
//! ```rust,ignore
//! use yapdb_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::with_temp_dir()?;
//! harness.run_all_tests();
//! assert!(harness.all_passed());
//! ```

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use yapdb_core::engine::{EngineFiles, EngineOptions, RowRead, StoredRow, MAIN_TABLE};
use yapdb_core::{
    CollectionKey, CoreError, CorruptAction, Database, DatabaseDir, DatabaseOptions, RowId,
    StorageEngine, Value,
};
use yapdb_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};

const COLLECTION: &str = "test";

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Expected rows after recovery.
    pub expected_rows: usize,
    /// Actual rows after recovery.
    pub actual_rows: usize,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, rows: usize) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_rows: rows,
            actual_rows: rows,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: usize, actual: usize, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_rows: expected,
            actual_rows: actual,
            error: Some(error.to_string()),
        }
    }

    fn check(description: &str, expected: usize, actual: usize) -> Self {
        if expected == actual {
            Self::pass(description, actual)
        } else {
            Self::fail(description, expected, actual, "row count mismatch after recovery")
        }
    }
}

/// Shared control of one or more [`CrashableBackend`]s.
#[derive(Debug, Clone, Default)]
pub struct CrashSwitch {
    inner: Arc<SwitchState>,
}

#[derive(Debug)]
struct SwitchState {
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    crashed: AtomicBool,
    fail_on_flush: AtomicBool,
}

impl Default for SwitchState {
    fn default() -> Self {
        Self {
            crash_after_bytes: AtomicUsize::new(usize::MAX),
            bytes_written: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            fail_on_flush: AtomicBool::new(false),
        }
    }
}

impl CrashSwitch {
    /// Creates a switch that never crashes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Crashes once `bytes` more bytes have been appended.
    pub fn crash_after(&self, bytes: usize) {
        let written = self.inner.bytes_written.load(Ordering::SeqCst);
        self.inner
            .crash_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Sets whether flush and sync should fail.
    pub fn set_fail_on_flush(&self, fail: bool) {
        self.inner.fail_on_flush.store(fail, Ordering::SeqCst);
    }

    /// Resets the crash state.
    pub fn reset(&self) {
        self.inner.crash_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.inner.crashed.store(false, Ordering::SeqCst);
        self.inner.fail_on_flush.store(false, Ordering::SeqCst);
    }

    /// Returns whether a crash was simulated.
    pub fn has_crashed(&self) -> bool {
        self.inner.crashed.load(Ordering::SeqCst)
    }

    fn crash(&self, what: &str) -> StorageError {
        self.inner.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("simulated crash during {what}"),
        ))
    }
}

/// A storage backend wrapper that can simulate crashes.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    switch: CrashSwitch,
}

impl CrashableBackend {
    /// Wraps `inner`, crashing as `switch` says.
    pub fn new(inner: Box<dyn StorageBackend>, switch: CrashSwitch) -> Self {
        Self { inner, switch }
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let state = &self.switch.inner;
        let current = state.bytes_written.fetch_add(bytes.len(), Ordering::SeqCst);
        let crash_threshold = state.crash_after_bytes.load(Ordering::SeqCst);

        if current >= crash_threshold {
            return Err(self.switch.crash("write"));
        }

        // Write partial data up to the crash point.
        if current + bytes.len() > crash_threshold {
            let partial_len = crash_threshold - current;
            if partial_len > 0 {
                let _ = self.inner.append(&bytes[..partial_len]);
            }
            return Err(self.switch.crash("partial write"));
        }

        self.inner.append(bytes)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.switch.inner.fail_on_flush.load(Ordering::SeqCst) {
            return Err(self.switch.crash("flush"));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.switch.inner.fail_on_flush.load(Ordering::SeqCst) {
            return Err(self.switch.crash("sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        self.inner.replace(data)
    }
}

/// Test harness for crash recovery scenarios.
pub struct CrashRecoveryHarness {
    root: TempDir,
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Creates a new harness with a temporary directory.
    pub fn with_temp_dir() -> std::io::Result<Self> {
        Ok(Self {
            root: TempDir::new()?,
            results: Vec::new(),
        })
    }

    /// Path of the database directory used by every scenario.
    pub fn db_path(&self) -> PathBuf {
        self.root.path().join("crash.yapdb")
    }

    fn options() -> DatabaseOptions {
        DatabaseOptions::default().auto_checkpoint_interval(0)
    }

    /// Opens a fresh database for testing.
    fn open_fresh_db(&self) -> Result<Database, CoreError> {
        let path = self.db_path();
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        Database::open(&path, Self::options())
    }

    /// Reopens the database for recovery testing.
    fn reopen_db(&self) -> Result<Database, CoreError> {
        Database::open(self.db_path(), Self::options())
    }

    fn wal_path(&self) -> Result<PathBuf, CoreError> {
        Ok(DatabaseDir::open(&self.db_path(), false)?.wal_path())
    }

    fn write_rows(db: &Database, range: std::ops::Range<usize>) -> Result<(), CoreError> {
        let conn = db.new_connection();
        for i in range {
            conn.read_write(|txn| txn.set_object(&i.to_string(), COLLECTION, Value::from(i as u64)))?;
        }
        Ok(())
    }

    fn count_rows(db: &Database) -> Result<usize, CoreError> {
        db.new_connection()
            .read(|txn| Ok(txn.number_of_keys_in_collection(COLLECTION)))
    }

    fn record(
        &mut self,
        description: &str,
        expected: usize,
        outcome: Result<CrashRecoveryResult, CoreError>,
    ) -> CrashRecoveryResult {
        let result = outcome.unwrap_or_else(|e| {
            CrashRecoveryResult::fail(description, expected, 0, &e.to_string())
        });
        self.results.push(result.clone());
        result
    }

    /// Tests that committed data survives a crash.
    pub fn test_committed_data_survives(&mut self) -> CrashRecoveryResult {
        const NAME: &str = "Committed data survives crash";
        let outcome = (|| -> Result<CrashRecoveryResult, CoreError> {
            let db = self.open_fresh_db()?;
            Self::write_rows(&db, 0..10)?;
            drop(db);

            let db = self.reopen_db()?;
            let mut intact = 0;
            let conn = db.new_connection();
            for i in 0..10usize {
                if conn.read(|txn| txn.object(&i.to_string(), COLLECTION))?
                    == Some(Value::from(i as u64))
                {
                    intact += 1;
                }
            }
            Ok(CrashRecoveryResult::check(NAME, 10, intact))
        })();
        self.record(NAME, 10, outcome)
    }

    /// Tests that a transaction cut short in the WAL is discarded and that
    /// later commits are still recovered.
    pub fn test_torn_wal_tail(&mut self) -> CrashRecoveryResult {
        const NAME: &str = "Torn WAL tail is discarded";
        let outcome = (|| -> Result<CrashRecoveryResult, CoreError> {
            let db = self.open_fresh_db()?;
            Self::write_rows(&db, 0..5)?;
            drop(db);

            let wal = self.wal_path()?;
            let file = OpenOptions::new().write(true).open(&wal)?;
            let len = file.metadata()?.len();
            file.set_len(len - 3)?;
            drop(file);

            let db = self.reopen_db()?;
            let recovered = Self::count_rows(&db)?;
            if recovered != 4 || db.snapshot().as_u64() != 4 {
                return Ok(CrashRecoveryResult::fail(
                    NAME,
                    4,
                    recovered,
                    "last transaction should be discarded",
                ));
            }
            Self::write_rows(&db, 10..11)?;
            drop(db);

            let db = self.reopen_db()?;
            Ok(CrashRecoveryResult::check(NAME, 5, Self::count_rows(&db)?))
        })();
        self.record(NAME, 5, outcome)
    }

    /// Tests recovery from the main store plus the WAL written after a
    /// checkpoint.
    pub fn test_crash_after_checkpoint(&mut self) -> CrashRecoveryResult {
        const NAME: &str = "Checkpoint plus WAL tail recovers";
        let outcome = (|| -> Result<CrashRecoveryResult, CoreError> {
            let db = self.open_fresh_db()?;
            Self::write_rows(&db, 0..6)?;
            db.checkpoint()?;
            Self::write_rows(&db, 6..9)?;
            db.new_connection()
                .read_write(|txn| txn.remove_object("0", COLLECTION))?;
            drop(db);

            let db = self.reopen_db()?;
            if db.manifest().checkpoint.as_u64() != 6 {
                return Ok(CrashRecoveryResult::fail(
                    NAME,
                    8,
                    0,
                    "manifest lost the checkpoint",
                ));
            }
            Ok(CrashRecoveryResult::check(NAME, 8, Self::count_rows(&db)?))
        })();
        self.record(NAME, 8, outcome)
    }

    /// Tests that a corrupt WAL is refused under `CorruptAction::Fail` and
    /// set aside under `CorruptAction::Rename`.
    pub fn test_corrupt_wal(&mut self) -> CrashRecoveryResult {
        const NAME: &str = "Corrupt WAL is detected";
        let outcome = (|| -> Result<CrashRecoveryResult, CoreError> {
            let db = self.open_fresh_db()?;
            Self::write_rows(&db, 0..3)?;
            drop(db);

            // Inside the payload of the first frame, so the checksum breaks.
            let wal = self.wal_path()?;
            let mut bytes = std::fs::read(&wal)?;
            bytes[12] ^= 0xFF;
            std::fs::write(&wal, bytes)?;

            match self.reopen_db() {
                Err(e) if e.is_corruption() => {}
                Err(e) => return Ok(CrashRecoveryResult::fail(NAME, 0, 0, &e.to_string())),
                Ok(_) => {
                    return Ok(CrashRecoveryResult::fail(
                        NAME,
                        0,
                        0,
                        "corrupt WAL opened without error",
                    ))
                }
            }

            let db = Database::open(
                self.db_path(),
                Self::options().corrupt_action(CorruptAction::Rename),
            )?;
            let rows = Self::count_rows(&db)?;
            drop(db);
            let set_aside = std::fs::read_dir(self.db_path())?
                .filter_map(Result::ok)
                .any(|entry| entry.file_name().to_string_lossy().starts_with("wal.log.corrupt"));
            if !set_aside {
                return Ok(CrashRecoveryResult::fail(
                    NAME,
                    0,
                    rows,
                    "corrupt WAL was not renamed",
                ));
            }
            Ok(CrashRecoveryResult::check(NAME, 0, rows))
        })();
        self.record(NAME, 0, outcome)
    }

    /// Runs all crash recovery tests.
    pub fn run_all_tests(&mut self) -> Vec<CrashRecoveryResult> {
        self.results.clear();

        self.test_committed_data_survives();
        self.test_torn_wal_tail();
        self.test_crash_after_checkpoint();
        self.test_corrupt_wal();
        let engine = engine_crash_during_wal_write();
        self.results.push(engine);

        self.results.clone()
    }

    /// Returns a summary of test results.
    pub fn summary(&self) -> String {
        let passed = self.results.iter().filter(|r| r.passed).count();
        let total = self.results.len();

        let mut summary = format!(
            "\n=== Crash Recovery Test Summary ===\n\
             Passed: {passed}/{total}\n\n"
        );

        for result in &self.results {
            let status = if result.passed { "✓" } else { "✗" };
            summary.push_str(&format!(
                "{} {}\n  Expected: {} rows, Actual: {} rows\n",
                status, result.description, result.expected_rows, result.actual_rows
            ));
            if let Some(ref error) = result.error {
                summary.push_str(&format!("  Error: {error}\n"));
            }
        }

        summary
    }

    /// Returns whether all tests passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Root of the temporary directory.
    pub fn root(&self) -> &Path {
        self.root.path()
    }
}

fn engine_row(i: u64) -> StoredRow {
    StoredRow {
        rowid: RowId::new(i + 1),
        data: i.to_le_bytes().to_vec(),
        metadata: None,
    }
}

fn engine_count(engine: &Arc<StorageEngine>) -> usize {
    let mut handle = engine.open_handle();
    let read = handle.begin_read();
    (0..16u64)
        .filter(|i| {
            read.get(MAIN_TABLE, &CollectionKey::new(COLLECTION, i.to_string()))
                .is_some()
        })
        .count()
}

/// Crashes the WAL in the middle of the third commit of a storage engine,
/// then recovers a second engine from the same bytes.
pub fn engine_crash_during_wal_write() -> CrashRecoveryResult {
    const NAME: &str = "Crash during WAL write leaves no trace";
    let outcome = (|| -> Result<CrashRecoveryResult, CoreError> {
        let wal_bytes = InMemoryBackend::new();
        let store_bytes = InMemoryBackend::new();
        let switch = CrashSwitch::new();
        let files = EngineFiles {
            wal: Box::new(CrashableBackend::new(Box::new(wal_bytes.clone()), switch.clone())),
            store: Box::new(store_bytes.clone()),
        };
        let engine = StorageEngine::open(files, EngineOptions::default())?;
        let mut handle = engine.open_handle();

        for i in 0..2u64 {
            let mut txn = handle.begin_write();
            txn.put(MAIN_TABLE, CollectionKey::new(COLLECTION, i.to_string()), engine_row(i));
            txn.commit()?;
        }

        switch.crash_after(7);
        let mut txn = handle.begin_write();
        txn.put(MAIN_TABLE, CollectionKey::new(COLLECTION, "2"), engine_row(2));
        if txn.commit().is_ok() || !switch.has_crashed() {
            return Ok(CrashRecoveryResult::fail(NAME, 2, 3, "commit survived the crash"));
        }
        switch.reset();

        let mut txn = handle.begin_write();
        txn.put(MAIN_TABLE, CollectionKey::new(COLLECTION, "3"), engine_row(3));
        txn.commit()?;
        drop(handle);

        let recovered = StorageEngine::open(
            EngineFiles {
                wal: Box::new(wal_bytes),
                store: Box::new(store_bytes),
            },
            EngineOptions::default(),
        )?;
        if recovered.latest_snapshot().as_u64() != 3 {
            return Ok(CrashRecoveryResult::fail(
                NAME,
                3,
                engine_count(&recovered),
                "unexpected snapshot after recovery",
            ));
        }
        Ok(CrashRecoveryResult::check(NAME, 3, engine_count(&recovered)))
    })();
    outcome.unwrap_or_else(|e| CrashRecoveryResult::fail(NAME, 3, 0, &e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crashable_backend_normal_operation() {
        let mut backend = CrashableBackend::new(Box::new(InMemoryBackend::new()), CrashSwitch::new());

        let data = b"test data";
        let offset = backend.append(data).unwrap();
        backend.flush().unwrap();

        let read = backend.read_at(offset, data.len()).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn test_crashable_backend_crash_on_write() {
        let inner = InMemoryBackend::new();
        let switch = CrashSwitch::new();
        let mut backend = CrashableBackend::new(Box::new(inner.clone()), switch.clone());

        switch.crash_after(10);
        backend.append(&[1u8; 5]).unwrap();

        // Crosses the threshold: five bytes land, then the error.
        assert!(backend.append(&[2u8; 10]).is_err());
        assert!(switch.has_crashed());
        assert_eq!(inner.size().unwrap(), 10);
    }

    #[test]
    fn test_crashable_backend_crash_on_flush() {
        let switch = CrashSwitch::new();
        let mut backend = CrashableBackend::new(Box::new(InMemoryBackend::new()), switch.clone());

        switch.set_fail_on_flush(true);
        assert!(backend.flush().is_err());
        assert!(switch.has_crashed());
    }

    #[test]
    fn test_engine_crash_during_wal_write() {
        let result = engine_crash_during_wal_write();
        assert!(result.passed, "{result:?}");
    }

    #[test]
    fn test_all_crash_recovery_scenarios() {
        let mut harness = CrashRecoveryHarness::with_temp_dir().unwrap();

        harness.run_all_tests();
        println!("{}", harness.summary());

        assert!(harness.all_passed(), "{}", harness.summary());
    }
}
