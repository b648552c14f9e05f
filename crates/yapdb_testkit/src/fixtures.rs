//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and common test scenarios.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use yapdb_core::{Database, DatabaseOptions, Value};

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    options: DatabaseOptions,
    temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self::memory_with(DatabaseOptions::default())
    }

    /// Creates an in-memory test database with `options`.
    pub fn memory_with(options: DatabaseOptions) -> Self {
        Self {
            db: Database::open_in_memory(options.clone())
                .expect("Failed to open in-memory database"),
            options,
            temp_dir: None,
        }
    }

    /// Creates a new file-based test database.
    pub fn file() -> Self {
        Self::file_with(DatabaseOptions::default())
    }

    /// Creates a file-based test database with `options`.
    pub fn file_with(options: DatabaseOptions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open(Self::db_path(&temp_dir), options.clone())
            .expect("Failed to open file database");
        Self {
            db,
            options,
            temp_dir: Some(temp_dir),
        }
    }

    fn db_path(temp_dir: &TempDir) -> PathBuf {
        temp_dir.path().join("test.yapdb")
    }

    /// Returns the database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(Self::db_path)
    }

    /// Closes and reopens a file-based database with the same options.
    ///
    /// # Panics
    ///
    /// Panics for in-memory databases, or if a clone of the handle is still
    /// alive and holds the directory lock.
    pub fn reopen(self) -> Self {
        let Self {
            db,
            options,
            temp_dir,
        } = self;
        let temp_dir = temp_dir.expect("Only file databases can be reopened");
        drop(db);
        let db = Database::open(Self::db_path(&temp_dir), options.clone())
            .expect("Failed to reopen file database");
        Self {
            db,
            options,
            temp_dir: Some(temp_dir),
        }
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust,ignore
/// use yapdb_testkit::with_temp_db;
///
/// #[test]
/// fn my_test() {
///     with_temp_db(|db| {
///         let conn = db.new_connection();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Runs a test with a temporary file-based database.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Path) -> R,
{
    let test_db = TestDatabase::file();
    let path = test_db.path().expect("File database should have a path");
    f(&test_db.db, &path)
}

/// Writes `count` rows into `collection` in one transaction. Keys are the
/// decimal indexes and objects are `{"index": i}` maps.
pub fn populate(db: &Database, collection: &str, count: usize) {
    db.new_connection()
        .read_write(|txn| {
            for i in 0..count {
                txn.set_object(&i.to_string(), collection, indexed_object(i))?;
            }
            Ok(())
        })
        .expect("Failed to populate collection");
}

/// The object [`populate`] stores under index `i`.
pub fn indexed_object(i: usize) -> Value {
    Value::Map(vec![(Value::from("index"), Value::from(i as u64))])
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a database with `row_count` rows in the `test` collection.
    pub fn populated_database(row_count: usize) -> TestDatabase {
        let test_db = TestDatabase::memory();
        populate(&test_db.db, "test", row_count);
        test_db
    }

    /// Creates a database with one row in each of `collection_count`
    /// collections named `collection_<i>`.
    pub fn multi_collection_database(collection_count: usize) -> (TestDatabase, Vec<String>) {
        let test_db = TestDatabase::memory();
        let collections: Vec<String> = (0..collection_count)
            .map(|i| format!("collection_{i}"))
            .collect();
        test_db
            .new_connection()
            .read_write(|txn| {
                for (i, name) in collections.iter().enumerate() {
                    txn.set_object("0", name, indexed_object(i))?;
                }
                Ok(())
            })
            .expect("Failed to populate collections");
        (test_db, collections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_database() {
        let test_db = TestDatabase::memory();
        assert!(test_db.path().is_none());
        assert_eq!(test_db.snapshot().as_u64(), 0);
    }

    #[test]
    fn test_file_database_reopens() {
        let test_db = TestDatabase::file();
        populate(&test_db, "notes", 3);
        let test_db = test_db.reopen();
        let count = test_db
            .new_connection()
            .read(|txn| Ok(txn.number_of_keys_in_collection("notes")))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_populated_scenario() {
        let test_db = scenarios::populated_database(10);
        let object = test_db
            .new_connection()
            .read(|txn| txn.object("7", "test"))
            .unwrap();
        assert_eq!(object, Some(indexed_object(7)));
    }

    #[test]
    fn test_multi_collection_scenario() {
        let (test_db, collections) = scenarios::multi_collection_database(4);
        let names = test_db
            .new_connection()
            .read(|txn| Ok(txn.all_collections()))
            .unwrap();
        assert_eq!(names, collections);
    }
}
