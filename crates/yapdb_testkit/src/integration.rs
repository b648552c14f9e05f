//! Model-checked integration helpers.
//!
//! [`IntegrationHarness`] mirrors every committed transaction into a
//! [`Model`] and checks that every connection of the database agrees with it.

use crate::generators::{Model, Operation};
use yapdb_core::{Connection, CoreResult, Database, DatabaseOptions};

/// A test harness that tracks the expected database contents.
pub struct IntegrationHarness {
    /// The database instance.
    pub db: Database,
    writer: Connection,
    model: Model,
}

impl IntegrationHarness {
    /// Creates a new integration harness with an in-memory database.
    pub fn new() -> Self {
        Self::with_database(
            Database::open_in_memory(DatabaseOptions::default()).expect("Failed to open database"),
        )
    }

    /// Creates a harness over an existing, empty database.
    pub fn with_database(db: Database) -> Self {
        let writer = db.new_connection();
        Self {
            db,
            writer,
            model: Model::new(),
        }
    }

    /// Runs `ops` as one transaction. The model only advances if the
    /// transaction commits.
    ///
    /// # Errors
    ///
    /// Returns the transaction's error.
    pub fn commit(&mut self, ops: &[Operation]) -> CoreResult<()> {
        self.writer.read_write(|txn| {
            for op in ops {
                op.apply(txn)?;
            }
            Ok(())
        })?;
        self.model.apply_all(ops);
        Ok(())
    }

    /// Runs `ops` in a transaction that is rolled back.
    pub fn commit_and_roll_back(&mut self, ops: &[Operation]) {
        self.writer
            .read_write(|txn| {
                for op in ops {
                    op.apply(txn)?;
                }
                txn.rollback();
                Ok(())
            })
            .expect("Rolled back transaction reported an error");
    }

    /// The expected contents.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Checks that `conn` sees exactly the expected contents.
    pub fn verify(&self, conn: &Connection) {
        let actual = Model::load(conn).expect("Failed to read database");
        assert_eq!(actual, self.model, "connection {} diverged", conn.id());
    }

    /// Checks the writer connection.
    pub fn verify_writer(&self) {
        self.verify(&self.writer);
    }

    /// Returns the count of tracked rows.
    pub fn tracked_count(&self) -> usize {
        self.model.rows.len()
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}
