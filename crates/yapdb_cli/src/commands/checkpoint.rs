//! Checkpoint command implementation.

use super::{open_existing, CliResult};
use std::path::Path;
use yapdb_core::CheckpointReport;

/// Folds the WAL of the database at `path` into its main store.
///
/// No other connection is open, so everything committed is checkpointed.
pub fn checkpoint(path: &Path) -> CliResult<CheckpointReport> {
    let db = open_existing(path)?;
    let before = db.engine().wal_size()?;
    let report = db.checkpoint()?;
    tracing::info!(
        snapshot = report.snapshot.as_u64(),
        wal_before = before,
        wal_after = db.engine().wal_size()?,
        "checkpoint complete"
    );
    Ok(report)
}

/// Runs the checkpoint command.
pub fn run(path: &Path) -> CliResult<()> {
    let report = checkpoint(path)?;
    println!("Checkpointed through snapshot {}", report.snapshot.as_u64());
    println!("  WAL transactions kept: {}", report.wal_transactions_kept);
    println!("  versions pruned:       {}", report.versions_pruned);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use yapdb_core::{Database, DatabaseOptions, Value};

    #[test]
    fn folds_everything_committed() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(
                dir.path(),
                DatabaseOptions::default().auto_checkpoint_interval(0),
            )
            .unwrap();
            let conn = db.new_connection();
            for i in 0..3 {
                conn.read_write(|txn| txn.set_object("k", "c", Value::from(i)))
                    .unwrap();
            }
        }

        let report = checkpoint(dir.path()).unwrap();
        assert_eq!(report.snapshot.as_u64(), 3);
        assert_eq!(report.wal_transactions_kept, 0);

        let db = Database::open(dir.path(), DatabaseOptions::default()).unwrap();
        assert_eq!(db.manifest().checkpoint.as_u64(), 3);
        let value = db
            .new_connection()
            .read(|txn| txn.object("k", "c"))
            .unwrap();
        assert_eq!(value, Some(Value::from(2)));
    }
}
