//! Verify command implementation.

use super::{open_existing, CliResult};
use std::collections::HashMap;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of rows checked.
    pub rows_checked: usize,
    /// Rows whose object and metadata decoded cleanly.
    pub valid_rows: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Returns true when no problem was found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Opens the database and decodes every row.
///
/// Opening already replays the WAL over the main store and fails on any
/// checksum or framing error. The scan then checks that every object and
/// metadata value deserializes and that rowids are unique and allocated.
pub fn verify(path: &Path) -> CliResult<VerifyResult> {
    let db = open_existing(path)?;
    let next_rowid = db.engine().next_rowid();
    let conn = db.new_connection();

    let result = conn.read(|txn| {
        let mut result = VerifyResult::default();
        let mut owners: HashMap<u64, String> = HashMap::new();

        for collection in txn.all_collections() {
            for key in txn.all_keys_in_collection(&collection) {
                result.rows_checked += 1;
                let label = format!("{collection}/{key}");
                let mut clean = true;

                if let Err(e) = txn.object(&key, &collection) {
                    result.errors.push(format!("{label}: object: {e}"));
                    clean = false;
                }
                if let Err(e) = txn.metadata(&key, &collection) {
                    result.errors.push(format!("{label}: metadata: {e}"));
                    clean = false;
                }
                match txn.rowid_for_key(&key, &collection) {
                    Some(rowid) => {
                        if rowid.as_u64() >= next_rowid {
                            result.errors.push(format!(
                                "{label}: rowid {} not below next rowid {next_rowid}",
                                rowid.as_u64()
                            ));
                            clean = false;
                        }
                        if let Some(other) = owners.insert(rowid.as_u64(), label.clone()) {
                            result
                                .errors
                                .push(format!("{label}: rowid {} shared with {other}", rowid.as_u64()));
                            clean = false;
                        }
                    }
                    None => {
                        result.errors.push(format!("{label}: missing rowid"));
                        clean = false;
                    }
                }

                if clean {
                    result.valid_rows += 1;
                }
            }
        }
        Ok(result)
    })?;

    tracing::debug!(rows = result.rows_checked, "verified rows");
    Ok(result)
}

/// Runs the verify command.
pub fn run(path: &Path) -> CliResult<()> {
    println!("Verifying database at {}", path.display());
    println!();

    let result = match verify(path) {
        Ok(result) => result,
        Err(e) => {
            println!("✗ Database failed to open: {e}");
            return Err("Verification failed".into());
        }
    };

    println!("Rows checked: {}", result.rows_checked);
    println!("Valid rows:   {}", result.valid_rows);
    if !result.errors.is_empty() {
        println!();
        println!("Errors:");
        for error in result.errors.iter().take(20) {
            println!("  - {error}");
        }
        if result.errors.len() > 20 {
            println!("  ... and {} more", result.errors.len() - 20);
        }
    }

    println!();
    if result.is_ok() {
        println!("✓ Database verification passed");
        Ok(())
    } else {
        println!("✗ Database verification failed");
        Err("Verification failed".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yapdb_core::{Database, DatabaseOptions, Value};

    #[test]
    fn healthy_database_passes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path(), DatabaseOptions::default()).unwrap();
            db.new_connection()
                .read_write(|txn| {
                    for i in 0..10 {
                        txn.set_object_with_metadata(
                            &i.to_string(),
                            "numbers",
                            Value::from(i),
                            Some(Value::from("meta")),
                        )?;
                    }
                    Ok(())
                })
                .unwrap();
        }

        let result = verify(dir.path()).unwrap();
        assert_eq!(result.rows_checked, 10);
        assert_eq!(result.valid_rows, 10);
        assert!(result.is_ok());
    }

    #[test]
    fn corrupt_manifest_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path(), DatabaseOptions::default()).unwrap();
            db.new_connection()
                .read_write(|txn| txn.set_object("k", "c", Value::from(1)))
                .unwrap();
        }
        std::fs::write(dir.path().join("MANIFEST"), b"garbage").unwrap();
        assert!(verify(dir.path()).is_err());
    }
}
