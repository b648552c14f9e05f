//! Dump command implementation.

use super::{open_existing, value_to_json, CliResult};
use serde::Serialize;
use std::ops::ControlFlow;
use std::path::Path;

/// One dumped row.
#[derive(Debug, Serialize)]
pub struct DumpedRow {
    /// Collection name.
    pub collection: String,
    /// Key within the collection.
    pub key: String,
    /// Decoded object.
    pub object: serde_json::Value,
    /// Decoded metadata, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Reads rows of the database at `path`, in collection then key order.
///
/// With `collection` set only that collection is read.
pub fn dump(path: &Path, collection: Option<&str>, limit: Option<usize>) -> CliResult<Vec<DumpedRow>> {
    let db = open_existing(path)?;
    let limit = limit.unwrap_or(usize::MAX);
    let conn = db.new_connection();

    let rows = conn.read(|txn| {
        let mut rows = Vec::new();
        let mut visit = |c: &str, key: &str, object: &yapdb_core::Value, metadata: Option<&yapdb_core::Value>| {
            if rows.len() >= limit {
                return ControlFlow::Break(());
            }
            rows.push(DumpedRow {
                collection: c.to_string(),
                key: key.to_string(),
                object: value_to_json(object),
                metadata: metadata.map(value_to_json),
            });
            ControlFlow::Continue(())
        };
        match collection {
            Some(name) => txn.enumerate_rows(name, None, |_, key, object, metadata| {
                Ok(visit(name, key, object, metadata))
            })?,
            None => txn.enumerate_rows_in_all_collections(None, |_, c, key, object, metadata| {
                Ok(visit(c, key, object, metadata))
            })?,
        }
        Ok(rows)
    })?;
    Ok(rows)
}

/// Runs the dump command.
pub fn run(path: &Path, collection: Option<&str>, limit: Option<usize>, format: &str) -> CliResult<()> {
    let rows = dump(path, collection, limit)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            for row in &rows {
                print!("{}/{}: {}", row.collection, row.key, row.object);
                if let Some(metadata) = &row.metadata {
                    print!("  [{metadata}]");
                }
                println!();
            }
            println!();
            println!("{} rows", rows.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use yapdb_core::{Database, DatabaseOptions, Value};

    fn populated() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), DatabaseOptions::default()).unwrap();
        db.new_connection()
            .read_write(|txn| {
                txn.set_object_with_metadata("a", "notes", Value::from("first"), Some(Value::from(1)))?;
                txn.set_object("b", "notes", Value::from("second"))?;
                txn.set_object("red", "tags", Value::from(true))
            })
            .unwrap();
        dir
    }

    #[test]
    fn dumps_every_row_in_order() {
        let dir = populated();
        let rows = dump(dir.path(), None, None).unwrap();
        let addresses: Vec<_> = rows
            .iter()
            .map(|r| format!("{}/{}", r.collection, r.key))
            .collect();
        assert_eq!(addresses, ["notes/a", "notes/b", "tags/red"]);
        assert_eq!(rows[0].object, serde_json::json!("first"));
        assert_eq!(rows[0].metadata, Some(serde_json::json!(1)));
        assert_eq!(rows[1].metadata, None);
    }

    #[test]
    fn filters_by_collection_and_limit() {
        let dir = populated();
        let rows = dump(dir.path(), Some("notes"), Some(1)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "a");
    }
}
