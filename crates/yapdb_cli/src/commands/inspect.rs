//! Inspect command implementation.

use super::{open_existing, CliResult};
use serde::Serialize;
use std::path::Path;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Stable identifier from the manifest.
    pub database_id: String,
    /// Creation time, milliseconds since the epoch.
    pub created_at_ms: u64,
    /// Latest committed snapshot.
    pub snapshot: u64,
    /// Snapshot folded into the main store.
    pub checkpoint: u64,
    /// WAL file size in bytes.
    pub wal_size: u64,
    /// Main store size in bytes.
    pub store_size: u64,
    /// Row versions held in memory.
    pub row_versions: usize,
    /// Next rowid to be allocated.
    pub next_rowid: u64,
    /// Total number of rows.
    pub row_count: usize,
    /// Extensions registered in an earlier session.
    pub extensions: Vec<String>,
    /// Per-collection row counts (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<CollectionStats>>,
}

/// Statistics for a single collection.
#[derive(Debug, Serialize)]
pub struct CollectionStats {
    /// Collection name.
    pub name: String,
    /// Number of keys.
    pub key_count: usize,
}

/// Collects the inspection result for the database at `path`.
pub fn inspect(path: &Path, show_collections: bool) -> CliResult<InspectResult> {
    let db = open_existing(path)?;
    let manifest = db.manifest();
    let engine = db.engine();

    let conn = db.new_connection();
    let (row_count, collections) = conn.read(|txn| {
        let collections = txn
            .all_collections()
            .into_iter()
            .map(|name| CollectionStats {
                key_count: txn.number_of_keys_in_collection(&name),
                name,
            })
            .collect::<Vec<_>>();
        Ok((txn.number_of_keys_in_all_collections(), collections))
    })?;

    Ok(InspectResult {
        path: path.display().to_string(),
        database_id: manifest.database_id.to_string(),
        created_at_ms: manifest.created_at_ms,
        snapshot: db.snapshot().as_u64(),
        checkpoint: engine.checkpointed_snapshot().as_u64(),
        wal_size: engine.wal_size()?,
        store_size: engine.store_size()?,
        row_versions: engine.version_count(),
        next_rowid: engine.next_rowid(),
        row_count,
        extensions: db.previously_registered_extension_names(),
        collections: show_collections.then_some(collections),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, show_collections: bool, format: &str) -> CliResult<()> {
    let result = inspect(path, show_collections)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Database: {}", result.path);
    println!("  id:          {}", result.database_id);
    println!("  created:     {} ms", result.created_at_ms);
    println!();
    println!("Snapshots:");
    println!("  latest:      {}", result.snapshot);
    println!("  checkpoint:  {}", result.checkpoint);
    println!();
    println!("Storage:");
    println!("  WAL:         {}", format_size(result.wal_size));
    println!("  main store:  {}", format_size(result.store_size));
    println!("  total:       {}", format_size(result.wal_size + result.store_size));
    println!("  versions:    {}", result.row_versions);
    println!("  next rowid:  {}", result.next_rowid);
    println!();
    println!("Rows: {}", result.row_count);

    if let Some(collections) = &result.collections {
        println!();
        println!("Collections:");
        for collection in collections {
            println!("  {:<24} {} keys", collection.name, collection.key_count);
        }
    }

    println!();
    if result.extensions.is_empty() {
        println!("Extensions: none");
    } else {
        println!("Extensions: {}", result.extensions.join(", "));
    }
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yapdb_core::{Database, DatabaseOptions, Value};

    #[test]
    fn reports_rows_and_collections() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path(), DatabaseOptions::default()).unwrap();
            db.new_connection()
                .read_write(|txn| {
                    txn.set_object("1", "notes", Value::from("a"))?;
                    txn.set_object("2", "notes", Value::from("b"))?;
                    txn.set_object("x", "tags", Value::from(true))
                })
                .unwrap();
        }

        let result = inspect(dir.path(), true).unwrap();
        assert_eq!(result.snapshot, 1);
        assert_eq!(result.row_count, 3);
        let collections = result.collections.unwrap();
        assert_eq!(collections.len(), 2);
        assert_eq!(collections[0].name, "notes");
        assert_eq!(collections[0].key_count, 2);
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }
}
