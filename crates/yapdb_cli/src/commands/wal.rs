//! WAL dump command implementation.

use super::CliResult;
use serde::Serialize;
use std::path::Path;
use yapdb_core::engine::{WalManager, WalRecord, WriteOp};
use yapdb_core::{DatabaseDir, DatabaseOptions};
use yapdb_storage::FileBackend;

/// A WAL record in dumpable form.
#[derive(Debug, Serialize)]
pub struct DumpedRecord {
    /// Byte offset in the WAL file.
    pub offset: u64,
    /// Record type.
    pub kind: &'static str,
    /// Transaction id, if the record belongs to a transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<u64>,
    /// Snapshot for commit and checkpoint records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<u64>,
    /// Table touched by an operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Collection touched by an operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Key touched by an operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl DumpedRecord {
    fn new(offset: u64, record: &WalRecord) -> Self {
        let mut out = Self {
            offset,
            kind: "",
            txid: None,
            snapshot: None,
            table: None,
            collection: None,
            key: None,
        };
        match record {
            WalRecord::Begin { txid } => {
                out.kind = "BEGIN";
                out.txid = Some(txid.as_u64());
            }
            WalRecord::Commit { txid, snapshot } => {
                out.kind = "COMMIT";
                out.txid = Some(txid.as_u64());
                out.snapshot = Some(snapshot.as_u64());
            }
            WalRecord::Checkpoint { snapshot } => {
                out.kind = "CHECKPOINT";
                out.snapshot = Some(snapshot.as_u64());
            }
            WalRecord::Op { txid, op } => {
                out.txid = Some(txid.as_u64());
                out.table = Some(op.table().to_string());
                match op {
                    WriteOp::Put { key, .. } => {
                        out.kind = "PUT";
                        out.collection = Some(key.collection.clone());
                        out.key = Some(key.key.clone());
                    }
                    WriteOp::Delete { key, .. } => {
                        out.kind = "DELETE";
                        out.collection = Some(key.collection.clone());
                        out.key = Some(key.key.clone());
                    }
                    WriteOp::ClearCollection { collection, .. } => {
                        out.kind = "CLEAR_COLLECTION";
                        out.collection = Some(collection.clone());
                    }
                    WriteOp::ClearTable { .. } => out.kind = "CLEAR_TABLE",
                    WriteOp::CreateTable { .. } => out.kind = "CREATE_TABLE",
                    WriteOp::DropTable { .. } => out.kind = "DROP_TABLE",
                }
            }
        }
        out
    }
}

/// Reads the WAL records of the database at `path`.
///
/// The directory lock is held while reading, so a live database is reported
/// as locked instead of being read mid-write.
pub fn read_records(path: &Path) -> CliResult<Vec<DumpedRecord>> {
    let dir = DatabaseDir::open(path, false)?;
    let wal_path = dir.wal_path();
    if !wal_path.exists() {
        return Ok(Vec::new());
    }
    let backend = FileBackend::open(&wal_path)?;
    let wal = WalManager::new(Box::new(backend), DatabaseOptions::default().page_size);
    Ok(wal
        .records()?
        .iter()
        .map(|(offset, record)| DumpedRecord::new(*offset, record))
        .collect())
}

/// Runs the WAL dump command.
pub fn run(path: &Path, limit: Option<usize>, offset: u64, format: &str) -> CliResult<()> {
    let records: Vec<_> = read_records(path)?
        .into_iter()
        .filter(|r| r.offset >= offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&records)?),
        _ => {
            for record in &records {
                let mut line = format!("{:>10}  {:<16}", record.offset, record.kind);
                if let Some(txid) = record.txid {
                    line.push_str(&format!(" txid={txid}"));
                }
                if let Some(snapshot) = record.snapshot {
                    line.push_str(&format!(" snapshot={snapshot}"));
                }
                if let Some(table) = &record.table {
                    line.push_str(&format!(" table={table}"));
                }
                match (&record.collection, &record.key) {
                    (Some(c), Some(k)) => line.push_str(&format!(" {c}/{k}")),
                    (Some(c), None) => line.push_str(&format!(" {c}")),
                    _ => {}
                }
                println!("{line}");
            }
            println!();
            println!("{} records", records.len());
        }
    }
    Ok(())
}
