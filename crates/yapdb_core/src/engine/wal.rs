//! Write-ahead log.
//!
//! A read-write transaction is logged as `Begin`, one record per operation,
//! then `Commit` carrying the snapshot it produced. Recovery replays only
//! transactions whose `Commit` made it to disk.

use super::codec::{ByteReader, ByteWriter, Frame, FrameFormat};
use super::versions::StoredRow;
use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionKey, RowId, Snapshot, TransactionId};
use std::sync::Arc;
use yapdb_storage::StorageBackend;

/// WAL framing.
pub(crate) const WAL_FORMAT: FrameFormat = FrameFormat {
    magic: *b"YWAL",
    version: 1,
    corruption: CoreError::wal_corruption,
};

const KIND_BEGIN: u8 = 1;
const KIND_PUT: u8 = 2;
const KIND_DELETE: u8 = 3;
const KIND_CLEAR_COLLECTION: u8 = 4;
const KIND_CLEAR_TABLE: u8 = 5;
const KIND_CREATE_TABLE: u8 = 6;
const KIND_DROP_TABLE: u8 = 7;
const KIND_COMMIT: u8 = 8;
const KIND_CHECKPOINT: u8 = 9;

/// One mutation of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite a row.
    Put {
        /// Table name.
        table: String,
        /// Row address.
        key: CollectionKey,
        /// Full row image.
        row: Arc<StoredRow>,
    },
    /// Remove a row.
    Delete {
        /// Table name.
        table: String,
        /// Row address.
        key: CollectionKey,
    },
    /// Remove every row of one collection.
    ClearCollection {
        /// Table name.
        table: String,
        /// Collection name.
        collection: String,
    },
    /// Remove every row of a table.
    ClearTable {
        /// Table name.
        table: String,
    },
    /// Create an empty table if it does not exist.
    CreateTable {
        /// Table name.
        table: String,
    },
    /// Remove a table and all its rows.
    DropTable {
        /// Table name.
        table: String,
    },
}

impl WriteOp {
    /// Name of the table the operation touches.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Put { table, .. }
            | Self::Delete { table, .. }
            | Self::ClearCollection { table, .. }
            | Self::ClearTable { table }
            | Self::CreateTable { table }
            | Self::DropTable { table } => table,
        }
    }
}

/// A decoded WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Start of a transaction.
    Begin {
        /// Transaction id.
        txid: TransactionId,
    },
    /// One operation of a transaction.
    Op {
        /// Transaction id.
        txid: TransactionId,
        /// The operation.
        op: WriteOp,
    },
    /// End of a transaction.
    Commit {
        /// Transaction id.
        txid: TransactionId,
        /// Snapshot produced by the commit.
        snapshot: Snapshot,
    },
    /// Everything up to `snapshot` lives in the main store.
    Checkpoint {
        /// Checkpointed snapshot.
        snapshot: Snapshot,
    },
}

impl WalRecord {
    fn kind(&self) -> u8 {
        match self {
            Self::Begin { .. } => KIND_BEGIN,
            Self::Op { op, .. } => match op {
                WriteOp::Put { .. } => KIND_PUT,
                WriteOp::Delete { .. } => KIND_DELETE,
                WriteOp::ClearCollection { .. } => KIND_CLEAR_COLLECTION,
                WriteOp::ClearTable { .. } => KIND_CLEAR_TABLE,
                WriteOp::CreateTable { .. } => KIND_CREATE_TABLE,
                WriteOp::DropTable { .. } => KIND_DROP_TABLE,
            },
            Self::Commit { .. } => KIND_COMMIT,
            Self::Checkpoint { .. } => KIND_CHECKPOINT,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        match self {
            Self::Begin { txid } => {
                w.u64(txid.as_u64());
            }
            Self::Op { txid, op } => {
                w.u64(txid.as_u64()).str(op.table());
                match op {
                    WriteOp::Put { key, row, .. } => {
                        w.str(&key.collection)
                            .str(&key.key)
                            .u64(row.rowid.as_u64())
                            .bytes(&row.data)
                            .opt_bytes(row.metadata.as_deref());
                    }
                    WriteOp::Delete { key, .. } => {
                        w.str(&key.collection).str(&key.key);
                    }
                    WriteOp::ClearCollection { collection, .. } => {
                        w.str(collection);
                    }
                    WriteOp::ClearTable { .. }
                    | WriteOp::CreateTable { .. }
                    | WriteOp::DropTable { .. } => {}
                }
            }
            Self::Commit { txid, snapshot } => {
                w.u64(txid.as_u64()).u64(snapshot.as_u64());
            }
            Self::Checkpoint { snapshot } => {
                w.u64(snapshot.as_u64());
            }
        }
        w.finish()
    }

    fn decode(frame: &Frame) -> CoreResult<Self> {
        let mut r = ByteReader::new(&frame.payload, CoreError::wal_corruption);
        let record = match frame.kind {
            KIND_BEGIN => Self::Begin {
                txid: TransactionId::new(r.u64()?),
            },
            KIND_COMMIT => Self::Commit {
                txid: TransactionId::new(r.u64()?),
                snapshot: Snapshot::new(r.u64()?),
            },
            KIND_CHECKPOINT => Self::Checkpoint {
                snapshot: Snapshot::new(r.u64()?),
            },
            kind @ KIND_PUT..=KIND_DROP_TABLE => {
                let txid = TransactionId::new(r.u64()?);
                let table = r.str()?;
                let op = match kind {
                    KIND_PUT => {
                        let key = CollectionKey::new(r.str()?, r.str()?);
                        let row = StoredRow {
                            rowid: RowId::new(r.u64()?),
                            data: r.bytes()?,
                            metadata: r.opt_bytes()?,
                        };
                        WriteOp::Put {
                            table,
                            key,
                            row: Arc::new(row),
                        }
                    }
                    KIND_DELETE => WriteOp::Delete {
                        table,
                        key: CollectionKey::new(r.str()?, r.str()?),
                    },
                    KIND_CLEAR_COLLECTION => WriteOp::ClearCollection {
                        table,
                        collection: r.str()?,
                    },
                    KIND_CLEAR_TABLE => WriteOp::ClearTable { table },
                    KIND_CREATE_TABLE => WriteOp::CreateTable { table },
                    _ => WriteOp::DropTable { table },
                };
                Self::Op { txid, op }
            }
            other => {
                return Err(CoreError::wal_corruption(format!(
                    "unknown record kind {other} at offset {}",
                    frame.offset
                )))
            }
        };
        r.finish()?;
        Ok(record)
    }
}

/// A committed transaction recovered from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBatch {
    /// Snapshot the transaction produced.
    pub snapshot: Snapshot,
    /// Operations in log order.
    pub ops: Vec<WriteOp>,
}

/// Appends to and replays the write-ahead log.
pub struct WalManager {
    backend: Box<dyn StorageBackend>,
    page_size: usize,
}

impl WalManager {
    /// Creates a WAL over `backend`.
    pub fn new(backend: Box<dyn StorageBackend>, page_size: usize) -> Self {
        Self { backend, page_size }
    }

    /// Logs a whole transaction. Nothing is visible to recovery until the
    /// trailing commit record is written.
    pub fn append_transaction(
        &mut self,
        txid: TransactionId,
        ops: &[WriteOp],
        snapshot: Snapshot,
    ) -> CoreResult<u64> {
        let mut data = WAL_FORMAT.encode(KIND_BEGIN, &WalRecord::Begin { txid }.encode_payload())?;
        for op in ops {
            let record = WalRecord::Op {
                txid,
                op: op.clone(),
            };
            data.extend(WAL_FORMAT.encode(record.kind(), &record.encode_payload())?);
        }
        let commit = WalRecord::Commit { txid, snapshot };
        data.extend(WAL_FORMAT.encode(commit.kind(), &commit.encode_payload())?);
        let start = self.backend.size()?;
        match self.backend.append(&data) {
            Ok(offset) => Ok(offset),
            Err(e) => {
                // A partial append must not stay in front of later transactions.
                if let Err(cut) = self.backend.truncate(start) {
                    tracing::warn!(error = %cut, "could not cut failed WAL append");
                }
                Err(e.into())
            }
        }
    }

    /// Pushes buffered writes to the OS.
    pub fn flush(&mut self) -> CoreResult<()> {
        Ok(self.backend.flush()?)
    }

    /// Makes the log durable.
    pub fn sync(&mut self) -> CoreResult<()> {
        Ok(self.backend.sync()?)
    }

    /// Current size in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Reads every complete record.
    pub fn records(&self) -> CoreResult<Vec<(u64, WalRecord)>> {
        WAL_FORMAT
            .reader(self.backend.as_ref(), self.page_size)?
            .map(|frame| {
                let frame = frame?;
                Ok((frame.offset, WalRecord::decode(&frame)?))
            })
            .collect()
    }

    /// Groups the log into committed transactions, dropping any transaction
    /// without a commit record.
    pub fn committed_batches(&self) -> CoreResult<Vec<CommittedBatch>> {
        let mut batches = Vec::new();
        let mut open: Option<(TransactionId, Vec<WriteOp>)> = None;
        for (offset, record) in self.records()? {
            match record {
                WalRecord::Begin { txid } => open = Some((txid, Vec::new())),
                WalRecord::Op { txid, op } => match open.as_mut() {
                    Some((current, ops)) if *current == txid => ops.push(op),
                    _ => {
                        return Err(CoreError::wal_corruption(format!(
                            "operation for {txid} outside its transaction at offset {offset}"
                        )))
                    }
                },
                WalRecord::Commit { txid, snapshot } => match open.take() {
                    Some((current, ops)) if current == txid => {
                        batches.push(CommittedBatch { snapshot, ops });
                    }
                    _ => {
                        return Err(CoreError::wal_corruption(format!(
                            "commit for {txid} without begin at offset {offset}"
                        )))
                    }
                },
                WalRecord::Checkpoint { .. } => {}
            }
        }
        Ok(batches)
    }

    /// Cuts everything after the last commit or checkpoint record, so that
    /// appends never land behind a torn or uncommitted transaction.
    ///
    /// Returns the number of bytes removed.
    pub fn discard_torn_tail(&mut self) -> CoreResult<u64> {
        let total = self.backend.size()?;
        let mut valid = 0;
        {
            let mut reader = WAL_FORMAT.reader(self.backend.as_ref(), self.page_size)?;
            while let Some(frame) = reader.next() {
                let frame = frame?;
                if matches!(frame.kind, KIND_COMMIT | KIND_CHECKPOINT) {
                    valid = reader.position();
                }
            }
        }
        if valid < total {
            self.backend.truncate(valid)?;
        }
        Ok(total - valid)
    }

    /// Rewrites the log keeping only transactions committed after `snapshot`.
    ///
    /// Returns the number of transactions kept.
    pub fn retain_after(&mut self, snapshot: Snapshot) -> CoreResult<usize> {
        let keep: Vec<CommittedBatch> = self
            .committed_batches()?
            .into_iter()
            .filter(|batch| batch.snapshot > snapshot)
            .collect();
        if keep.is_empty() {
            self.backend.truncate(0)?;
            return Ok(0);
        }
        let marker = WalRecord::Checkpoint { snapshot };
        let mut data = WAL_FORMAT.encode(marker.kind(), &marker.encode_payload())?;
        for (i, batch) in keep.iter().enumerate() {
            let txid = TransactionId::new(i as u64 + 1);
            data.extend(WAL_FORMAT.encode(KIND_BEGIN, &WalRecord::Begin { txid }.encode_payload())?);
            for op in &batch.ops {
                let record = WalRecord::Op {
                    txid,
                    op: op.clone(),
                };
                data.extend(WAL_FORMAT.encode(record.kind(), &record.encode_payload())?);
            }
            let commit = WalRecord::Commit {
                txid,
                snapshot: batch.snapshot,
            };
            data.extend(WAL_FORMAT.encode(commit.kind(), &commit.encode_payload())?);
        }
        self.backend.replace(&data)?;
        Ok(keep.len())
    }

    /// Highest transaction id in the log.
    pub fn max_txid(&self) -> CoreResult<u64> {
        Ok(self
            .records()?
            .iter()
            .filter_map(|(_, record)| match record {
                WalRecord::Begin { txid } => Some(txid.as_u64()),
                _ => None,
            })
            .max()
            .unwrap_or(0))
    }
}
