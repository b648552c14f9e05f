//! Engine handles and their transactions.

use super::versions::StoredRow;
use super::wal::WriteOp;
use super::StorageEngine;
use crate::error::CoreResult;
use crate::types::{CollectionKey, RowId, Snapshot};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

/// Read access to the tables at one snapshot.
///
/// Implemented by [`ReadTxn`] and by [`WriteTxn`], which additionally sees its
/// own uncommitted changes.
pub trait RowRead {
    /// Snapshot the reads are pinned to. For a write transaction this is the
    /// snapshot it started from.
    fn snapshot(&self) -> Snapshot;

    /// Fetches one row.
    fn get(&self, table: &str, key: &CollectionKey) -> Option<Arc<StoredRow>>;

    /// Fetches a row by rowid.
    fn get_by_rowid(&self, table: &str, rowid: RowId) -> Option<(CollectionKey, Arc<StoredRow>)>;

    /// Keys of one collection, in key order.
    fn keys_in_collection(&self, table: &str, collection: &str) -> Vec<String>;

    /// Collections with at least one row, in order.
    fn collections(&self, table: &str) -> Vec<String>;

    /// Every row address, in order.
    fn keys(&self, table: &str) -> Vec<CollectionKey>;

    /// Whether the table exists.
    fn table_exists(&self, table: &str) -> bool;
}

/// A connection's private handle on the engine.
///
/// Handles are never shared: a connection checks one out of the pool, uses
/// it for every transaction, and checks it back in when it is dropped.
#[derive(Debug)]
pub struct EngineHandle {
    id: u64,
    engine: Arc<StorageEngine>,
    opened_at: Instant,
    transactions: u64,
}

impl EngineHandle {
    pub(crate) fn new(id: u64, engine: Arc<StorageEngine>) -> Self {
        Self {
            id,
            engine,
            opened_at: Instant::now(),
            transactions: 0,
        }
    }

    /// Handle number, unique per engine.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the handle was opened.
    #[must_use]
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Transactions begun on this handle.
    #[must_use]
    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    /// The engine this handle belongs to.
    #[must_use]
    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Begins a read transaction at the latest committed snapshot.
    pub fn begin_read(&mut self) -> ReadTxn {
        self.transactions += 1;
        let snapshot = self.engine.pin_latest();
        ReadTxn {
            engine: Arc::clone(&self.engine),
            snapshot,
        }
    }

    /// Begins a write transaction on top of the latest committed snapshot.
    pub fn begin_write(&mut self) -> WriteTxn {
        self.transactions += 1;
        let base = self.engine.pin_latest();
        WriteTxn {
            engine: Arc::clone(&self.engine),
            base,
            overlay: BTreeMap::new(),
            ops: Vec::new(),
        }
    }
}

/// A read transaction pinned to one snapshot.
#[derive(Debug)]
pub struct ReadTxn {
    engine: Arc<StorageEngine>,
    snapshot: Snapshot,
}

impl Drop for ReadTxn {
    fn drop(&mut self) {
        self.engine.unpin(self.snapshot);
    }
}

impl RowRead for ReadTxn {
    fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    fn get(&self, table: &str, key: &CollectionKey) -> Option<Arc<StoredRow>> {
        self.engine.versions().get(table, key, self.snapshot)
    }

    fn get_by_rowid(&self, table: &str, rowid: RowId) -> Option<(CollectionKey, Arc<StoredRow>)> {
        self.engine.versions().get_by_rowid(table, rowid, self.snapshot)
    }

    fn keys_in_collection(&self, table: &str, collection: &str) -> Vec<String> {
        self.engine
            .versions()
            .keys_in_collection(table, collection, self.snapshot)
    }

    fn collections(&self, table: &str) -> Vec<String> {
        self.engine.versions().collections(table, self.snapshot)
    }

    fn keys(&self, table: &str) -> Vec<CollectionKey> {
        self.engine.versions().keys(table, self.snapshot)
    }

    fn table_exists(&self, table: &str) -> bool {
        self.engine.versions().table_exists(table, self.snapshot)
    }
}

#[derive(Debug, Default)]
struct TableOverlay {
    cleared: bool,
    dropped: bool,
    created: bool,
    cleared_collections: BTreeSet<String>,
    rows: BTreeMap<CollectionKey, Option<Arc<StoredRow>>>,
}

impl TableOverlay {
    /// Whether the committed row at `key` is hidden by this overlay.
    fn hides_base(&self, key: &CollectionKey) -> bool {
        self.cleared || self.dropped || self.cleared_collections.contains(&key.collection)
    }
}

/// A write transaction. Changes are buffered until [`WriteTxn::commit`];
/// dropping the transaction discards them.
#[derive(Debug)]
pub struct WriteTxn {
    engine: Arc<StorageEngine>,
    base: Snapshot,
    overlay: BTreeMap<String, TableOverlay>,
    ops: Vec<WriteOp>,
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        self.engine.unpin(self.base);
    }
}

impl WriteTxn {
    /// Whether any operation has been buffered.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.ops.is_empty()
    }

    /// Number of buffered operations.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Reserves a new rowid.
    pub fn allocate_rowid(&mut self) -> RowId {
        self.engine.allocate_rowid()
    }

    /// Inserts or overwrites a row.
    pub fn put(&mut self, table: &str, key: CollectionKey, row: StoredRow) {
        let row = Arc::new(row);
        let overlay = self.overlay.entry(table.to_string()).or_default();
        if overlay.dropped {
            overlay.dropped = false;
            overlay.created = true;
        }
        overlay.rows.insert(key.clone(), Some(Arc::clone(&row)));
        self.ops.push(WriteOp::Put {
            table: table.to_string(),
            key,
            row,
        });
    }

    /// Removes a row.
    pub fn delete(&mut self, table: &str, key: &CollectionKey) {
        self.overlay
            .entry(table.to_string())
            .or_default()
            .rows
            .insert(key.clone(), None);
        self.ops.push(WriteOp::Delete {
            table: table.to_string(),
            key: key.clone(),
        });
    }

    /// Removes every row of a collection.
    pub fn clear_collection(&mut self, table: &str, collection: &str) {
        let overlay = self.overlay.entry(table.to_string()).or_default();
        overlay.rows.retain(|key, _| key.collection != collection);
        overlay.cleared_collections.insert(collection.to_string());
        self.ops.push(WriteOp::ClearCollection {
            table: table.to_string(),
            collection: collection.to_string(),
        });
    }

    /// Removes every row of a table.
    pub fn clear_table(&mut self, table: &str) {
        let overlay = self.overlay.entry(table.to_string()).or_default();
        overlay.rows.clear();
        overlay.cleared_collections.clear();
        overlay.cleared = true;
        self.ops.push(WriteOp::ClearTable {
            table: table.to_string(),
        });
    }

    /// Creates a table if it does not exist.
    pub fn create_table(&mut self, table: &str) {
        let overlay = self.overlay.entry(table.to_string()).or_default();
        if overlay.dropped {
            overlay.dropped = false;
            overlay.cleared = true;
        }
        overlay.created = true;
        self.ops.push(WriteOp::CreateTable {
            table: table.to_string(),
        });
    }

    /// Drops a table and its rows.
    pub fn drop_table(&mut self, table: &str) {
        let overlay = self.overlay.entry(table.to_string()).or_default();
        overlay.rows.clear();
        overlay.cleared_collections.clear();
        overlay.created = false;
        overlay.dropped = true;
        self.ops.push(WriteOp::DropTable {
            table: table.to_string(),
        });
    }

    /// Commits the buffered operations and returns the new snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the WAL cannot be written, or if another
    /// transaction committed since this one began.
    pub fn commit(mut self) -> CoreResult<Snapshot> {
        let ops = std::mem::take(&mut self.ops);
        self.engine.commit(self.base, ops)
    }
}

impl RowRead for WriteTxn {
    fn snapshot(&self) -> Snapshot {
        self.base
    }

    fn get(&self, table: &str, key: &CollectionKey) -> Option<Arc<StoredRow>> {
        if let Some(overlay) = self.overlay.get(table) {
            if let Some(row) = overlay.rows.get(key) {
                return row.clone();
            }
            if overlay.hides_base(key) {
                return None;
            }
        }
        self.engine.versions().get(table, key, self.base)
    }

    fn get_by_rowid(&self, table: &str, rowid: RowId) -> Option<(CollectionKey, Arc<StoredRow>)> {
        if let Some(overlay) = self.overlay.get(table) {
            let written = overlay.rows.iter().find_map(|(key, row)| {
                row.as_ref()
                    .filter(|row| row.rowid == rowid)
                    .map(|row| (key.clone(), Arc::clone(row)))
            });
            if written.is_some() {
                return written;
            }
        }
        let (key, row) = self.engine.versions().get_by_rowid(table, rowid, self.base)?;
        let current = self.get(table, &key)?;
        (current.rowid == rowid).then_some((key, row))
    }

    fn keys_in_collection(&self, table: &str, collection: &str) -> Vec<String> {
        let base = || {
            self.engine
                .versions()
                .keys_in_collection(table, collection, self.base)
        };
        let Some(overlay) = self.overlay.get(table) else {
            return base();
        };
        let mut keys: BTreeSet<String> = if overlay.cleared
            || overlay.dropped
            || overlay.cleared_collections.contains(collection)
        {
            BTreeSet::new()
        } else {
            base().into_iter().collect()
        };
        let start = CollectionKey::new(collection, "");
        for (key, row) in overlay
            .rows
            .range(start..)
            .take_while(|(key, _)| key.collection == collection)
        {
            if row.is_some() {
                keys.insert(key.key.clone());
            } else {
                keys.remove(&key.key);
            }
        }
        keys.into_iter().collect()
    }

    fn collections(&self, table: &str) -> Vec<String> {
        let Some(overlay) = self.overlay.get(table) else {
            return self.engine.versions().collections(table, self.base);
        };
        let mut candidates: BTreeSet<String> = self
            .engine
            .versions()
            .collections(table, self.base)
            .into_iter()
            .collect();
        candidates.extend(overlay.rows.keys().map(|key| key.collection.clone()));
        candidates
            .into_iter()
            .filter(|collection| !self.keys_in_collection(table, collection).is_empty())
            .collect()
    }

    fn keys(&self, table: &str) -> Vec<CollectionKey> {
        self.collections(table)
            .into_iter()
            .flat_map(|collection| {
                self.keys_in_collection(table, &collection)
                    .into_iter()
                    .map(move |key| CollectionKey::new(collection.clone(), key))
            })
            .collect()
    }

    fn table_exists(&self, table: &str) -> bool {
        match self.overlay.get(table) {
            Some(overlay) if overlay.dropped => false,
            Some(overlay) if overlay.created || overlay.rows.values().any(Option::is_some) => true,
            _ => self.engine.versions().table_exists(table, self.base),
        }
    }
}
