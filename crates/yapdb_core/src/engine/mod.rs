//! The storage engine underneath the database.
//!
//! A transactional row store: tables of `(collection, key) -> row` with a
//! write-ahead log, a compacted main store, and in-memory version chains that
//! give every read transaction a stable snapshot.
//!
//! ## Files
//!
//! - WAL: `Begin`, operations, `Commit(snapshot)` per transaction.
//! - Main store: the image of all tables at the last checkpoint.
//!
//! ## Recovery
//!
//! Load the main store image, then replay every WAL transaction whose commit
//! snapshot is newer than the image. Transactions missing their commit record
//! are discarded.
//!
//! ## Invariants
//!
//! - Snapshots produced by `commit` are consecutive.
//! - A read transaction never observes a commit newer than its snapshot.
//! - Checkpoint never prunes a version a pinned reader can still see.

mod codec;
mod handle;
mod pool;
mod store;
mod versions;
mod wal;

pub use codec::compute_crc32;
pub(crate) use codec::{ByteReader, ByteWriter};
pub use handle::{EngineHandle, ReadTxn, RowRead, WriteTxn};
pub use pool::{HandlePool, PoolStats};
pub use store::{MainStore, StoreImage};
pub use versions::{StoredRow, VersionedTables};
pub use wal::{CommittedBatch, WalManager, WalRecord, WriteOp};

use crate::config::Synchronous;
use crate::error::{CoreError, CoreResult};
use crate::types::{RowId, Snapshot, TransactionId};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use yapdb_storage::{InMemoryBackend, StorageBackend};

/// Name of the main row table.
pub const MAIN_TABLE: &str = "database2";

/// Name of the persisted configuration table.
pub const CONFIG_TABLE: &str = "yap2";

/// The two files of an engine.
pub struct EngineFiles {
    /// Write-ahead log.
    pub wal: Box<dyn StorageBackend>,
    /// Main store.
    pub store: Box<dyn StorageBackend>,
}

impl EngineFiles {
    /// Fresh in-memory files.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            wal: Box::new(InMemoryBackend::new()),
            store: Box::new(InMemoryBackend::new()),
        }
    }
}

/// Engine tuning.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Commit durability.
    pub synchronous: Synchronous,
    /// Read buffer size for scanning files.
    pub page_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            synchronous: Synchronous::Normal,
            page_size: 4096,
        }
    }
}

/// Outcome of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Snapshot now covered by the main store.
    pub snapshot: Snapshot,
    /// Committed transactions still in the WAL afterwards.
    pub wal_transactions_kept: usize,
    /// Row versions dropped from memory.
    pub versions_pruned: usize,
}

struct EngineWriter {
    wal: WalManager,
    next_txid: u64,
}

/// The storage engine shared by every handle of a database.
pub struct StorageEngine {
    options: EngineOptions,
    versions: RwLock<VersionedTables>,
    latest: AtomicU64,
    checkpointed: AtomicU64,
    next_rowid: AtomicU64,
    next_handle: AtomicU64,
    writer: Mutex<EngineWriter>,
    store: Mutex<MainStore>,
    pins: Mutex<BTreeMap<Snapshot, usize>>,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("latest", &self.latest_snapshot())
            .field("checkpointed", &self.checkpointed_snapshot())
            .finish_non_exhaustive()
    }
}

impl StorageEngine {
    /// Opens an engine over `files`, recovering committed state.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if either file is damaged.
    pub fn open(files: EngineFiles, options: EngineOptions) -> CoreResult<Arc<Self>> {
        let store = MainStore::new(files.store, options.page_size);
        let mut wal = WalManager::new(files.wal, options.page_size);
        let torn = wal.discard_torn_tail()?;
        if torn > 0 {
            tracing::warn!(bytes = torn, "discarded incomplete WAL tail");
        }

        let image = store.load()?;
        let mut versions = VersionedTables::new();
        let mut seed: Vec<WriteOp> = image
            .empty_tables
            .iter()
            .map(|table| WriteOp::CreateTable {
                table: table.clone(),
            })
            .collect();
        seed.extend(image.rows.iter().map(|(table, key, row)| WriteOp::Put {
            table: table.clone(),
            key: key.clone(),
            row: Arc::clone(row),
        }));
        versions.apply(&seed, image.snapshot);

        let mut latest = image.snapshot;
        let mut replayed = 0usize;
        for batch in wal.committed_batches()? {
            if batch.snapshot <= image.snapshot {
                continue;
            }
            if batch.snapshot != latest.next() {
                return Err(CoreError::wal_corruption(format!(
                    "snapshot gap in WAL: expected {}, found {}",
                    latest.next(),
                    batch.snapshot
                )));
            }
            versions.apply(&batch.ops, batch.snapshot);
            latest = batch.snapshot;
            replayed += 1;
        }

        let next_rowid = image.next_rowid.max(versions.max_rowid() + 1).max(1);
        let next_txid = wal.max_txid()? + 1;
        tracing::debug!(
            checkpoint = image.snapshot.as_u64(),
            latest = latest.as_u64(),
            replayed,
            "storage engine recovered"
        );

        Ok(Arc::new(Self {
            options,
            versions: RwLock::new(versions),
            latest: AtomicU64::new(latest.as_u64()),
            checkpointed: AtomicU64::new(image.snapshot.as_u64()),
            next_rowid: AtomicU64::new(next_rowid),
            next_handle: AtomicU64::new(1),
            writer: Mutex::new(EngineWriter { wal, next_txid }),
            store: Mutex::new(store),
            pins: Mutex::new(BTreeMap::new()),
        }))
    }

    /// Opens an empty in-memory engine.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches [`Self::open`].
    pub fn open_in_memory() -> CoreResult<Arc<Self>> {
        Self::open(EngineFiles::in_memory(), EngineOptions::default())
    }

    /// Opens a new handle.
    pub fn open_handle(self: &Arc<Self>) -> EngineHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        EngineHandle::new(id, Arc::clone(self))
    }

    /// Latest committed snapshot.
    #[must_use]
    pub fn latest_snapshot(&self) -> Snapshot {
        Snapshot::new(self.latest.load(Ordering::Acquire))
    }

    /// Snapshot covered by the main store.
    #[must_use]
    pub fn checkpointed_snapshot(&self) -> Snapshot {
        Snapshot::new(self.checkpointed.load(Ordering::Acquire))
    }

    /// Oldest snapshot pinned by an open transaction.
    #[must_use]
    pub fn oldest_pinned(&self) -> Option<Snapshot> {
        self.pins.lock().keys().next().copied()
    }

    /// Current WAL size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    pub fn wal_size(&self) -> CoreResult<u64> {
        self.writer.lock().wal.size()
    }

    /// Current main store size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    pub fn store_size(&self) -> CoreResult<u64> {
        self.store.lock().size()
    }

    /// Number of row versions held in memory.
    #[must_use]
    pub fn version_count(&self) -> usize {
        self.versions.read().version_count()
    }

    /// Rowid the next insert will receive.
    #[must_use]
    pub fn next_rowid(&self) -> u64 {
        self.next_rowid.load(Ordering::Relaxed)
    }

    pub(crate) fn versions(&self) -> RwLockReadGuard<'_, VersionedTables> {
        self.versions.read()
    }

    pub(crate) fn allocate_rowid(&self) -> RowId {
        RowId::new(self.next_rowid.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn pin_latest(&self) -> Snapshot {
        let mut pins = self.pins.lock();
        let snapshot = self.latest_snapshot();
        *pins.entry(snapshot).or_insert(0) += 1;
        snapshot
    }

    pub(crate) fn unpin(&self, snapshot: Snapshot) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&snapshot) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&snapshot);
            }
        }
    }

    fn commit(&self, base: Snapshot, ops: Vec<WriteOp>) -> CoreResult<Snapshot> {
        let mut writer = self.writer.lock();
        let latest = self.latest_snapshot();
        if base != latest {
            return Err(CoreError::invalid_operation(format!(
                "write transaction began at {base} but {latest} is committed"
            )));
        }
        let snapshot = latest.next();
        let txid = TransactionId::new(writer.next_txid);
        writer.next_txid += 1;

        writer.wal.append_transaction(txid, &ops, snapshot)?;
        match self.options.synchronous {
            Synchronous::Off => {}
            Synchronous::Normal => writer.wal.flush()?,
            Synchronous::Full => writer.wal.sync()?,
        }

        self.versions.write().apply(&ops, snapshot);
        self.latest.store(snapshot.as_u64(), Ordering::Release);
        tracing::trace!(%txid, %snapshot, ops = ops.len(), "engine commit");
        Ok(snapshot)
    }

    /// Drops versions older than the oldest pinned snapshot and returns how
    /// many went.
    ///
    /// The pins lock is held until pruning ends: a reader pinning meanwhile
    /// would otherwise land on a snapshot below the floor.
    fn prune_unpinned(&self) -> usize {
        let pins = self.pins.lock();
        let latest = self.latest_snapshot();
        let floor = pins.keys().next().copied().unwrap_or(latest).min(latest);
        let mut versions = self.versions.write();
        let before = versions.version_count();
        versions.prune(floor);
        before - versions.version_count()
    }

    /// Folds committed state up to `limit` into the main store.
    ///
    /// Commits may continue while the store image is written; the WAL is
    /// rewritten under the writer lock afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or WAL cannot be rewritten.
    pub fn checkpoint(&self, limit: Snapshot) -> CoreResult<CheckpointReport> {
        let mut store = self.store.lock();
        let target = limit.min(self.latest_snapshot());
        let mut kept = 0;

        if target > self.checkpointed_snapshot() {
            let (rows, empty_tables) = self.versions.read().image_at(target);
            store.write(&StoreImage {
                snapshot: target,
                next_rowid: self.next_rowid.load(Ordering::Relaxed),
                empty_tables,
                rows,
            })?;
            self.checkpointed.store(target.as_u64(), Ordering::Release);

            let mut writer = self.writer.lock();
            if self.options.synchronous != Synchronous::Off {
                writer.wal.sync()?;
            }
            kept = writer.wal.retain_after(target)?;
        }

        let pruned = self.prune_unpinned();

        tracing::debug!(
            snapshot = target.as_u64(),
            wal_transactions_kept = kept,
            pruned,
            "checkpoint complete"
        );
        Ok(CheckpointReport {
            snapshot: self.checkpointed_snapshot(),
            wal_transactions_kept: kept,
            versions_pruned: pruned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CollectionKey;

    fn row(data: &[u8]) -> StoredRow {
        StoredRow {
            rowid: RowId::new(0),
            data: data.to_vec(),
            metadata: None,
        }
    }

    fn files(wal: &InMemoryBackend, store: &InMemoryBackend) -> EngineFiles {
        EngineFiles {
            wal: Box::new(wal.clone()),
            store: Box::new(store.clone()),
        }
    }

    #[test]
    fn commits_produce_consecutive_snapshots() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let mut handle = engine.open_handle();
        for expected in 1..=3 {
            let mut txn = handle.begin_write();
            txn.put(MAIN_TABLE, CollectionKey::new("c", "k"), row(b"v"));
            assert_eq!(txn.commit().unwrap(), Snapshot::new(expected));
        }
        assert_eq!(engine.latest_snapshot(), Snapshot::new(3));
    }

    #[test]
    fn checkpoints_never_prune_under_a_live_reader() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let key = CollectionKey::new("c", "k");
        let stop = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut writer = engine.open_handle();
                for _ in 0..300 {
                    let mut txn = writer.begin_write();
                    let next = txn.snapshot().next().as_u64();
                    txn.put(MAIN_TABLE, key.clone(), row(&next.to_le_bytes()));
                    txn.commit().unwrap();
                }
                stop.store(true, Ordering::Release);
            });
            s.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    engine.checkpoint(engine.latest_snapshot()).unwrap();
                }
            });
            for _ in 0..2 {
                s.spawn(|| {
                    let mut reader = engine.open_handle();
                    while !stop.load(Ordering::Acquire) {
                        let txn = reader.begin_read();
                        let pinned = txn.snapshot().as_u64();
                        std::thread::yield_now();
                        match txn.get(MAIN_TABLE, &key) {
                            Some(found) => assert_eq!(found.data, pinned.to_le_bytes()),
                            None => assert_eq!(pinned, 0),
                        }
                    }
                });
            }
        });
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let mut writer = engine.open_handle();
        let mut reader = engine.open_handle();
        let key = CollectionKey::new("notes", "1");

        let mut txn = writer.begin_write();
        txn.put(MAIN_TABLE, key.clone(), row(b"hello"));
        txn.commit().unwrap();

        let read = reader.begin_read();
        let mut txn = writer.begin_write();
        txn.delete(MAIN_TABLE, &key);
        assert!(txn.get(MAIN_TABLE, &key).is_none());
        txn.commit().unwrap();

        assert_eq!(read.get(MAIN_TABLE, &key).unwrap().data, b"hello");
        assert!(reader.begin_read().get(MAIN_TABLE, &key).is_none());
    }

    #[test]
    fn dropped_write_is_rolled_back() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let mut handle = engine.open_handle();
        {
            let mut txn = handle.begin_write();
            txn.put(MAIN_TABLE, CollectionKey::new("c", "k"), row(b"x"));
        }
        assert_eq!(engine.latest_snapshot(), Snapshot::ZERO);
        assert!(handle
            .begin_read()
            .get(MAIN_TABLE, &CollectionKey::new("c", "k"))
            .is_none());
        assert!(engine.oldest_pinned().is_none());
    }

    #[test]
    fn stale_write_is_refused() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let mut a = engine.open_handle();
        let mut b = engine.open_handle();
        let first = a.begin_write();
        b.begin_write().commit().unwrap();
        assert!(matches!(
            first.commit(),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn overlay_sees_cleared_collections() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let mut handle = engine.open_handle();
        let mut txn = handle.begin_write();
        for key in ["a", "b"] {
            txn.put(MAIN_TABLE, CollectionKey::new("users", key), row(b"1"));
        }
        txn.put(MAIN_TABLE, CollectionKey::new("products", "p"), row(b"2"));
        txn.commit().unwrap();

        let mut txn = handle.begin_write();
        txn.clear_collection(MAIN_TABLE, "users");
        txn.put(MAIN_TABLE, CollectionKey::new("users", "c"), row(b"3"));
        assert_eq!(txn.keys_in_collection(MAIN_TABLE, "users"), vec!["c"]);
        assert_eq!(txn.collections(MAIN_TABLE), vec!["products", "users"]);

        txn.clear_table(MAIN_TABLE);
        assert!(txn.collections(MAIN_TABLE).is_empty());
        assert!(txn.keys(MAIN_TABLE).is_empty());
    }

    #[test]
    fn recovery_replays_the_wal() {
        let wal = InMemoryBackend::new();
        let store = InMemoryBackend::new();
        {
            let engine = StorageEngine::open(files(&wal, &store), EngineOptions::default()).unwrap();
            let mut handle = engine.open_handle();
            let mut txn = handle.begin_write();
            let rowid = txn.allocate_rowid();
            txn.put(
                MAIN_TABLE,
                CollectionKey::new("notes", "1"),
                StoredRow {
                    rowid,
                    data: b"hello".to_vec(),
                    metadata: Some(b"meta".to_vec()),
                },
            );
            txn.create_table("ext_index_values");
            txn.commit().unwrap();
        }

        let engine = StorageEngine::open(files(&wal, &store), EngineOptions::default()).unwrap();
        assert_eq!(engine.latest_snapshot(), Snapshot::new(1));
        let read = engine.open_handle().begin_read();
        let row = read.get(MAIN_TABLE, &CollectionKey::new("notes", "1")).unwrap();
        assert_eq!(row.metadata.as_deref(), Some(&b"meta"[..]));
        assert!(read.table_exists("ext_index_values"));
        assert!(engine.allocate_rowid() > row.rowid);
    }

    #[test]
    fn checkpoint_moves_state_into_the_store() {
        let wal = InMemoryBackend::new();
        let store = InMemoryBackend::new();
        {
            let engine = StorageEngine::open(files(&wal, &store), EngineOptions::default()).unwrap();
            let mut handle = engine.open_handle();
            for i in 0..4 {
                let mut txn = handle.begin_write();
                let rowid = txn.allocate_rowid();
                txn.put(
                    MAIN_TABLE,
                    CollectionKey::new("c", i.to_string()),
                    StoredRow {
                        rowid,
                        data: vec![i],
                        metadata: None,
                    },
                );
                txn.commit().unwrap();
            }
            let report = engine.checkpoint(Snapshot::new(3)).unwrap();
            assert_eq!(report.snapshot, Snapshot::new(3));
            assert_eq!(report.wal_transactions_kept, 1);

            let report = engine.checkpoint(Snapshot::new(u64::MAX)).unwrap();
            assert_eq!(report.snapshot, Snapshot::new(4));
            assert_eq!(engine.wal_size().unwrap(), 0);
        }

        let engine = StorageEngine::open(files(&wal, &store), EngineOptions::default()).unwrap();
        assert_eq!(engine.latest_snapshot(), Snapshot::new(4));
        assert_eq!(engine.checkpointed_snapshot(), Snapshot::new(4));
        let read = engine.open_handle().begin_read();
        assert_eq!(read.keys_in_collection(MAIN_TABLE, "c").len(), 4);
    }

    #[test]
    fn checkpoint_keeps_versions_of_pinned_readers() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let mut handle = engine.open_handle();
        let key = CollectionKey::new("c", "k");
        let mut txn = handle.begin_write();
        txn.put(MAIN_TABLE, key.clone(), row(b"old"));
        txn.commit().unwrap();

        let reader = engine.open_handle().begin_read();
        let mut txn = handle.begin_write();
        txn.put(MAIN_TABLE, key.clone(), row(b"new"));
        txn.commit().unwrap();

        engine.checkpoint(Snapshot::new(u64::MAX)).unwrap();
        assert_eq!(reader.get(MAIN_TABLE, &key).unwrap().data, b"old");
        drop(reader);

        let report = engine.checkpoint(Snapshot::new(u64::MAX)).unwrap();
        assert_eq!(report.versions_pruned, 1);
    }
}
