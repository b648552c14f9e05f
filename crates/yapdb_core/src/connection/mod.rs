//! Connections: one actor's private, cached view of the database.
//!
//! A connection owns an engine handle from the pool, its row caches, and one
//! [`ExtensionConnection`] per registered extension. Its transactions run one
//! at a time. Before each transaction the connection catches up with commits
//! made by its siblings, either by folding their changesets into its caches
//! or, when too far behind, by dropping the caches.
//!
//! ```rust,ignore
//! let conn = db.new_connection();
//! conn.read_write(|txn| txn.set_object("1", "notes", "hello".into()))?;
//! let note = conn.read(|txn| txn.object("1", "notes"))?;
//! ```

mod cache;

pub use cache::{CacheCounters, LruCache, RowCaches};

use crate::bus::CatchUp;
use crate::changeset::{Changeset, CoreChangeset, ExtensionChangeset};
use crate::config::{CachePolicy, ConnectionConfig};
use crate::database::{Database, DatabaseInner};
use crate::engine::{EngineHandle, RowRead, WriteTxn};
use crate::error::{CoreError, CoreResult};
use crate::extension::{Extension, ExtensionConnection, ExtensionMap, ExtensionTransaction};
use crate::notification::ModifiedNotification;
use crate::stats::DatabaseStats;
use crate::transaction::{Finished, ReadTransaction, ReadWriteTransaction, Transaction};
use crate::types::{CollectionKey, ConnectionId, Snapshot};
use ciborium::value::Value;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

/// How much memory [`Connection::flush_memory`] releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlushLevel {
    /// Halve the caches.
    Mild,
    /// Drop row caches and extension caches.
    Moderate,
    /// Also return the engine handle to the pool.
    Full,
}

type ExtTransactions = Vec<(String, Box<dyn ExtensionTransaction>)>;

struct ConnectionState {
    handle: Option<EngineHandle>,
    config: ConnectionConfig,
    caches: RowCaches,
    extensions: Arc<ExtensionMap>,
    ext_connections: Vec<(String, Box<dyn ExtensionConnection>)>,
    /// Set while a read-write body runs; still set afterwards only if the
    /// body panicked.
    dirty: bool,
}

fn same_extension(a: &Arc<dyn Extension>, b: &Arc<dyn Extension>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl ConnectionState {
    fn recover_if_dirty(&mut self) {
        if self.dirty {
            tracing::warn!("previous read-write transaction did not finish; dropping caches");
            self.caches.clear();
            for (_, conn) in &mut self.ext_connections {
                conn.invalidate();
            }
            self.dirty = false;
        }
    }

    /// Replaces the extension connections to match `map`, keeping the ones
    /// whose extension is unchanged.
    fn sync_extensions(&mut self, map: Arc<ExtensionMap>) {
        if Arc::ptr_eq(&self.extensions, &map) {
            return;
        }
        let mut previous = std::mem::take(&mut self.ext_connections);
        let mut next = Vec::with_capacity(map.len());
        for (name, ext) in map.iter() {
            let unchanged = self
                .extensions
                .get(name)
                .is_some_and(|old| same_extension(old, ext));
            let kept = if unchanged {
                previous
                    .iter()
                    .position(|(n, _)| n == name)
                    .map(|i| previous.swap_remove(i))
            } else {
                None
            };
            next.push(kept.unwrap_or_else(|| {
                (name.to_string(), Arc::clone(ext).new_connection(name))
            }));
        }
        self.ext_connections = next;
        self.extensions = map;
    }

    fn process_changeset(&mut self, changeset: &Changeset) {
        self.caches.apply(changeset);
        if let Some(map) = &changeset.registered_extensions {
            self.sync_extensions(Arc::clone(map));
        }
        for (name, conn) in &mut self.ext_connections {
            conn.process_changeset(changeset.extensions.get(name.as_str()), &changeset.core);
        }
    }

    fn apply_catch_up(&mut self, snapshot: Snapshot, catch_up: CatchUp, stats: &DatabaseStats) {
        match catch_up {
            CatchUp::Current => {}
            CatchUp::Replay(changesets) => {
                stats.record_catch_up_replay(changesets.len() as u64);
                for changeset in &changesets {
                    self.process_changeset(changeset);
                }
            }
            CatchUp::Invalidate(map) => {
                tracing::warn!(
                    snapshot = snapshot.as_u64(),
                    "connection fell behind; invalidating caches"
                );
                stats.record_cache_invalidation();
                self.caches.clear();
                self.sync_extensions(map);
                for (_, conn) in &mut self.ext_connections {
                    conn.invalidate();
                }
            }
        }
    }

    fn new_ext_transactions(&mut self, snapshot: Snapshot, writable: bool) -> ExtTransactions {
        self.ext_connections
            .iter_mut()
            .map(|(name, conn)| (name.clone(), conn.new_transaction(snapshot, writable)))
            .collect()
    }

    fn finish_ext_transactions(&mut self, transactions: ExtTransactions) {
        for (name, transaction) in transactions {
            if let Some((_, conn)) = self.ext_connections.iter_mut().find(|(n, _)| *n == name) {
                conn.finish_transaction(transaction);
            }
        }
    }

    fn discard_uncommitted(&mut self, wrote: bool) {
        if wrote {
            self.caches.clear();
        }
        for (_, conn) in &mut self.ext_connections {
            conn.post_rollback();
        }
    }

    fn report_cache_counters(&mut self, stats: &DatabaseStats) {
        let counters = self.caches.take_counters();
        stats.record_cache_lookups(counters.hits, counters.misses);
    }
}

/// Clears the owning thread when a transaction scope ends, even by panic.
struct OwnerGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

/// A connection to a [`Database`].
///
/// Connections are cheap to keep and may be shared between threads;
/// transactions on one connection run one at a time. Inside a transaction
/// body only [`Connection::id`], [`Connection::snapshot`] and
/// [`Connection::database`] may be called on the same connection; anything
/// else that needs the connection's state panics.
pub struct Connection {
    id: ConnectionId,
    db: Weak<DatabaseInner>,
    snapshot: AtomicU64,
    state: Mutex<ConnectionState>,
    owner: Mutex<Option<ThreadId>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        db: &Arc<DatabaseInner>,
        snapshot: Snapshot,
        extensions: Arc<ExtensionMap>,
        config: ConnectionConfig,
    ) -> Self {
        let ext_connections = extensions
            .iter()
            .map(|(name, ext)| (name.to_string(), Arc::clone(ext).new_connection(name)))
            .collect();
        Self {
            id,
            db: Arc::downgrade(db),
            snapshot: AtomicU64::new(snapshot.as_u64()),
            state: Mutex::new(ConnectionState {
                handle: None,
                caches: RowCaches::new(&config),
                config,
                extensions,
                ext_connections,
                dirty: false,
            }),
            owner: Mutex::new(None),
        }
    }

    /// Unique identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Snapshot of the connection's most recent transaction.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.snapshot.load(Ordering::Acquire))
    }

    fn set_snapshot(&self, snapshot: Snapshot) {
        self.snapshot.store(snapshot.as_u64(), Ordering::Release);
    }

    /// The database, if it is still open.
    #[must_use]
    pub fn database(&self) -> Option<Database> {
        self.db.upgrade().map(Database::from_inner)
    }

    /// Current cache configuration.
    #[must_use]
    pub fn config(&self) -> ConnectionConfig {
        self.lock_state("config").config
    }

    fn upgrade(&self) -> CoreResult<Arc<DatabaseInner>> {
        self.db.upgrade().ok_or(CoreError::DatabaseClosed)
    }

    /// Panics if the calling thread is already inside a transaction of this
    /// connection; waiting for the state lock would never end.
    fn check_reentry(&self, what: &str) {
        assert!(
            *self.owner.lock() != Some(thread::current().id()),
            "{what} called inside another transaction of {}",
            self.id
        );
    }

    /// Locks the state outside of any transaction of this connection.
    fn lock_state(&self, what: &str) -> MutexGuard<'_, ConnectionState> {
        self.check_reentry(what);
        self.state.lock()
    }

    /// Marks the calling thread as the owner until the guard drops. Must be
    /// called with the state lock held and dropped before it.
    fn claim(&self) -> OwnerGuard<'_> {
        *self.owner.lock() = Some(thread::current().id());
        OwnerGuard(&self.owner)
    }

    /// Checks out the engine handle ahead of the first transaction.
    /// Calling it again does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseClosed`] if the database was dropped.
    pub fn prepare(&self) -> CoreResult<()> {
        let db = self.upgrade()?;
        let mut state = self.lock_state("prepare");
        if state.handle.is_none() {
            state.handle = Some(db.pool.checkout());
            tracing::trace!(connection = %self.id, "handle prepared");
        }
        Ok(())
    }

    /// Runs `f` in a read transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseClosed`] if the database was dropped, or
    /// whatever `f` returns.
    pub fn read<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut ReadTransaction<'_>) -> CoreResult<T>,
    {
        let db = self.upgrade()?;
        let mut guard = self.lock_state("read");
        let _owner = self.claim();
        let state = &mut *guard;
        state.recover_if_dirty();

        let handle = state.handle.get_or_insert_with(|| db.pool.checkout());
        let (rows, catch_up) = db.begin_tracked(self.id, || handle.begin_read());
        let snapshot = rows.snapshot();
        self.set_snapshot(snapshot);
        state.apply_catch_up(snapshot, catch_up, &db.stats);
        db.stats.record_read_transaction();

        let ext_txns = state.new_ext_transactions(snapshot, false);
        let mut txn = Transaction::new(
            rows,
            &db,
            &mut state.caches,
            Arc::clone(&state.extensions),
            ext_txns,
        );
        let result = f(&mut txn);
        let finished = txn.finish();
        state.finish_ext_transactions(finished.ext_txns);
        state.report_cache_counters(&db.stats);
        result
    }

    /// Runs `f` in a read-write transaction.
    ///
    /// Waits for the database's write slot. Commits if `f` returns `Ok` and
    /// neither [`ReadWriteTransaction::rollback`] was called nor a write
    /// failed; otherwise rolls back.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error, the error of a failed write that `f` ignored, or
    /// the engine's commit error.
    pub fn read_write<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut ReadWriteTransaction<'_>) -> CoreResult<T>,
    {
        let db = self.upgrade()?;
        self.check_reentry("read_write");
        let _slot = db.write_slot.lock();
        let mut guard = self.state.lock();
        let _owner = self.claim();
        let state = &mut *guard;
        state.recover_if_dirty();

        let handle = state.handle.get_or_insert_with(|| db.pool.checkout());
        let (rows, catch_up) = db.begin_tracked(self.id, || handle.begin_write());
        let snapshot = rows.snapshot();
        self.set_snapshot(snapshot);
        state.apply_catch_up(snapshot, catch_up, &db.stats);
        db.stats.record_read_write_transaction();
        state.dirty = true;

        let ext_txns = state.new_ext_transactions(snapshot, true);
        let mut txn = Transaction::new(
            rows,
            &db,
            &mut state.caches,
            Arc::clone(&state.extensions),
            ext_txns,
        );
        let mut result = f(&mut txn);
        if result.is_ok() && !txn.will_roll_back() {
            if let Err(err) = txn.flush_extensions() {
                result = Err(err);
            }
        }
        let Finished {
            rows,
            ext_txns,
            changes,
            rollback_requested,
            abort,
            custom,
            pending_extensions,
        } = txn.finish();
        state.finish_ext_transactions(ext_txns);

        let outcome = match (result, abort) {
            (Ok(_), Some(reason)) => Err(reason.to_error()),
            (result, _) => result,
        };
        let result = match outcome {
            Ok(value) if !rollback_requested => self
                .commit(&db, state, rows, changes, custom, pending_extensions)
                .map(|_| value),
            outcome => {
                self.roll_back(&db, state, rows);
                outcome
            }
        };
        // Still dirty only when the engine refused the commit.
        if state.dirty {
            state.discard_uncommitted(true);
            db.stats.record_rollback();
        }
        state.dirty = false;
        state.report_cache_counters(&db.stats);
        result
    }

    fn roll_back(&self, db: &DatabaseInner, state: &mut ConnectionState, rows: WriteTxn) {
        let wrote = rows.has_changes();
        drop(rows);
        state.discard_uncommitted(wrote);
        state.dirty = false;
        db.stats.record_rollback();
        tracing::trace!(connection = %self.id, "rolled back");
    }

    fn commit(
        &self,
        db: &DatabaseInner,
        state: &mut ConnectionState,
        rows: WriteTxn,
        changes: CoreChangeset,
        custom: Option<Value>,
        pending_extensions: Option<Arc<ExtensionMap>>,
    ) -> CoreResult<Snapshot> {
        let snapshot = rows.snapshot().next();
        let live = pending_extensions.as_ref().unwrap_or(&state.extensions);
        let mut parts = BTreeMap::new();
        for (name, conn) in &mut state.ext_connections {
            if live.contains(name) {
                parts.insert(
                    name.clone(),
                    ExtensionChangeset {
                        internal: conn.internal_changeset(),
                        external: conn.external_changeset(),
                    },
                );
            }
        }
        let has_disk_changes = rows.has_changes();
        let changeset = Arc::new(Changeset::merge(
            snapshot,
            self.id,
            changes,
            parts,
            pending_extensions.clone(),
            has_disk_changes,
        ));

        // On failure `dirty` stays set and the caller discards the caches.
        db.publish(self.id, Arc::clone(&changeset), move || rows.commit())?;

        for (_, conn) in &mut state.ext_connections {
            conn.post_commit(snapshot);
        }
        self.set_snapshot(snapshot);
        if let Some(map) = pending_extensions {
            state.sync_extensions(map);
        }
        state.dirty = false;

        db.notifications.emit(ModifiedNotification {
            snapshot,
            origin: self.id,
            changes: Arc::clone(&changeset.external),
            custom,
        });
        db.stats.record_commit();
        tracing::trace!(connection = %self.id, %snapshot, has_disk_changes, "committed");
        db.after_commit(snapshot);
        Ok(snapshot)
    }

    // ------------------------------------------------------------------
    // Cache configuration
    // ------------------------------------------------------------------

    fn reconfigure(&self, update: impl FnOnce(&mut ConnectionConfig)) {
        let mut state = self.lock_state("cache configuration");
        update(&mut state.config);
        let config = state.config;
        state.caches.configure(&config);
    }

    /// Enables or disables the object cache.
    pub fn set_object_cache_enabled(&self, enabled: bool) {
        self.reconfigure(|config| config.object_cache_enabled = enabled);
    }

    /// Sets the object cache limit. Zero means unlimited.
    pub fn set_object_cache_limit(&self, limit: usize) {
        self.reconfigure(|config| config.object_cache_limit = limit);
    }

    /// Enables or disables the metadata cache.
    pub fn set_metadata_cache_enabled(&self, enabled: bool) {
        self.reconfigure(|config| config.metadata_cache_enabled = enabled);
    }

    /// Sets the metadata cache limit. Zero means unlimited.
    pub fn set_metadata_cache_limit(&self, limit: usize) {
        self.reconfigure(|config| config.metadata_cache_limit = limit);
    }

    /// Sets when the object cache is filled.
    pub fn set_object_cache_policy(&self, policy: CachePolicy) {
        self.reconfigure(|config| config.object_policy = policy);
    }

    /// Sets when the metadata cache is filled.
    pub fn set_metadata_cache_policy(&self, policy: CachePolicy) {
        self.reconfigure(|config| config.metadata_policy = policy);
    }

    /// Number of cached objects.
    #[must_use]
    pub fn cached_object_count(&self) -> usize {
        self.lock_state("cached_object_count").caches.object_count()
    }

    /// Number of cached metadata entries.
    #[must_use]
    pub fn cached_metadata_count(&self) -> usize {
        self.lock_state("cached_metadata_count").caches.metadata_count()
    }

    /// The cached object at `key`, without reading the engine.
    #[must_use]
    pub fn cached_object(&self, key: &str, collection: &str) -> Option<Value> {
        self.lock_state("cached_object")
            .caches
            .peek_object(&CollectionKey::new(collection, key))
            .cloned()
    }

    /// The cached metadata at `key`. The outer `None` means not cached; the
    /// inner one is a row cached as having no metadata.
    #[must_use]
    pub fn cached_metadata(&self, key: &str, collection: &str) -> Option<Option<Value>> {
        self.lock_state("cached_metadata")
            .caches
            .peek_metadata(&CollectionKey::new(collection, key))
            .cloned()
    }

    /// Releases memory. Never touches the database files.
    pub fn flush_memory(&self, level: FlushLevel) {
        let mut state = self.lock_state("flush_memory");
        match level {
            FlushLevel::Mild => state.caches.trim(),
            FlushLevel::Moderate | FlushLevel::Full => state.caches.clear(),
        }
        for (_, conn) in &mut state.ext_connections {
            conn.flush_memory(level);
        }
        if level == FlushLevel::Full {
            if let (Some(handle), Some(db)) = (state.handle.take(), self.db.upgrade()) {
                db.pool.checkin(handle);
            }
        }
        tracing::debug!(connection = %self.id, ?level, "memory flushed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(db) = self.db.upgrade() {
            db.remove_connection(self.id);
            if let Some(handle) = self.state.get_mut().handle.take() {
                db.pool.checkin(handle);
            }
        }
    }
}
