//! Database facade, open and recovery.

use crate::bus::{CatchUp, SnapshotBus};
use crate::changeset::Changeset;
use crate::config::{ConnectionConfig, CorruptAction, DatabaseOptions};
use crate::connection::Connection;
use crate::dir::DatabaseDir;
use crate::engine::{
    CheckpointReport, EngineFiles, EngineOptions, HandlePool, PoolStats, RowRead, StorageEngine,
};
use crate::error::{CoreError, CoreResult};
use crate::extension::{persisted_extension_names, Extension};
use crate::manifest::Manifest;
use crate::notification::{ModifiedNotification, NotificationCenter};
use crate::serialization::Serialization;
use crate::stats::DatabaseStats;
use crate::types::{ConnectionId, Snapshot};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use yapdb_storage::{
    DiskActivityObserver, FileBackend, InMemoryBackend, ObservedBackend, StorageBackend,
};

/// Background thread running requested checkpoints.
struct Checkpointer {
    requests: Sender<()>,
    worker: JoinHandle<()>,
}

impl Checkpointer {
    fn spawn(db: Weak<DatabaseInner>) -> Option<Self> {
        let (requests, inbox) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("yapdb-checkpoint".into())
            .spawn(move || run_checkpoints(&db, &inbox));
        match spawned {
            Ok(worker) => Some(Self { requests, worker }),
            Err(err) => {
                tracing::warn!(error = %err, "checkpoint thread unavailable; only explicit checkpoints will run");
                None
            }
        }
    }
}

fn run_checkpoints(db: &Weak<DatabaseInner>, inbox: &Receiver<()>) {
    while inbox.recv().is_ok() {
        // Requests that piled up meanwhile are served by this one run.
        while inbox.try_recv().is_ok() {}
        let Some(db) = db.upgrade() else {
            break;
        };
        if let Err(err) = db.checkpoint() {
            tracing::warn!(error = %err, "background checkpoint failed");
        }
    }
}

/// Runs `work` on a named thread and hands its result to `completion`.
/// If no thread can be started, `completion` gets the spawn error.
fn run_in_background<W, C>(name: &str, work: W, completion: C)
where
    W: FnOnce() -> CoreResult<()> + Send + 'static,
    C: FnOnce(CoreResult<()>) + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some((work, completion))));
    let job = Arc::clone(&slot);
    let spawned = thread::Builder::new().name(name.into()).spawn(move || {
        let taken = job.lock().take();
        if let Some((work, completion)) = taken {
            completion(work());
        }
    });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, thread = name, "background thread unavailable");
        let taken = slot.lock().take();
        if let Some((_, completion)) = taken {
            completion(Err(err.into()));
        }
    }
}

/// State shared by a [`Database`] and its connections.
pub(crate) struct DatabaseInner {
    pub(crate) options: DatabaseOptions,
    pub(crate) serialization: Serialization,
    pub(crate) engine: Arc<StorageEngine>,
    pub(crate) pool: HandlePool,
    /// Serializes read-write transactions.
    pub(crate) write_slot: Mutex<()>,
    pub(crate) notifications: NotificationCenter,
    pub(crate) stats: DatabaseStats,
    path: Option<PathBuf>,
    dir: Option<DatabaseDir>,
    manifest: Mutex<Manifest>,
    bus: Mutex<SnapshotBus>,
    checkpointing: Mutex<()>,
    checkpointer: Mutex<Option<Checkpointer>>,
}

impl DatabaseInner {
    /// Begins an engine transaction for connection `id` and tells it how to
    /// catch up. The bus lock is held across `begin` so that no commit is
    /// published between the two.
    pub(crate) fn begin_tracked<T: RowRead>(
        &self,
        id: ConnectionId,
        begin: impl FnOnce() -> T,
    ) -> (T, CatchUp) {
        let mut bus = self.bus.lock();
        let rows = begin();
        let catch_up = bus.catch_up(id, rows.snapshot());
        (rows, catch_up)
    }

    /// Runs the engine `commit` with `changeset` announced as pending, then
    /// publishes it to every sibling connection.
    pub(crate) fn publish(
        &self,
        origin: ConnectionId,
        changeset: Arc<Changeset>,
        commit: impl FnOnce() -> CoreResult<Snapshot>,
    ) -> CoreResult<()> {
        let expected = changeset.snapshot;
        self.bus.lock().note_pending(changeset);
        match commit() {
            Ok(snapshot) => {
                assert_eq!(
                    snapshot, expected,
                    "engine committed {snapshot} but {expected} was announced"
                );
                let delivered = self.bus.lock().note_committed(origin);
                self.stats.record_changesets_delivered(delivered as u64);
                Ok(())
            }
            Err(err) => {
                self.bus.lock().abandon_pending();
                Err(err)
            }
        }
    }

    pub(crate) fn remove_connection(&self, id: ConnectionId) {
        self.bus.lock().remove_connection(id);
        tracing::trace!(connection = %id, "connection closed");
    }

    pub(crate) fn after_commit(&self, snapshot: Snapshot) {
        let interval = self.options.auto_checkpoint_interval;
        if interval > 0 && snapshot.as_u64() % interval == 0 {
            self.request_checkpoint();
        }
    }

    fn request_checkpoint(&self) {
        if let Some(checkpointer) = self.checkpointer.lock().as_ref() {
            // A closed channel means the worker already exited with the
            // database.
            let _ = checkpointer.requests.send(());
        }
    }

    fn checkpoint(&self) -> CoreResult<CheckpointReport> {
        let _running = self.checkpointing.lock();
        let limit = self.bus.lock().min_connection_snapshot();
        let report = self.engine.checkpoint(limit)?;
        if let Some(dir) = &self.dir {
            let mut manifest = self.manifest.lock();
            if report.snapshot > manifest.checkpoint {
                manifest.checkpoint = report.snapshot;
                manifest.next_rowid = self.engine.next_rowid();
                dir.save_manifest(&manifest)?;
            }
        }
        self.stats.record_checkpoint();
        Ok(report)
    }
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let Some(checkpointer) = self.checkpointer.get_mut().take() else {
            return;
        };
        let Checkpointer { requests, worker } = checkpointer;
        drop(requests);
        // The worker may itself hold the last reference.
        if worker.thread().id() != thread::current().id() && worker.join().is_err() {
            tracing::warn!("checkpoint thread panicked");
        }
    }
}

/// Builder for opening a [`Database`].
///
/// ```rust,ignore
/// let db = Database::builder()
///     .path("notes.yapdb")
///     .options(DatabaseOptions::default().auto_checkpoint_interval(16))
///     .open()?;
/// ```
#[must_use]
pub struct DatabaseBuilder {
    path: Option<PathBuf>,
    options: DatabaseOptions,
    serialization: Serialization,
    observer: Option<Arc<dyn DiskActivityObserver>>,
}

impl DatabaseBuilder {
    fn new() -> Self {
        Self {
            path: None,
            options: DatabaseOptions::default(),
            serialization: Serialization::default(),
            observer: None,
        }
    }

    /// Directory of the database. Without one the database lives in memory.
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Database options.
    pub fn options(mut self, options: DatabaseOptions) -> Self {
        self.options = options;
        self
    }

    /// Serializers and sanitizers for objects and metadata.
    pub fn serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }

    /// Reports every read and write of the database files to `observer`.
    pub fn disk_observer(mut self, observer: Arc<dyn DiskActivityObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Opens the database, recovering committed state.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DatabaseLocked`] if another `Database` holds the
    /// directory, a corruption error when the files are damaged and the
    /// corrupt action is [`CorruptAction::Fail`], or an I/O error.
    pub fn open(self) -> CoreResult<Database> {
        match &self.path {
            Some(path) => {
                let dir = DatabaseDir::open(path, self.options.create_if_missing)?;
                let (manifest, engine) = self.load_or_recreate(&dir)?;
                Ok(self.assemble(Some(dir), manifest, engine))
            }
            None => {
                let files = EngineFiles {
                    wal: self.wrap(InMemoryBackend::new(), "wal"),
                    store: self.wrap(InMemoryBackend::new(), "store"),
                };
                let engine = StorageEngine::open(files, self.engine_options())?;
                Ok(self.assemble(None, Manifest::new(), engine))
            }
        }
    }

    fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            synchronous: self.options.synchronous,
            page_size: self.options.page_size,
        }
    }

    fn wrap<B: StorageBackend + 'static>(&self, backend: B, label: &str) -> Box<dyn StorageBackend> {
        match &self.observer {
            Some(observer) => Box::new(ObservedBackend::new(backend, label, Arc::clone(observer))),
            None => Box::new(backend),
        }
    }

    fn load_or_recreate(&self, dir: &DatabaseDir) -> CoreResult<(Manifest, Arc<StorageEngine>)> {
        match self.load(dir) {
            Ok(loaded) => Ok(loaded),
            Err(err) if err.is_corruption() && self.options.corrupt_action != CorruptAction::Fail => {
                tracing::warn!(
                    path = %dir.path().display(),
                    error = %err,
                    action = ?self.options.corrupt_action,
                    "database is corrupt; recreating it empty"
                );
                for moved in dir.discard_data_files(self.options.corrupt_action)? {
                    tracing::warn!(path = %moved.display(), "corrupt file kept");
                }
                self.load(dir)
            }
            Err(err) => Err(err),
        }
    }

    fn load(&self, dir: &DatabaseDir) -> CoreResult<(Manifest, Arc<StorageEngine>)> {
        let manifest = match dir.load_manifest()? {
            Some(manifest) => manifest,
            None => {
                let manifest = Manifest::new();
                dir.save_manifest(&manifest)?;
                manifest
            }
        };
        let files = EngineFiles {
            wal: self.wrap(FileBackend::open_with_create_dirs(&dir.wal_path())?, "wal"),
            store: self.wrap(FileBackend::open_with_create_dirs(&dir.store_path())?, "store"),
        };
        let engine = StorageEngine::open(files, self.engine_options())?;
        if manifest.checkpoint > engine.checkpointed_snapshot() {
            return Err(CoreError::store_corruption(format!(
                "manifest records checkpoint {} but the main store holds {}",
                manifest.checkpoint,
                engine.checkpointed_snapshot()
            )));
        }
        Ok((manifest, engine))
    }

    fn assemble(
        self,
        dir: Option<DatabaseDir>,
        manifest: Manifest,
        engine: Arc<StorageEngine>,
    ) -> Database {
        let options = self.options;
        let snapshot = engine.latest_snapshot();
        let pool = HandlePool::new(
            Arc::clone(&engine),
            options.max_connection_pool_count,
            options.connection_pool_lifetime,
        );
        if options.mmap_size > 0 {
            tracing::debug!(mmap_size = options.mmap_size, "mmap size is advisory for this engine");
        }
        tracing::debug!(
            path = ?self.path,
            database_id = %manifest.database_id,
            snapshot = snapshot.as_u64(),
            "database opened"
        );
        let inner = Arc::new_cyclic(|weak| DatabaseInner {
            serialization: self.serialization,
            pool,
            write_slot: Mutex::new(()),
            notifications: NotificationCenter::new(options.notification_history),
            stats: DatabaseStats::new(),
            path: self.path,
            dir,
            manifest: Mutex::new(manifest),
            bus: Mutex::new(SnapshotBus::new(
                snapshot,
                options.max_replay_changesets,
                options.multiprocess,
            )),
            checkpointing: Mutex::new(()),
            checkpointer: Mutex::new(Checkpointer::spawn(weak.clone())),
            engine,
            options,
        });
        Database { inner }
    }
}

/// An open database.
///
/// Cheap to clone; every clone refers to the same database. The database
/// closes when the last clone is dropped. Connections hold only a weak
/// reference and fail with [`CoreError::DatabaseClosed`] afterwards.
///
/// ```rust,ignore
/// let db = Database::open("notes.yapdb", DatabaseOptions::default())?;
/// let conn = db.new_connection();
/// conn.read_write(|txn| txn.set_object("1", "notes", "hello".into()))?;
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .field("snapshot", &self.snapshot())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Starts configuring a database.
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// Opens or creates the database in the directory `path`.
    ///
    /// # Errors
    ///
    /// See [`DatabaseBuilder::open`].
    pub fn open(path: impl AsRef<Path>, options: DatabaseOptions) -> CoreResult<Self> {
        Self::builder().path(path).options(options).open()
    }

    /// Opens an empty database that lives in memory.
    ///
    /// # Errors
    ///
    /// See [`DatabaseBuilder::open`].
    pub fn open_in_memory(options: DatabaseOptions) -> CoreResult<Self> {
        Self::builder().options(options).open()
    }

    pub(crate) fn from_inner(inner: Arc<DatabaseInner>) -> Self {
        Self { inner }
    }

    /// Directory of the database, `None` in memory.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Options the database was opened with.
    #[must_use]
    pub fn options(&self) -> &DatabaseOptions {
        &self.inner.options
    }

    /// The manifest as of the last checkpoint.
    #[must_use]
    pub fn manifest(&self) -> Manifest {
        self.inner.manifest.lock().clone()
    }

    /// The storage engine underneath.
    #[must_use]
    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.inner.engine
    }

    /// Most recent committed snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.inner.bus.lock().snapshot()
    }

    /// Opens a connection with the default cache configuration.
    #[must_use]
    pub fn new_connection(&self) -> Connection {
        self.new_connection_with(self.inner.options.connection_defaults)
    }

    /// Opens a connection with `config`.
    #[must_use]
    pub fn new_connection_with(&self, config: ConnectionConfig) -> Connection {
        let id = ConnectionId::new();
        let (snapshot, extensions) = self.inner.bus.lock().add_connection(id);
        tracing::trace!(connection = %id, %snapshot, "connection opened");
        Connection::new(id, &self.inner, snapshot, extensions, config)
    }

    /// Live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.bus.lock().connection_count()
    }

    /// Registers `extension` under `name`, creating its tables in a
    /// read-write transaction. Registering the same class again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ExtensionRegistration`] for an empty or taken
    /// name, a missing dependency or an unsupported configuration, or the
    /// extension's own error from creating its tables.
    pub fn register_extension(&self, name: &str, extension: Arc<dyn Extension>) -> CoreResult<()> {
        let conn = self.new_connection();
        let added = conn.read_write(|txn| {
            let added = txn.register_extension(name, extension)?;
            if !added {
                txn.rollback();
            }
            Ok(added)
        })?;
        if added {
            self.inner.stats.record_extension_registration();
        }
        Ok(())
    }

    /// Unregisters `name` and every extension depending on it, dropping
    /// their tables.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ExtensionNotFound`] if `name` is neither
    /// registered nor persisted.
    pub fn unregister_extension(&self, name: &str) -> CoreResult<()> {
        let conn = self.new_connection();
        conn.read_write(|txn| txn.unregister_extension(name))
    }

    /// Registers `extension` on a background thread and calls `completion`
    /// with the outcome of [`Self::register_extension`].
    pub fn async_register_extension<F>(
        &self,
        name: &str,
        extension: Arc<dyn Extension>,
        completion: F,
    ) where
        F: FnOnce(CoreResult<()>) + Send + 'static,
    {
        let db = self.clone();
        let name = name.to_string();
        run_in_background(
            "yapdb-register",
            move || db.register_extension(&name, extension),
            completion,
        );
    }

    /// Unregisters `name` on a background thread and calls `completion` with
    /// the outcome of [`Self::unregister_extension`].
    pub fn async_unregister_extension<F>(&self, name: &str, completion: F)
    where
        F: FnOnce(CoreResult<()>) + Send + 'static,
    {
        let db = self.clone();
        let name = name.to_string();
        run_in_background(
            "yapdb-unregister",
            move || db.unregister_extension(&name),
            completion,
        );
    }

    /// The extension registered under `name`.
    #[must_use]
    pub fn registered_extension(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.inner.bus.lock().extensions().get(name).cloned()
    }

    /// Names of the registered extensions, in registration order.
    #[must_use]
    pub fn registered_extension_names(&self) -> Vec<String> {
        self.inner.bus.lock().extensions().names()
    }

    /// Names of the extensions persisted in the database, including ones a
    /// previous process registered and this one has not.
    #[must_use]
    pub fn previously_registered_extension_names(&self) -> Vec<String> {
        let mut handle = self.inner.pool.checkout();
        let names = {
            let rows = handle.begin_read();
            persisted_extension_names(&rows)
        };
        self.inner.pool.checkin(handle);
        names
    }

    /// Receives a notification for every commit from now on.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<ModifiedNotification> {
        self.inner.notifications.subscribe()
    }

    /// Up to `limit` retained notifications newer than `cursor`.
    #[must_use]
    pub fn poll(&self, cursor: Snapshot, limit: usize) -> Vec<ModifiedNotification> {
        self.inner.notifications.poll(cursor, limit)
    }

    /// Folds the write-ahead log into the main store, as far as every live
    /// connection has caught up, and persists the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the store, the WAL or the manifest cannot be
    /// written.
    pub fn checkpoint(&self) -> CoreResult<CheckpointReport> {
        self.inner.checkpoint()
    }

    /// Asks the background thread for a checkpoint and returns immediately.
    pub fn async_checkpoint(&self) {
        self.inner.request_checkpoint();
    }

    /// Database-wide counters.
    #[must_use]
    pub fn stats(&self) -> &DatabaseStats {
        &self.inner.stats
    }

    /// Engine handle pool counters.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{IndexBlock, IndexValue, SecondaryIndex};
    use ciborium::value::Value;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn memory() -> Database {
        Database::open_in_memory(DatabaseOptions::default()).unwrap()
    }

    #[test]
    fn open_in_memory_starts_empty() {
        let db = memory();
        assert_eq!(db.snapshot(), Snapshot::ZERO);
        assert!(db.path().is_none());
        assert_eq!(db.connection_count(), 0);
    }

    #[test]
    fn committed_rows_survive_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");
        {
            let db = Database::open(&path, DatabaseOptions::default()).unwrap();
            let conn = db.new_connection();
            conn.read_write(|txn| txn.set_object("1", "notes", Value::from("hello")))
                .unwrap();
        }
        let db = Database::open(&path, DatabaseOptions::default()).unwrap();
        assert_eq!(db.snapshot(), Snapshot::new(1));
        let conn = db.new_connection();
        let note = conn.read(|txn| txn.object("1", "notes")).unwrap();
        assert_eq!(note, Some(Value::from("hello")));
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let _db = Database::open(temp.path(), DatabaseOptions::default()).unwrap();
        let second = Database::open(temp.path(), DatabaseOptions::default());
        assert!(matches!(second, Err(CoreError::DatabaseLocked)));
    }

    #[test]
    fn missing_directory_without_create_fails() {
        let temp = tempdir().unwrap();
        let options = DatabaseOptions::default().create_if_missing(false);
        assert!(Database::open(temp.path().join("absent"), options).is_err());
    }

    #[test]
    fn corrupt_manifest_fails_by_default() {
        let temp = tempdir().unwrap();
        drop(Database::open(temp.path(), DatabaseOptions::default()).unwrap());
        fs::write(temp.path().join("MANIFEST"), b"garbage!").unwrap();
        let err = Database::open(temp.path(), DatabaseOptions::default()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn corrupt_database_is_renamed_and_recreated() {
        let temp = tempdir().unwrap();
        {
            let db = Database::open(temp.path(), DatabaseOptions::default()).unwrap();
            db.new_connection()
                .read_write(|txn| txn.set_object("k", "c", Value::from(1)))
                .unwrap();
        }
        fs::write(temp.path().join("MANIFEST"), b"garbage!").unwrap();

        let options = DatabaseOptions::default().corrupt_action(CorruptAction::Rename);
        let db = Database::open(temp.path(), options).unwrap();
        assert_eq!(db.snapshot(), Snapshot::ZERO);
        let kept = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt."))
            .count();
        assert!(kept >= 2);
    }

    #[test]
    fn connections_outliving_the_database_fail_cleanly() {
        let db = memory();
        let conn = db.new_connection();
        drop(db);
        let result = conn.read(|txn| Ok(txn.snapshot()));
        assert!(matches!(result, Err(CoreError::DatabaseClosed)));
        assert!(conn.database().is_none());
    }

    #[test]
    fn checkpoint_persists_the_manifest() {
        let temp = tempdir().unwrap();
        let db = Database::open(temp.path(), DatabaseOptions::default()).unwrap();
        {
            let conn = db.new_connection();
            for i in 0..3 {
                conn.read_write(|txn| txn.set_object(&i.to_string(), "c", Value::from(i)))
                    .unwrap();
            }
        }
        let report = db.checkpoint().unwrap();
        assert_eq!(report.snapshot, Snapshot::new(3));
        assert_eq!(db.manifest().checkpoint, Snapshot::new(3));
        assert_eq!(db.stats().checkpoints(), 1);
        drop(db);

        let db = Database::open(temp.path(), DatabaseOptions::default()).unwrap();
        assert_eq!(db.manifest().checkpoint, Snapshot::new(3));
        assert_eq!(db.snapshot(), Snapshot::new(3));
    }

    #[test]
    fn checkpoint_waits_for_lagging_connections() {
        let db = memory();
        let lagging = db.new_connection();
        let writer = db.new_connection();
        writer
            .read_write(|txn| txn.set_object("k", "c", Value::from(1)))
            .unwrap();
        assert_eq!(db.checkpoint().unwrap().snapshot, Snapshot::ZERO);

        lagging.read(|_| Ok(())).unwrap();
        assert_eq!(db.checkpoint().unwrap().snapshot, Snapshot::new(1));
    }

    #[test]
    fn auto_checkpoint_runs_in_the_background() {
        let options = DatabaseOptions::default().auto_checkpoint_interval(2);
        let db = Database::open_in_memory(options).unwrap();
        let conn = db.new_connection();
        for i in 0..2 {
            conn.read_write(|txn| txn.set_object("k", "c", Value::from(i)))
                .unwrap();
        }
        let mut waited = Duration::ZERO;
        while db.stats().checkpoints() == 0 && waited < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        assert_eq!(db.engine().checkpointed_snapshot(), Snapshot::new(2));
    }

    #[test]
    fn subscribers_see_each_commit() {
        let db = memory();
        let events = db.subscribe();
        let conn = db.new_connection();
        conn.read_write(|txn| {
            txn.set_object("k", "c", Value::from(1))?;
            txn.set_custom_notification_object(Value::from("tag"));
            Ok(())
        })
        .unwrap();

        let event = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.snapshot, Snapshot::new(1));
        assert_eq!(event.origin, conn.id());
        assert_eq!(event.custom, Some(Value::from("tag")));
        assert!(event.changes.has_change_for_key("k", "c"));
        assert_eq!(db.poll(Snapshot::ZERO, 10).len(), 1);
    }

    #[test]
    fn persisted_extension_names_outlive_the_process() {
        let temp = tempdir().unwrap();
        {
            let db = Database::open(temp.path(), DatabaseOptions::default()).unwrap();
            let block: IndexBlock =
                Arc::new(|_c: &str, _k: &str, object: &Value, _m: Option<&Value>| {
                    object.as_integer().and_then(|i| i64::try_from(i).ok()).map(IndexValue::from)
                });
            db.register_extension("by_value", Arc::new(SecondaryIndex::new(block)))
                .unwrap();
            assert_eq!(db.registered_extension_names(), vec!["by_value".to_string()]);
        }
        let db = Database::open(temp.path(), DatabaseOptions::default()).unwrap();
        assert!(db.registered_extension_names().is_empty());
        assert_eq!(db.previously_registered_extension_names(), vec!["by_value".to_string()]);

        db.unregister_extension("by_value").unwrap();
        assert!(db.previously_registered_extension_names().is_empty());
        assert!(matches!(
            db.unregister_extension("by_value"),
            Err(CoreError::ExtensionNotFound { .. })
        ));
    }

    #[test]
    fn async_registration_reports_through_its_completion() {
        let db = memory();
        let block: IndexBlock = Arc::new(|_c: &str, _k: &str, object: &Value, _m: Option<&Value>| {
            object.as_text().map(IndexValue::from)
        });
        let (done, outcome) = mpsc::channel();

        let tx = done.clone();
        db.async_register_extension("by_text", Arc::new(SecondaryIndex::new(block)), move |r| {
            tx.send(r.is_ok()).unwrap();
        });
        assert!(outcome.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(db.registered_extension_names(), vec!["by_text".to_string()]);

        let tx = done.clone();
        db.async_unregister_extension("by_text", move |r| tx.send(r.is_ok()).unwrap());
        assert!(outcome.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(db.registered_extension_names().is_empty());

        db.async_unregister_extension("by_text", move |r| {
            done.send(matches!(r, Err(CoreError::ExtensionNotFound { .. }))).unwrap();
        });
        assert!(outcome.recv_timeout(Duration::from_secs(5)).unwrap());
    }
}
