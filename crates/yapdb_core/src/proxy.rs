//! Buffered key/value access with relaxed durability.
//!
//! A [`ConnectionProxy`] answers reads from its own pending writes first and
//! from a read connection otherwise. Writes land in memory and return
//! immediately; a background thread commits them in batches through a
//! dedicated write connection.
//!
//! A value set through a proxy is visible through that proxy at once, but is
//! durable only after the batch holding it committed. [`ConnectionProxy::flush`]
//! waits for that. [`ConnectionProxy::abort_and_reset`] forgets every write
//! not yet handed to the background thread.
//!
//! ```rust,ignore
//! let proxy = ConnectionProxy::new(&db)?;
//! proxy.set_object("draft", "ui", "hello".into());
//! assert_eq!(proxy.object("draft", "ui")?, Some("hello".into()));
//! proxy.flush()?;
//! ```

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::types::CollectionKey;
use ciborium::value::Value;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum PendingRow {
    Set {
        object: Value,
        metadata: Option<Value>,
    },
    /// Metadata replaced on a row the proxy has not set itself.
    ReplaceMetadata(Option<Value>),
    Removed,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    row: PendingRow,
    seq: u64,
}

#[derive(Default)]
struct PendingWrites {
    rows: BTreeMap<CollectionKey, PendingEntry>,
    next_seq: u64,
    scheduled: bool,
}

enum Command {
    Scheduled,
    Flush(Sender<CoreResult<()>>),
    Shutdown,
}

struct ProxyShared {
    read: Connection,
    write: Connection,
    pending: Mutex<PendingWrites>,
    batch_delay: Mutex<Duration>,
}

impl ProxyShared {
    /// Commits everything pending, then forgets the entries that were not
    /// overwritten meanwhile.
    fn write_batch(&self) -> CoreResult<()> {
        let batch = {
            let mut pending = self.pending.lock();
            pending.scheduled = false;
            pending.rows.clone()
        };
        if batch.is_empty() {
            return Ok(());
        }

        self.write.read_write(|txn| {
            for (key, entry) in &batch {
                match &entry.row {
                    PendingRow::Set { object, metadata } => txn.set_object_with_metadata(
                        &key.key,
                        &key.collection,
                        object.clone(),
                        metadata.clone(),
                    )?,
                    PendingRow::ReplaceMetadata(metadata) => {
                        txn.replace_metadata(&key.key, &key.collection, metadata.clone())?;
                    }
                    PendingRow::Removed => txn.remove_object(&key.key, &key.collection)?,
                }
            }
            Ok(())
        })?;

        let mut pending = self.pending.lock();
        pending.rows.retain(|key, entry| {
            batch
                .get(key)
                .map_or(true, |written| written.seq != entry.seq)
        });
        tracing::trace!(rows = batch.len(), left = pending.rows.len(), "proxy batch committed");
        Ok(())
    }

    fn write_batch_logged(&self) {
        if let Err(err) = self.write_batch() {
            tracing::warn!(error = %err, "proxy batch failed; writes stay pending");
        }
    }
}

fn run_flusher(shared: &ProxyShared, inbox: &Receiver<Command>) {
    while let Ok(command) = inbox.recv() {
        match command {
            Command::Scheduled => {
                let delay = *shared.batch_delay.lock();
                match inbox.recv_timeout(delay) {
                    Ok(Command::Flush(ack)) => {
                        let _ = ack.send(shared.write_batch());
                    }
                    Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        shared.write_batch_logged();
                        return;
                    }
                    Ok(Command::Scheduled) | Err(RecvTimeoutError::Timeout) => {
                        shared.write_batch_logged();
                    }
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(shared.write_batch());
            }
            Command::Shutdown => {
                shared.write_batch_logged();
                return;
            }
        }
    }
}

/// Dictionary-style access over one read and one write connection, with
/// writes buffered in memory and committed in the background.
pub struct ConnectionProxy {
    shared: Arc<ProxyShared>,
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ConnectionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProxy")
            .field("pending", &self.pending_count())
            .field("batch_delay", &self.batch_delay())
            .finish_non_exhaustive()
    }
}

impl ConnectionProxy {
    /// Opens a proxy with two fresh connections to `db`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the flusher thread cannot be started.
    pub fn new(db: &Database) -> CoreResult<Self> {
        let write_config = ConnectionConfig::default()
            .object_cache_enabled(false)
            .metadata_cache_enabled(false);
        Self::with_connections(db.new_connection(), db.new_connection_with(write_config))
    }

    /// Builds a proxy over existing connections.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the flusher thread cannot be started.
    pub fn with_connections(read: Connection, write: Connection) -> CoreResult<Self> {
        let shared = Arc::new(ProxyShared {
            read,
            write,
            pending: Mutex::new(PendingWrites::default()),
            batch_delay: Mutex::new(Duration::ZERO),
        });
        let (commands, inbox) = mpsc::channel();
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("yapdb-proxy-flush".into())
                .spawn(move || run_flusher(&shared, &inbox))?
        };
        Ok(Self {
            shared,
            commands,
            worker: Some(worker),
        })
    }

    /// How long the flusher waits after the first buffered write before
    /// committing, to gather more writes into the batch.
    #[must_use]
    pub fn batch_delay(&self) -> Duration {
        *self.shared.batch_delay.lock()
    }

    /// Sets the batch delay.
    pub fn set_batch_delay(&self, delay: Duration) {
        *self.shared.batch_delay.lock() = delay;
    }

    /// Number of rows with writes not yet committed.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().rows.len()
    }

    /// The object at `key`, including buffered writes.
    ///
    /// # Errors
    ///
    /// Returns the read connection's error.
    pub fn object(&self, key: &str, collection: &str) -> CoreResult<Option<Value>> {
        let address = CollectionKey::new(collection, key);
        match self.shared.pending.lock().rows.get(&address).map(|e| &e.row) {
            Some(PendingRow::Set { object, .. }) => return Ok(Some(object.clone())),
            Some(PendingRow::Removed) => return Ok(None),
            Some(PendingRow::ReplaceMetadata(_)) | None => {}
        }
        self.shared.read.read(|txn| txn.object(key, collection))
    }

    /// The metadata at `key`, including buffered writes.
    ///
    /// # Errors
    ///
    /// Returns the read connection's error.
    pub fn metadata(&self, key: &str, collection: &str) -> CoreResult<Option<Value>> {
        let address = CollectionKey::new(collection, key);
        match self.shared.pending.lock().rows.get(&address).map(|e| &e.row) {
            Some(PendingRow::Set { metadata, .. } | PendingRow::ReplaceMetadata(metadata)) => {
                return Ok(metadata.clone());
            }
            Some(PendingRow::Removed) => return Ok(None),
            None => {}
        }
        self.shared.read.read(|txn| txn.metadata(key, collection))
    }

    fn buffer(&self, address: CollectionKey, update: impl FnOnce(Option<&PendingRow>) -> Option<PendingRow>) {
        let schedule = {
            let mut pending = self.shared.pending.lock();
            let Some(row) = update(pending.rows.get(&address).map(|e| &e.row)) else {
                return;
            };
            pending.next_seq += 1;
            let seq = pending.next_seq;
            pending.rows.insert(address, PendingEntry { row, seq });
            !std::mem::replace(&mut pending.scheduled, true)
        };
        if schedule {
            // The flusher is gone only while the proxy is dropped.
            let _ = self.commands.send(Command::Scheduled);
        }
    }

    /// Buffers an object write, clearing the row's metadata.
    pub fn set_object(&self, key: &str, collection: &str, object: Value) {
        self.set_object_with_metadata(key, collection, object, None);
    }

    /// Buffers an object and metadata write.
    pub fn set_object_with_metadata(
        &self,
        key: &str,
        collection: &str,
        object: Value,
        metadata: Option<Value>,
    ) {
        self.buffer(CollectionKey::new(collection, key), |_| {
            Some(PendingRow::Set { object, metadata })
        });
    }

    /// Buffers a metadata replacement. Has no effect on a row that does not
    /// exist when the batch commits.
    pub fn set_metadata(&self, key: &str, collection: &str, metadata: Option<Value>) {
        self.buffer(CollectionKey::new(collection, key), |existing| match existing {
            Some(PendingRow::Set { object, .. }) => Some(PendingRow::Set {
                object: object.clone(),
                metadata,
            }),
            Some(PendingRow::Removed) => None,
            Some(PendingRow::ReplaceMetadata(_)) | None => {
                Some(PendingRow::ReplaceMetadata(metadata))
            }
        });
    }

    /// Buffers a removal.
    pub fn remove(&self, key: &str, collection: &str) {
        self.buffer(CollectionKey::new(collection, key), |_| Some(PendingRow::Removed));
    }

    /// Forgets every buffered write not yet handed to the flusher.
    pub fn abort_and_reset(&self) {
        let mut pending = self.shared.pending.lock();
        let dropped = pending.rows.len();
        pending.rows.clear();
        tracing::debug!(dropped, "proxy writes discarded");
    }

    /// Commits every buffered write and waits until it is durable.
    ///
    /// # Errors
    ///
    /// Returns the commit error; the writes stay buffered.
    pub fn flush(&self) -> CoreResult<()> {
        let (ack, done) = mpsc::channel();
        self.commands
            .send(Command::Flush(ack))
            .map_err(|_| CoreError::invalid_operation("proxy flusher has stopped"))?;
        done.recv()
            .map_err(|_| CoreError::invalid_operation("proxy flusher has stopped"))?
    }
}

impl Drop for ConnectionProxy {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("proxy flusher panicked");
            }
        }
    }
}
