//! An extension that records every hook call it receives.
//!
//! Used to check the order and arguments of extension callbacks. Each
//! connection half gets a sequence number so that events from sibling
//! connections can be told apart. The extension also keeps one row per live
//! main-table row in its `log` table, which makes it a disk-writing
//! extension for registration and rollback tests.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use yapdb_core::{
    CollectionKey, CoreChangeset, CoreResult, Extension, ExtensionConnection,
    ExtensionTransaction, RowId, Snapshot, Value, WriteTables,
};

const LOG: &str = "log";

/// One recorded callback.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    /// `create_if_needed` ran.
    Created,
    /// A transaction started.
    Begin {
        /// Snapshot the transaction reads.
        snapshot: Snapshot,
        /// Whether it is a read-write transaction.
        writable: bool,
    },
    /// `handle_insert_object`
    Insert(CollectionKey),
    /// `handle_update_object`
    Update(CollectionKey),
    /// `handle_replace_object`
    ReplaceObject(CollectionKey),
    /// `handle_replace_metadata`
    ReplaceMetadata(CollectionKey),
    /// `handle_touch_object`
    TouchObject(CollectionKey),
    /// `handle_touch_metadata`
    TouchMetadata(CollectionKey),
    /// `handle_remove_object`
    Remove(CollectionKey),
    /// `handle_remove_objects`
    RemoveMany {
        /// Collection of the removed rows.
        collection: String,
        /// Removed keys.
        keys: Vec<String>,
    },
    /// `handle_remove_all`
    RemoveAll,
    /// `flush_pending_changes_to_main_table`
    Flush,
    /// `finish_transaction`
    Finish,
    /// `post_commit`
    Committed(Snapshot),
    /// `post_rollback`
    RolledBack,
    /// `process_changeset`, with the number of mutations the sibling
    /// reported in its internal payload.
    Processed(Option<u64>),
    /// `invalidate`
    Invalidated,
}

impl HookEvent {
    /// Whether the event is a per-row mutation hook.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Insert(_)
                | Self::Update(_)
                | Self::ReplaceObject(_)
                | Self::ReplaceMetadata(_)
                | Self::TouchObject(_)
                | Self::TouchMetadata(_)
                | Self::Remove(_)
                | Self::RemoveMany { .. }
                | Self::RemoveAll
        )
    }
}

/// Shared, ordered log of `(connection sequence, event)` pairs.
#[derive(Debug, Clone, Default)]
pub struct HookLog(Arc<Mutex<Vec<(usize, HookEvent)>>>);

impl HookLog {
    fn push(&self, connection: usize, event: HookEvent) {
        self.0.lock().push((connection, event));
    }

    /// Every event so far.
    #[must_use]
    pub fn events(&self) -> Vec<(usize, HookEvent)> {
        self.0.lock().clone()
    }

    /// Events of one connection half, without the sequence number.
    #[must_use]
    pub fn events_of(&self, connection: usize) -> Vec<HookEvent> {
        self.0
            .lock()
            .iter()
            .filter(|(c, _)| *c == connection)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Removes and returns every event.
    pub fn take(&self) -> Vec<(usize, HookEvent)> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// The recording extension descriptor.
#[derive(Debug, Default)]
pub struct RecordingExtension {
    log: HookLog,
    connections: AtomicUsize,
    fail_on: Option<CollectionKey>,
}

impl RecordingExtension {
    /// Creates an extension writing to `log`.
    #[must_use]
    pub fn new(log: HookLog) -> Self {
        Self {
            log,
            connections: AtomicUsize::new(0),
            fail_on: None,
        }
    }

    /// Makes every hook touching `key` fail, which aborts the transaction.
    #[must_use]
    pub fn failing_on(mut self, key: CollectionKey) -> Self {
        self.fail_on = Some(key);
        self
    }
}

impl Extension for RecordingExtension {
    fn class_name(&self) -> &'static str {
        "RecordingExtension"
    }

    fn table_suffixes(&self) -> Vec<String> {
        vec![LOG.to_string()]
    }

    fn create_if_needed(&self, tables: &mut WriteTables<'_>) -> CoreResult<()> {
        self.log.push(0, HookEvent::Created);
        if !tables.read().table_exists(LOG) {
            tables.create_table(LOG);
            let keys = tables.read().main_keys();
            for key in keys {
                tables.put(LOG, &key.collection, &key.key, Vec::new());
            }
        }
        Ok(())
    }

    fn new_connection(self: Arc<Self>, _name: &str) -> Box<dyn ExtensionConnection> {
        let sequence = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        Box::new(RecordingConnection {
            log: self.log.clone(),
            sequence,
            fail_on: self.fail_on.clone(),
            pending: 0,
        })
    }
}

/// Per-connection half of [`RecordingExtension`].
#[derive(Debug)]
pub struct RecordingConnection {
    log: HookLog,
    sequence: usize,
    fail_on: Option<CollectionKey>,
    pending: u64,
}

impl ExtensionConnection for RecordingConnection {
    fn new_transaction(&mut self, snapshot: Snapshot, writable: bool) -> Box<dyn ExtensionTransaction> {
        self.log
            .push(self.sequence, HookEvent::Begin { snapshot, writable });
        Box::new(RecordingTransaction {
            log: self.log.clone(),
            sequence: self.sequence,
            fail_on: self.fail_on.clone(),
            mutations: 0,
        })
    }

    fn finish_transaction(&mut self, transaction: Box<dyn ExtensionTransaction>) {
        self.log.push(self.sequence, HookEvent::Finish);
        if let Ok(transaction) = transaction.into_any().downcast::<RecordingTransaction>() {
            self.pending = transaction.mutations;
        }
    }

    fn internal_changeset(&mut self) -> Option<Value> {
        (self.pending > 0).then(|| Value::from(self.pending))
    }

    fn external_changeset(&mut self) -> Option<Value> {
        (self.pending > 0).then(|| Value::from(self.pending))
    }

    fn has_disk_changes(&self) -> bool {
        self.pending > 0
    }

    fn post_commit(&mut self, snapshot: Snapshot) {
        self.pending = 0;
        self.log.push(self.sequence, HookEvent::Committed(snapshot));
    }

    fn post_rollback(&mut self) {
        self.pending = 0;
        self.log.push(self.sequence, HookEvent::RolledBack);
    }

    fn process_changeset(&mut self, internal: Option<&Value>, _core: &CoreChangeset) {
        let count = internal
            .and_then(|v| v.as_integer())
            .and_then(|i| u64::try_from(i).ok());
        self.log.push(self.sequence, HookEvent::Processed(count));
    }

    fn invalidate(&mut self) {
        self.log.push(self.sequence, HookEvent::Invalidated);
    }
}

/// Per-transaction half of [`RecordingExtension`].
#[derive(Debug)]
pub struct RecordingTransaction {
    log: HookLog,
    sequence: usize,
    fail_on: Option<CollectionKey>,
    mutations: u64,
}

impl RecordingTransaction {
    /// Mutation hooks received so far.
    #[must_use]
    pub fn mutations(&self) -> u64 {
        self.mutations
    }

    fn record(&mut self, event: HookEvent, key: Option<&CollectionKey>) -> CoreResult<()> {
        if let (Some(failing), Some(key)) = (&self.fail_on, key) {
            if failing == key {
                return Err(yapdb_core::CoreError::extension_failure(
                    "recording",
                    format!("refusing {}/{}", key.collection, key.key),
                ));
            }
        }
        self.mutations += 1;
        self.log.push(self.sequence, event);
        Ok(())
    }
}

impl ExtensionTransaction for RecordingTransaction {
    fn handle_insert_object(
        &mut self,
        tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        _rowid: RowId,
        _object: &Value,
        _metadata: Option<&Value>,
    ) -> CoreResult<()> {
        self.record(HookEvent::Insert(key.clone()), Some(key))?;
        tables.put(LOG, &key.collection, &key.key, Vec::new());
        Ok(())
    }

    fn handle_update_object(
        &mut self,
        _tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        _rowid: RowId,
        _object: &Value,
        _metadata: Option<&Value>,
    ) -> CoreResult<()> {
        self.record(HookEvent::Update(key.clone()), Some(key))
    }

    fn handle_replace_object(
        &mut self,
        _tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        _rowid: RowId,
        _object: &Value,
    ) -> CoreResult<()> {
        self.record(HookEvent::ReplaceObject(key.clone()), Some(key))
    }

    fn handle_replace_metadata(
        &mut self,
        _tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        _rowid: RowId,
        _metadata: Option<&Value>,
    ) -> CoreResult<()> {
        self.record(HookEvent::ReplaceMetadata(key.clone()), Some(key))
    }

    fn handle_touch_object(
        &mut self,
        _tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        _rowid: RowId,
    ) -> CoreResult<()> {
        self.record(HookEvent::TouchObject(key.clone()), Some(key))
    }

    fn handle_touch_metadata(
        &mut self,
        _tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        _rowid: RowId,
    ) -> CoreResult<()> {
        self.record(HookEvent::TouchMetadata(key.clone()), Some(key))
    }

    fn handle_remove_object(
        &mut self,
        tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        _rowid: RowId,
    ) -> CoreResult<()> {
        self.record(HookEvent::Remove(key.clone()), Some(key))?;
        tables.delete(LOG, &key.collection, &key.key);
        Ok(())
    }

    fn handle_remove_objects(
        &mut self,
        tables: &mut WriteTables<'_>,
        collection: &str,
        keys: &[String],
        _rowids: &[RowId],
    ) -> CoreResult<()> {
        self.record(
            HookEvent::RemoveMany {
                collection: collection.to_string(),
                keys: keys.to_vec(),
            },
            None,
        )?;
        for key in keys {
            tables.delete(LOG, collection, key);
        }
        Ok(())
    }

    fn handle_remove_all(&mut self, tables: &mut WriteTables<'_>) -> CoreResult<()> {
        self.record(HookEvent::RemoveAll, None)?;
        tables.clear_table(LOG);
        Ok(())
    }

    fn flush_pending_changes_to_main_table(
        &mut self,
        _tables: &mut WriteTables<'_>,
    ) -> CoreResult<()> {
        self.log.push(self.sequence, HookEvent::Flush);
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
