//! Read and read-write transactions.
//!
//! A transaction is only reachable inside the closure given to
//! [`crate::Connection::read`] or [`crate::Connection::read_write`]; the
//! connection begins it before the closure runs and commits or rolls it back
//! after the closure returns.
//!
//! Reads consult the connection's caches first and fall back to the engine,
//! filling the caches on the way. Enumerations snapshot their key list before
//! visiting, so a key filter runs before any object or metadata is fetched.

mod state;
mod write;

pub(crate) use state::AbortReason;
use state::EnumerationGuard;

use crate::changeset::CoreChangeset;
use crate::connection::RowCaches;
use crate::database::DatabaseInner;
use crate::engine::{ReadTxn, RowRead, WriteTxn, MAIN_TABLE};
use crate::error::{CoreError, CoreResult};
use crate::extension::{ExtView, ExtensionMap, ExtensionTransaction, ReadTables};
use crate::serialization::from_value;
use crate::types::{CollectionKey, RowId, Snapshot};
use ciborium::value::Value;
use serde::de::DeserializeOwned;
use std::ops::ControlFlow;
use std::sync::Arc;

/// A read-only transaction.
pub type ReadTransaction<'c> = Transaction<'c, ReadTxn>;

/// A read-write transaction.
pub type ReadWriteTransaction<'c> = Transaction<'c, WriteTxn>;

/// Optional `(collection, key)` predicate run before a row is fetched.
pub type KeyFilter<'f> = Option<&'f mut dyn FnMut(&str, &str) -> bool>;

/// A transaction over engine rows `P`.
///
/// Write methods exist only on [`ReadWriteTransaction`].
pub struct Transaction<'c, P> {
    rows: P,
    db: &'c DatabaseInner,
    caches: &'c mut RowCaches,
    extensions: Arc<ExtensionMap>,
    ext_txns: Vec<(String, Box<dyn ExtensionTransaction>)>,
    enumerations: EnumerationGuard,
    changes: CoreChangeset,
    rollback_requested: bool,
    abort: Option<AbortReason>,
    custom: Option<Value>,
    pending_extensions: Option<Arc<ExtensionMap>>,
}

/// What the connection needs back once the body has returned.
pub(crate) struct Finished<P> {
    pub rows: P,
    pub ext_txns: Vec<(String, Box<dyn ExtensionTransaction>)>,
    pub changes: CoreChangeset,
    pub rollback_requested: bool,
    pub abort: Option<AbortReason>,
    pub custom: Option<Value>,
    pub pending_extensions: Option<Arc<ExtensionMap>>,
}

impl<'c, P: RowRead> Transaction<'c, P> {
    pub(crate) fn new(
        rows: P,
        db: &'c DatabaseInner,
        caches: &'c mut RowCaches,
        extensions: Arc<ExtensionMap>,
        ext_txns: Vec<(String, Box<dyn ExtensionTransaction>)>,
    ) -> Self {
        Self {
            rows,
            db,
            caches,
            extensions,
            ext_txns,
            enumerations: EnumerationGuard::default(),
            changes: CoreChangeset::new(),
            rollback_requested: false,
            abort: None,
            custom: None,
            pending_extensions: None,
        }
    }

    pub(crate) fn finish(self) -> Finished<P> {
        Finished {
            rows: self.rows,
            ext_txns: self.ext_txns,
            changes: self.changes,
            rollback_requested: self.rollback_requested,
            abort: self.abort,
            custom: self.custom,
            pending_extensions: self.pending_extensions,
        }
    }

    /// Snapshot the transaction reads. A read-write transaction reports the
    /// snapshot it started from; its commit produces the next one.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.rows.snapshot()
    }

    /// Names of the extensions visible to this transaction.
    #[must_use]
    pub fn extension_names(&self) -> Vec<String> {
        self.pending_extensions
            .as_ref()
            .unwrap_or(&self.extensions)
            .names()
    }

    // ------------------------------------------------------------------
    // Counts and listings
    // ------------------------------------------------------------------

    /// Number of non-empty collections.
    #[must_use]
    pub fn number_of_collections(&self) -> usize {
        self.rows.collections(MAIN_TABLE).len()
    }

    /// Number of keys in `collection`.
    #[must_use]
    pub fn number_of_keys_in_collection(&self, collection: &str) -> usize {
        self.rows.keys_in_collection(MAIN_TABLE, collection).len()
    }

    /// Number of rows in the database.
    #[must_use]
    pub fn number_of_keys_in_all_collections(&self) -> usize {
        self.rows.keys(MAIN_TABLE).len()
    }

    /// Non-empty collections, in order.
    #[must_use]
    pub fn all_collections(&self) -> Vec<String> {
        self.rows.collections(MAIN_TABLE)
    }

    /// Keys of `collection`, in order.
    #[must_use]
    pub fn all_keys_in_collection(&self, collection: &str) -> Vec<String> {
        self.rows.keys_in_collection(MAIN_TABLE, collection)
    }

    // ------------------------------------------------------------------
    // Point reads
    // ------------------------------------------------------------------

    /// Whether a row exists at `key` in `collection`.
    #[must_use]
    pub fn has_object(&self, key: &str, collection: &str) -> bool {
        let key = CollectionKey::new(collection, key);
        self.caches.has_object(&key) || self.rows.get(MAIN_TABLE, &key).is_some()
    }

    /// The object at `key` in `collection`.
    ///
    /// # Errors
    ///
    /// Returns the deserializer's error.
    pub fn object(&mut self, key: &str, collection: &str) -> CoreResult<Option<Value>> {
        self.fetch_object(&CollectionKey::new(collection, key))
    }

    /// The metadata at `key` in `collection`.
    ///
    /// # Errors
    ///
    /// Returns the deserializer's error.
    pub fn metadata(&mut self, key: &str, collection: &str) -> CoreResult<Option<Value>> {
        self.fetch_metadata(&CollectionKey::new(collection, key))
    }

    /// Object and metadata of one row, or `None` if the row does not exist.
    ///
    /// # Errors
    ///
    /// Returns the deserializer's error.
    pub fn object_and_metadata(
        &mut self,
        key: &str,
        collection: &str,
    ) -> CoreResult<Option<(Value, Option<Value>)>> {
        let key = CollectionKey::new(collection, key);
        match self.fetch_object(&key)? {
            Some(object) => Ok(Some((object, self.fetch_metadata(&key)?))),
            None => Ok(None),
        }
    }

    /// The object at `key` converted to `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be deserialized into `T`.
    pub fn object_typed<T: DeserializeOwned>(
        &mut self,
        key: &str,
        collection: &str,
    ) -> CoreResult<Option<T>> {
        self.object(key, collection)?
            .map(|value| from_value(collection, key, &value))
            .transpose()
    }

    /// Stored bytes of the object, bypassing the deserializer and caches.
    #[must_use]
    pub fn serialized_object(&self, key: &str, collection: &str) -> Option<Vec<u8>> {
        self.rows
            .get(MAIN_TABLE, &CollectionKey::new(collection, key))
            .map(|row| row.data.clone())
    }

    /// Stored bytes of the metadata, bypassing the deserializer and caches.
    #[must_use]
    pub fn serialized_metadata(&self, key: &str, collection: &str) -> Option<Vec<u8>> {
        self.rows
            .get(MAIN_TABLE, &CollectionKey::new(collection, key))
            .and_then(|row| row.metadata.clone())
    }

    /// Rowid of a row.
    #[must_use]
    pub fn rowid_for_key(&self, key: &str, collection: &str) -> Option<RowId> {
        self.rows
            .get(MAIN_TABLE, &CollectionKey::new(collection, key))
            .map(|row| row.rowid)
    }

    /// Address of a rowid.
    pub fn collection_key_for_rowid(&mut self, rowid: RowId) -> Option<CollectionKey> {
        if let Some(key) = self.caches.key_for_rowid(rowid) {
            return Some(key);
        }
        let (key, _) = self.rows.get_by_rowid(MAIN_TABLE, rowid)?;
        self.caches.fill_key(rowid, &key);
        Some(key)
    }

    fn fetch_object(&mut self, key: &CollectionKey) -> CoreResult<Option<Value>> {
        if let Some(object) = self.caches.object(key) {
            return Ok(Some(object));
        }
        let Some(row) = self.rows.get(MAIN_TABLE, key) else {
            return Ok(None);
        };
        let object = self
            .db
            .serialization
            .object
            .decode(&key.collection, &key.key, &row.data)?;
        self.caches.fill_object(key, &object);
        self.caches.fill_key(row.rowid, key);
        Ok(Some(object))
    }

    fn fetch_metadata(&mut self, key: &CollectionKey) -> CoreResult<Option<Value>> {
        if let Some(metadata) = self.caches.metadata(key) {
            return Ok(metadata);
        }
        let Some(row) = self.rows.get(MAIN_TABLE, key) else {
            return Ok(None);
        };
        let metadata = row
            .metadata
            .as_deref()
            .map(|bytes| {
                self.db
                    .serialization
                    .metadata
                    .decode(&key.collection, &key.key, bytes)
            })
            .transpose()?;
        self.caches.fill_metadata(key, &metadata);
        Ok(metadata)
    }

    // ------------------------------------------------------------------
    // Enumeration
    // ------------------------------------------------------------------

    fn collection_keys(&self, collection: &str) -> Vec<CollectionKey> {
        self.rows
            .keys_in_collection(MAIN_TABLE, collection)
            .into_iter()
            .map(|key| CollectionKey::new(collection, key))
            .collect()
    }

    /// Visits `keys` under the mutation guard for `scope`.
    fn visit_keys<F>(
        &mut self,
        scope: Option<&str>,
        keys: Vec<CollectionKey>,
        mut filter: KeyFilter<'_>,
        mut visit: F,
    ) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &CollectionKey) -> CoreResult<ControlFlow<()>>,
    {
        self.enumerations.enter(scope);
        let mut result = Ok(());
        for key in &keys {
            if let Some(filter) = filter.as_deref_mut() {
                if !filter(&key.collection, &key.key) {
                    continue;
                }
            }
            match visit(self, key) {
                Ok(flow) => {
                    if let Some(reason) = &self.abort {
                        result = Err(reason.to_error());
                        break;
                    }
                    if flow.is_break() {
                        break;
                    }
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        self.enumerations.exit();
        result
    }

    /// Visits every non-empty collection.
    ///
    /// # Errors
    ///
    /// Returns the first error from `f`, or the mutation-during-enumeration
    /// error if `f` mutated the database.
    pub fn enumerate_collections<F>(&mut self, mut f: F) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &str) -> CoreResult<ControlFlow<()>>,
    {
        let collections: Vec<CollectionKey> = self
            .all_collections()
            .into_iter()
            .map(|collection| CollectionKey::new(collection, ""))
            .collect();
        self.visit_keys(None, collections, None, |txn, key| {
            f(txn, &key.collection)
        })
    }

    /// Visits every collection holding a row at `key`.
    ///
    /// # Errors
    ///
    /// As [`Self::enumerate_collections`].
    pub fn enumerate_collections_for_key<F>(&mut self, key: &str, mut f: F) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &str) -> CoreResult<ControlFlow<()>>,
    {
        let addresses: Vec<CollectionKey> = self
            .all_collections()
            .into_iter()
            .map(|collection| CollectionKey::new(collection, key))
            .filter(|address| self.rows.get(MAIN_TABLE, address).is_some())
            .collect();
        self.visit_keys(None, addresses, None, |txn, address| {
            f(txn, &address.collection)
        })
    }

    /// Visits the keys of `collection`.
    ///
    /// # Errors
    ///
    /// Returns the first error from `f`, or the mutation-during-enumeration
    /// error if `f` mutated `collection`.
    pub fn enumerate_keys_in_collection<F>(&mut self, collection: &str, mut f: F) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &str) -> CoreResult<ControlFlow<()>>,
    {
        let keys = self.collection_keys(collection);
        self.visit_keys(Some(collection), keys, None, |txn, key| f(txn, &key.key))
    }

    /// Visits every `(collection, key)`.
    ///
    /// # Errors
    ///
    /// As [`Self::enumerate_keys_in_collection`], for any collection.
    pub fn enumerate_keys_in_all_collections<F>(&mut self, mut f: F) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &str, &str) -> CoreResult<ControlFlow<()>>,
    {
        let keys = self.rows.keys(MAIN_TABLE);
        self.visit_keys(None, keys, None, |txn, key| {
            f(txn, &key.collection, &key.key)
        })
    }

    /// Visits keys and objects of `collection`. `filter` runs before the
    /// object is fetched.
    ///
    /// # Errors
    ///
    /// As [`Self::enumerate_keys_in_collection`], plus deserializer errors.
    pub fn enumerate_keys_and_objects<F>(
        &mut self,
        collection: &str,
        filter: KeyFilter<'_>,
        mut f: F,
    ) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &str, &Value) -> CoreResult<ControlFlow<()>>,
    {
        let keys = self.collection_keys(collection);
        self.visit_keys(Some(collection), keys, filter, |txn, key| {
            match txn.fetch_object(key)? {
                Some(object) => f(txn, &key.key, &object),
                None => Ok(ControlFlow::Continue(())),
            }
        })
    }

    /// Visits every row's collection, key and object.
    ///
    /// # Errors
    ///
    /// As [`Self::enumerate_keys_and_objects`].
    pub fn enumerate_keys_and_objects_in_all_collections<F>(
        &mut self,
        filter: KeyFilter<'_>,
        mut f: F,
    ) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &str, &str, &Value) -> CoreResult<ControlFlow<()>>,
    {
        let keys = self.rows.keys(MAIN_TABLE);
        self.visit_keys(None, keys, filter, |txn, key| match txn.fetch_object(key)? {
            Some(object) => f(txn, &key.collection, &key.key, &object),
            None => Ok(ControlFlow::Continue(())),
        })
    }

    /// Visits keys and metadata of `collection`. `filter` runs before the
    /// metadata is fetched.
    ///
    /// # Errors
    ///
    /// As [`Self::enumerate_keys_and_objects`].
    pub fn enumerate_keys_and_metadata<F>(
        &mut self,
        collection: &str,
        filter: KeyFilter<'_>,
        mut f: F,
    ) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &str, Option<&Value>) -> CoreResult<ControlFlow<()>>,
    {
        let keys = self.collection_keys(collection);
        self.visit_keys(Some(collection), keys, filter, |txn, key| {
            let metadata = txn.fetch_metadata(key)?;
            f(txn, &key.key, metadata.as_ref())
        })
    }

    /// Visits every row's collection, key and metadata.
    ///
    /// # Errors
    ///
    /// As [`Self::enumerate_keys_and_objects`].
    pub fn enumerate_keys_and_metadata_in_all_collections<F>(
        &mut self,
        filter: KeyFilter<'_>,
        mut f: F,
    ) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &str, &str, Option<&Value>) -> CoreResult<ControlFlow<()>>,
    {
        let keys = self.rows.keys(MAIN_TABLE);
        self.visit_keys(None, keys, filter, |txn, key| {
            let metadata = txn.fetch_metadata(key)?;
            f(txn, &key.collection, &key.key, metadata.as_ref())
        })
    }

    /// Visits keys, objects and metadata of `collection`.
    ///
    /// # Errors
    ///
    /// As [`Self::enumerate_keys_and_objects`].
    pub fn enumerate_rows<F>(
        &mut self,
        collection: &str,
        filter: KeyFilter<'_>,
        mut f: F,
    ) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &str, &Value, Option<&Value>) -> CoreResult<ControlFlow<()>>,
    {
        let keys = self.collection_keys(collection);
        self.visit_keys(Some(collection), keys, filter, |txn, key| {
            let Some(object) = txn.fetch_object(key)? else {
                return Ok(ControlFlow::Continue(()));
            };
            let metadata = txn.fetch_metadata(key)?;
            f(txn, &key.key, &object, metadata.as_ref())
        })
    }

    /// Visits every row.
    ///
    /// # Errors
    ///
    /// As [`Self::enumerate_keys_and_objects`].
    pub fn enumerate_rows_in_all_collections<F>(
        &mut self,
        filter: KeyFilter<'_>,
        mut f: F,
    ) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &str, &str, &Value, Option<&Value>) -> CoreResult<ControlFlow<()>>,
    {
        let keys = self.rows.keys(MAIN_TABLE);
        self.visit_keys(None, keys, filter, |txn, key| {
            let Some(object) = txn.fetch_object(key)? else {
                return Ok(ControlFlow::Continue(()));
            };
            let metadata = txn.fetch_metadata(key)?;
            f(txn, &key.collection, &key.key, &object, metadata.as_ref())
        })
    }

    /// Fetches the objects of `keys` in `collection`, in the order given.
    /// Missing rows are reported as `None`.
    ///
    /// # Errors
    ///
    /// As [`Self::enumerate_keys_and_objects`].
    pub fn enumerate_objects_for_keys<I, S, F>(
        &mut self,
        keys: I,
        collection: &str,
        mut f: F,
    ) -> CoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(&mut Self, &str, Option<&Value>) -> CoreResult<ControlFlow<()>>,
    {
        let keys = keys
            .into_iter()
            .map(|key| CollectionKey::new(collection, key.as_ref()))
            .collect();
        self.visit_keys(Some(collection), keys, None, |txn, key| {
            let object = txn.fetch_object(key)?;
            f(txn, &key.key, object.as_ref())
        })
    }

    /// Fetches the metadata of `keys` in `collection`, in the order given.
    /// Missing rows and rows without metadata are both reported as `None`.
    ///
    /// # Errors
    ///
    /// As [`Self::enumerate_keys_and_objects`].
    pub fn enumerate_metadata_for_keys<I, S, F>(
        &mut self,
        keys: I,
        collection: &str,
        mut f: F,
    ) -> CoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(&mut Self, &str, Option<&Value>) -> CoreResult<ControlFlow<()>>,
    {
        let keys = keys
            .into_iter()
            .map(|key| CollectionKey::new(collection, key.as_ref()))
            .collect();
        self.visit_keys(Some(collection), keys, None, |txn, key| {
            let metadata = txn.fetch_metadata(key)?;
            f(txn, &key.key, metadata.as_ref())
        })
    }

    /// Fetches objects and metadata of `keys` in `collection`, in the order
    /// given. Missing rows are reported as `None`.
    ///
    /// # Errors
    ///
    /// As [`Self::enumerate_keys_and_objects`].
    pub fn enumerate_rows_for_keys<I, S, F>(
        &mut self,
        keys: I,
        collection: &str,
        mut f: F,
    ) -> CoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(&mut Self, &str, Option<(&Value, Option<&Value>)>) -> CoreResult<ControlFlow<()>>,
    {
        let keys = keys
            .into_iter()
            .map(|key| CollectionKey::new(collection, key.as_ref()))
            .collect();
        self.visit_keys(Some(collection), keys, None, |txn, key| {
            match txn.fetch_object(key)? {
                Some(object) => {
                    let metadata = txn.fetch_metadata(key)?;
                    f(txn, &key.key, Some((&object, metadata.as_ref())))
                }
                None => f(txn, &key.key, None),
            }
        })
    }

    // ------------------------------------------------------------------
    // Extensions
    // ------------------------------------------------------------------

    /// Typed access to the transaction of the extension registered as
    /// `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ExtensionNotFound`] if no such extension is
    /// registered, or an invalid-operation error if it is not a `T`.
    pub fn ext<T: ExtensionTransaction>(&mut self, name: &str) -> CoreResult<ExtView<'_, T>> {
        let db = self.db;
        let rows: &dyn RowRead = &self.rows;
        let Some(entry) = self.ext_txns.iter_mut().find(|(n, _)| n == name) else {
            return Err(CoreError::ExtensionNotFound {
                name: name.to_string(),
            });
        };
        let extension: &str = &entry.0;
        let transaction = entry
            .1
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "extension {extension:?} is not a {}",
                    std::any::type_name::<T>()
                ))
            })?;
        Ok(ExtView::new(
            transaction,
            ReadTables::new(rows, extension, &db.serialization),
        ))
    }
}

#[cfg(test)]
mod tests;
