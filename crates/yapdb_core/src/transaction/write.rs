//! Write operations of read-write transactions.
//!
//! Every mutation runs the same steps in order: the enumeration guard, the
//! pre-sanitizer, the engine write, one hook call per registered extension,
//! then post-sanitizer, cache update and changeset record. A failure at any
//! step marks the transaction for rollback.

use super::{AbortReason, ReadWriteTransaction};
use crate::engine::{RowRead, StoredRow, MAIN_TABLE};
use crate::error::{CoreError, CoreResult};
use crate::extension::{self, Extension, ExtensionMap, ExtensionTransaction, WriteTables};
use crate::serialization::to_value;
use crate::types::{CollectionKey, RowId};
use ciborium::value::Value;
use serde::Serialize;
use std::sync::Arc;

impl ReadWriteTransaction<'_> {
    /// Sets the object at `key` in `collection` and clears its metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is rejected or cannot be serialized, if
    /// an extension hook fails, or if `collection` is being enumerated.
    pub fn set_object(&mut self, key: &str, collection: &str, object: Value) -> CoreResult<()> {
        self.set_object_with_metadata(key, collection, object, None)
    }

    /// Sets object and metadata of one row.
    ///
    /// # Errors
    ///
    /// As [`Self::set_object`].
    pub fn set_object_with_metadata(
        &mut self,
        key: &str,
        collection: &str,
        object: Value,
        metadata: Option<Value>,
    ) -> CoreResult<()> {
        let result = self.write_row(CollectionKey::new(collection, key), object, metadata);
        self.poison_on_error(result)
    }

    /// Sets the object from any serde type.
    ///
    /// # Errors
    ///
    /// As [`Self::set_object`].
    pub fn set_typed<T: Serialize>(&mut self, key: &str, collection: &str, object: &T) -> CoreResult<()> {
        let value = to_value(collection, key, object)?;
        self.set_object(key, collection, value)
    }

    /// Stores already serialized bytes as the object, with optional
    /// serialized metadata. The serializers and pre-sanitizers are skipped;
    /// the bytes must still decode with the deserializers, because extensions
    /// and caches see the decoded values.
    ///
    /// # Errors
    ///
    /// Returns the deserializer's error for bytes it cannot read, or as
    /// [`Self::set_object`].
    pub fn set_primitive_data(
        &mut self,
        key: &str,
        collection: &str,
        data: Vec<u8>,
        metadata: Option<Vec<u8>>,
    ) -> CoreResult<()> {
        let result = self.write_primitive(CollectionKey::new(collection, key), data, metadata);
        self.poison_on_error(result)
    }

    /// Replaces the stored object bytes of an existing row, keeping its
    /// metadata. Does nothing if the row does not exist.
    ///
    /// # Errors
    ///
    /// As [`Self::set_primitive_data`].
    pub fn replace_primitive_data(
        &mut self,
        key: &str,
        collection: &str,
        data: Vec<u8>,
    ) -> CoreResult<()> {
        let result = self.replace_primitive(CollectionKey::new(collection, key), data);
        self.poison_on_error(result)
    }

    /// Replaces the object of an existing row, keeping its metadata. Does
    /// nothing if the row does not exist.
    ///
    /// # Errors
    ///
    /// As [`Self::set_object`].
    pub fn replace_object(&mut self, key: &str, collection: &str, object: Value) -> CoreResult<()> {
        let result = self.replace_row_object(CollectionKey::new(collection, key), object);
        self.poison_on_error(result)
    }

    /// Replaces the metadata of an existing row, keeping its object. Does
    /// nothing if the row does not exist.
    ///
    /// # Errors
    ///
    /// As [`Self::set_object`].
    pub fn replace_metadata(
        &mut self,
        key: &str,
        collection: &str,
        metadata: Option<Value>,
    ) -> CoreResult<()> {
        let result = self.replace_row_metadata(CollectionKey::new(collection, key), metadata);
        self.poison_on_error(result)
    }

    /// Reports the object as changed without writing it. Allowed during
    /// enumeration.
    ///
    /// # Errors
    ///
    /// Returns an extension hook's error.
    pub fn touch_object(&mut self, key: &str, collection: &str) -> CoreResult<()> {
        let result = self.touch(CollectionKey::new(collection, key), true, false);
        self.poison_on_error(result)
    }

    /// Reports the metadata as changed without writing it.
    ///
    /// # Errors
    ///
    /// Returns an extension hook's error.
    pub fn touch_metadata(&mut self, key: &str, collection: &str) -> CoreResult<()> {
        let result = self.touch(CollectionKey::new(collection, key), false, true);
        self.poison_on_error(result)
    }

    /// Reports object and metadata as changed.
    ///
    /// # Errors
    ///
    /// Returns an extension hook's error.
    pub fn touch_row(&mut self, key: &str, collection: &str) -> CoreResult<()> {
        let result = self.touch(CollectionKey::new(collection, key), true, true);
        self.poison_on_error(result)
    }

    /// Removes one row. Removing a missing row does nothing.
    ///
    /// # Errors
    ///
    /// Returns an extension hook's error, or the mutation-during-enumeration
    /// error.
    pub fn remove_object(&mut self, key: &str, collection: &str) -> CoreResult<()> {
        let result = self.remove_row(CollectionKey::new(collection, key));
        self.poison_on_error(result)
    }

    /// Removes several rows of one collection.
    ///
    /// # Errors
    ///
    /// As [`Self::remove_object`].
    pub fn remove_objects<I, S>(&mut self, keys: I, collection: &str) -> CoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        let result = self.remove_rows(collection, keys);
        self.poison_on_error(result)
    }

    /// Removes every row of `collection`.
    ///
    /// # Errors
    ///
    /// As [`Self::remove_object`].
    pub fn remove_all_in_collection(&mut self, collection: &str) -> CoreResult<()> {
        let result = self.remove_collection(collection);
        self.poison_on_error(result)
    }

    /// Removes every row of every collection.
    ///
    /// # Errors
    ///
    /// As [`Self::remove_object`]; any active enumeration conflicts.
    pub fn remove_all_in_all_collections(&mut self) -> CoreResult<()> {
        let result = self.remove_everything();
        self.poison_on_error(result)
    }

    /// Discards the transaction's changes once the body returns.
    pub fn rollback(&mut self) {
        self.rollback_requested = true;
    }

    /// Whether [`Self::rollback`] was called or a write failed.
    #[must_use]
    pub fn will_roll_back(&self) -> bool {
        self.rollback_requested || self.abort.is_some()
    }

    /// Attaches a value to the modified notification of this commit.
    pub fn set_custom_notification_object(&mut self, value: Value) {
        self.custom = Some(value);
    }

    /// The value set by [`Self::set_custom_notification_object`].
    #[must_use]
    pub fn custom_notification_object(&self) -> Option<&Value> {
        self.custom.as_ref()
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    fn poison_on_error<T>(&mut self, result: CoreResult<T>) -> CoreResult<T> {
        if let Err(err) = &result {
            if self.abort.is_none() {
                self.abort = Some(match err {
                    CoreError::MutationDuringEnumeration { collection } => {
                        AbortReason::MutatedDuringEnumeration(collection.clone())
                    }
                    other => AbortReason::WriteFailed(other.to_string()),
                });
            }
        }
        result
    }

    fn check_mutation(&self, collection: Option<&str>) -> CoreResult<()> {
        match self.enumerations.conflict(collection) {
            Some(enumerated) => Err(CoreError::MutationDuringEnumeration {
                collection: enumerated,
            }),
            None => Ok(()),
        }
    }

    /// Calls `hook` once per extension, in registration order.
    fn run_hooks<F>(&mut self, mut hook: F) -> CoreResult<()>
    where
        F: FnMut(&mut dyn ExtensionTransaction, &mut WriteTables<'_>) -> CoreResult<()>,
    {
        let db = self.db;
        for (name, ext) in &mut self.ext_txns {
            let mut tables = WriteTables::new(&mut self.rows, name.as_str(), &db.serialization);
            hook(&mut **ext, &mut tables)?;
        }
        Ok(())
    }

    fn write_row(
        &mut self,
        key: CollectionKey,
        object: Value,
        metadata: Option<Value>,
    ) -> CoreResult<()> {
        self.check_mutation(Some(&key.collection))?;
        let db = self.db;
        let codecs = &db.serialization;
        let (c, k) = (key.collection.as_str(), key.key.as_str());

        let object = codecs.object.sanitize(c, k, object)?;
        let metadata = metadata
            .map(|m| codecs.metadata.sanitize(c, k, m))
            .transpose()?;
        let data = codecs.object.encode(c, k, &object)?;
        let metadata_bytes = metadata
            .as_ref()
            .map(|m| codecs.metadata.encode(c, k, m))
            .transpose()?;
        self.store_row(key, object, data, metadata, metadata_bytes)
    }

    fn write_primitive(
        &mut self,
        key: CollectionKey,
        data: Vec<u8>,
        metadata_bytes: Option<Vec<u8>>,
    ) -> CoreResult<()> {
        self.check_mutation(Some(&key.collection))?;
        let db = self.db;
        let codecs = &db.serialization;
        let (c, k) = (key.collection.as_str(), key.key.as_str());
        let object = codecs.object.decode(c, k, &data)?;
        let metadata = metadata_bytes
            .as_deref()
            .map(|bytes| codecs.metadata.decode(c, k, bytes))
            .transpose()?;
        self.store_row(key, object, data, metadata, metadata_bytes)
    }

    /// Puts an encoded row and runs the insert or update hooks.
    fn store_row(
        &mut self,
        key: CollectionKey,
        object: Value,
        data: Vec<u8>,
        metadata: Option<Value>,
        metadata_bytes: Option<Vec<u8>>,
    ) -> CoreResult<()> {
        let db = self.db;
        let codecs = &db.serialization;
        let (c, k) = (key.collection.as_str(), key.key.as_str());
        let existing = self.rows.get(MAIN_TABLE, &key).map(|row| row.rowid);
        let rowid = match existing {
            Some(rowid) => rowid,
            None => self.rows.allocate_rowid(),
        };
        self.rows.put(
            MAIN_TABLE,
            key.clone(),
            StoredRow {
                rowid,
                data,
                metadata: metadata_bytes,
            },
        );
        self.run_hooks(|ext, tables| {
            if existing.is_some() {
                ext.handle_update_object(tables, &key, rowid, &object, metadata.as_ref())
            } else {
                ext.handle_insert_object(tables, &key, rowid, &object, metadata.as_ref())
            }
        })?;

        codecs.object.after_write(c, k, &object);
        if let Some(m) = &metadata {
            codecs.metadata.after_write(c, k, m);
        }
        self.caches.wrote_object(&key, &object);
        self.caches.wrote_metadata(&key, &metadata);
        self.caches.fill_key(rowid, &key);
        tracing::trace!(%key, %rowid, update = existing.is_some(), "row written");
        self.changes.record_object(&key, object);
        self.changes.record_metadata(&key, metadata);
        Ok(())
    }

    fn replace_row_object(&mut self, key: CollectionKey, object: Value) -> CoreResult<()> {
        self.check_mutation(Some(&key.collection))?;
        if self.rows.get(MAIN_TABLE, &key).is_none() {
            return Ok(());
        }
        let db = self.db;
        let codec = &db.serialization.object;
        let object = codec.sanitize(&key.collection, &key.key, object)?;
        let data = codec.encode(&key.collection, &key.key, &object)?;
        self.store_object(key, object, data)
    }

    fn replace_primitive(&mut self, key: CollectionKey, data: Vec<u8>) -> CoreResult<()> {
        self.check_mutation(Some(&key.collection))?;
        if self.rows.get(MAIN_TABLE, &key).is_none() {
            return Ok(());
        }
        let db = self.db;
        let object = db
            .serialization
            .object
            .decode(&key.collection, &key.key, &data)?;
        self.store_object(key, object, data)
    }

    /// Swaps the object of an existing row and runs the replace hooks.
    fn store_object(&mut self, key: CollectionKey, object: Value, data: Vec<u8>) -> CoreResult<()> {
        let Some(row) = self.rows.get(MAIN_TABLE, &key) else {
            return Ok(());
        };
        let db = self.db;
        let codec = &db.serialization.object;
        self.rows.put(
            MAIN_TABLE,
            key.clone(),
            StoredRow {
                rowid: row.rowid,
                data,
                metadata: row.metadata.clone(),
            },
        );
        self.run_hooks(|ext, tables| ext.handle_replace_object(tables, &key, row.rowid, &object))?;

        codec.after_write(&key.collection, &key.key, &object);
        self.caches.wrote_object(&key, &object);
        self.changes.record_object(&key, object);
        Ok(())
    }

    fn replace_row_metadata(&mut self, key: CollectionKey, metadata: Option<Value>) -> CoreResult<()> {
        self.check_mutation(Some(&key.collection))?;
        let Some(row) = self.rows.get(MAIN_TABLE, &key) else {
            return Ok(());
        };
        let db = self.db;
        let codec = &db.serialization.metadata;
        let metadata = metadata
            .map(|m| codec.sanitize(&key.collection, &key.key, m))
            .transpose()?;
        let metadata_bytes = metadata
            .as_ref()
            .map(|m| codec.encode(&key.collection, &key.key, m))
            .transpose()?;

        self.rows.put(
            MAIN_TABLE,
            key.clone(),
            StoredRow {
                rowid: row.rowid,
                data: row.data.clone(),
                metadata: metadata_bytes,
            },
        );
        self.run_hooks(|ext, tables| {
            ext.handle_replace_metadata(tables, &key, row.rowid, metadata.as_ref())
        })?;

        if let Some(m) = &metadata {
            codec.after_write(&key.collection, &key.key, m);
        }
        self.caches.wrote_metadata(&key, &metadata);
        self.changes.record_metadata(&key, metadata);
        Ok(())
    }

    fn touch(&mut self, key: CollectionKey, object: bool, metadata: bool) -> CoreResult<()> {
        let Some(rowid) = self.rows.get(MAIN_TABLE, &key).map(|row| row.rowid) else {
            return Ok(());
        };
        self.run_hooks(|ext, tables| {
            if object {
                ext.handle_touch_object(tables, &key, rowid)?;
            }
            if metadata {
                ext.handle_touch_metadata(tables, &key, rowid)?;
            }
            Ok(())
        })?;
        if object {
            self.changes.record_touch_object(&key);
        }
        if metadata {
            self.changes.record_touch_metadata(&key);
        }
        Ok(())
    }

    fn remove_row(&mut self, key: CollectionKey) -> CoreResult<()> {
        self.check_mutation(Some(&key.collection))?;
        let Some(rowid) = self.rows.get(MAIN_TABLE, &key).map(|row| row.rowid) else {
            return Ok(());
        };
        self.rows.delete(MAIN_TABLE, &key);
        self.run_hooks(|ext, tables| ext.handle_remove_object(tables, &key, rowid))?;
        self.caches.remove(&key);
        self.changes.record_remove(&key);
        Ok(())
    }

    fn remove_rows(&mut self, collection: &str, keys: Vec<String>) -> CoreResult<()> {
        self.check_mutation(Some(collection))?;
        let mut removed = Vec::with_capacity(keys.len());
        let mut rowids: Vec<RowId> = Vec::with_capacity(keys.len());
        for key in keys {
            let address = CollectionKey::new(collection, key);
            // Deleting as we go skips duplicates.
            if let Some(row) = self.rows.get(MAIN_TABLE, &address) {
                self.rows.delete(MAIN_TABLE, &address);
                rowids.push(row.rowid);
                removed.push(address.key);
            }
        }
        if removed.is_empty() {
            return Ok(());
        }
        self.run_hooks(|ext, tables| ext.handle_remove_objects(tables, collection, &removed, &rowids))?;
        for key in removed {
            let address = CollectionKey::new(collection, key);
            self.caches.remove(&address);
            self.changes.record_remove(&address);
        }
        Ok(())
    }

    fn remove_collection(&mut self, collection: &str) -> CoreResult<()> {
        self.check_mutation(Some(collection))?;
        let keys = self.rows.keys_in_collection(MAIN_TABLE, collection);
        if keys.is_empty() {
            return Ok(());
        }
        let rowids: Vec<RowId> = keys
            .iter()
            .filter_map(|key| {
                self.rows
                    .get(MAIN_TABLE, &CollectionKey::new(collection, key.as_str()))
                    .map(|row| row.rowid)
            })
            .collect();
        self.rows.clear_collection(MAIN_TABLE, collection);
        self.run_hooks(|ext, tables| ext.handle_remove_objects(tables, collection, &keys, &rowids))?;
        self.caches.remove_collection(collection);
        self.changes.record_remove_collection(collection);
        Ok(())
    }

    fn remove_everything(&mut self) -> CoreResult<()> {
        self.check_mutation(None)?;
        self.rows.clear_table(MAIN_TABLE);
        self.run_hooks(|ext, tables| ext.handle_remove_all(tables))?;
        self.caches.clear();
        self.changes.record_remove_all();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit support
    // ------------------------------------------------------------------

    /// Gives every extension a last chance to write before the commit.
    pub(crate) fn flush_extensions(&mut self) -> CoreResult<()> {
        let result = self.run_hooks(|ext, tables| ext.flush_pending_changes_to_main_table(tables));
        self.poison_on_error(result)
    }

    fn current_extensions(&self) -> Arc<ExtensionMap> {
        self.pending_extensions
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.extensions))
    }

    /// Registers an extension inside this transaction. Returns false if an
    /// extension of the same class already holds the name.
    pub(crate) fn register_extension(
        &mut self,
        name: &str,
        ext: Arc<dyn Extension>,
    ) -> CoreResult<bool> {
        let db = self.db;
        let current = self.current_extensions();
        let registered = extension::register(
            &mut self.rows,
            &db.serialization,
            &db.options,
            &current,
            name,
            ext,
        )?;
        match registered {
            Some(map) => {
                self.pending_extensions = Some(Arc::new(map));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Unregisters an extension and its dependents inside this transaction.
    pub(crate) fn unregister_extension(&mut self, name: &str) -> CoreResult<()> {
        let db = self.db;
        let current = self.current_extensions();
        let (map, doomed) =
            extension::unregister(&mut self.rows, &db.serialization, &current, name)?;
        self.ext_txns.retain(|(ext_name, _)| !doomed.contains(ext_name));
        self.pending_extensions = Some(Arc::new(map));
        Ok(())
    }
}
