//! Scoped access to an extension's auxiliary tables.

use super::settings;
use crate::engine::{RowRead, StoredRow, WriteTxn, MAIN_TABLE};
use crate::error::CoreResult;
use crate::serialization::Serialization;
use crate::types::{CollectionKey, RowId, Snapshot};
use ciborium::value::Value;

/// Auxiliary rows carry no meaningful rowid.
const AUX_ROWID: RowId = RowId::new(0);

/// Engine name of an extension's auxiliary table.
#[must_use]
pub fn table_name(extension: &str, suffix: &str) -> String {
    format!("ext_{extension}_{suffix}")
}

/// Read access for one extension: its own tables, its persisted settings,
/// and the main table.
pub struct ReadTables<'t> {
    rows: &'t dyn RowRead,
    extension: &'t str,
    serialization: &'t Serialization,
}

impl<'t> ReadTables<'t> {
    pub(crate) fn new(
        rows: &'t dyn RowRead,
        extension: &'t str,
        serialization: &'t Serialization,
    ) -> Self {
        Self {
            rows,
            extension,
            serialization,
        }
    }

    /// Registered name of the extension.
    #[must_use]
    pub fn extension_name(&self) -> &str {
        self.extension
    }

    /// Snapshot the reads observe.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.rows.snapshot()
    }

    /// Whether the auxiliary table exists.
    #[must_use]
    pub fn table_exists(&self, suffix: &str) -> bool {
        self.rows.table_exists(&table_name(self.extension, suffix))
    }

    /// One auxiliary row's bytes.
    #[must_use]
    pub fn get(&self, suffix: &str, collection: &str, key: &str) -> Option<Vec<u8>> {
        self.rows
            .get(
                &table_name(self.extension, suffix),
                &CollectionKey::new(collection, key),
            )
            .map(|row| row.data.clone())
    }

    /// Keys of one auxiliary collection, in order.
    #[must_use]
    pub fn keys_in_collection(&self, suffix: &str, collection: &str) -> Vec<String> {
        self.rows
            .keys_in_collection(&table_name(self.extension, suffix), collection)
    }

    /// Non-empty collections of an auxiliary table, in order.
    #[must_use]
    pub fn collections(&self, suffix: &str) -> Vec<String> {
        self.rows.collections(&table_name(self.extension, suffix))
    }

    /// Every row address of the main table.
    #[must_use]
    pub fn main_keys(&self) -> Vec<CollectionKey> {
        self.rows.keys(MAIN_TABLE)
    }

    /// Rowid of a main-table row.
    #[must_use]
    pub fn main_rowid(&self, key: &CollectionKey) -> Option<RowId> {
        self.rows.get(MAIN_TABLE, key).map(|row| row.rowid)
    }

    /// Address of a main-table rowid.
    #[must_use]
    pub fn main_key_for_rowid(&self, rowid: RowId) -> Option<CollectionKey> {
        self.rows
            .get_by_rowid(MAIN_TABLE, rowid)
            .map(|(key, _)| key)
    }

    /// Deserialized object of a main-table row.
    ///
    /// # Errors
    ///
    /// Returns the deserializer's error.
    pub fn main_object(&self, key: &CollectionKey) -> CoreResult<Option<Value>> {
        self.rows
            .get(MAIN_TABLE, key)
            .map(|row| {
                self.serialization
                    .object
                    .decode(&key.collection, &key.key, &row.data)
            })
            .transpose()
    }

    /// Deserialized metadata of a main-table row.
    ///
    /// # Errors
    ///
    /// Returns the deserializer's error.
    pub fn main_metadata(&self, key: &CollectionKey) -> CoreResult<Option<Value>> {
        match self.rows.get(MAIN_TABLE, key) {
            Some(row) => row
                .metadata
                .as_deref()
                .map(|bytes| {
                    self.serialization
                        .metadata
                        .decode(&key.collection, &key.key, bytes)
                })
                .transpose(),
            None => Ok(None),
        }
    }

    /// A setting persisted by this extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored value cannot be decoded.
    pub fn setting(&self, key: &str) -> CoreResult<Option<Value>> {
        settings::read(self.rows, self.extension, key)
    }
}

/// Write access for one extension inside a read-write transaction.
pub struct WriteTables<'t> {
    txn: &'t mut WriteTxn,
    extension: &'t str,
    serialization: &'t Serialization,
}

impl<'t> WriteTables<'t> {
    pub(crate) fn new(
        txn: &'t mut WriteTxn,
        extension: &'t str,
        serialization: &'t Serialization,
    ) -> Self {
        Self {
            txn,
            extension,
            serialization,
        }
    }

    /// Read access, including this transaction's own writes.
    #[must_use]
    pub fn read(&self) -> ReadTables<'_> {
        ReadTables::new(&*self.txn, self.extension, self.serialization)
    }

    /// Registered name of the extension.
    #[must_use]
    pub fn extension_name(&self) -> &str {
        self.extension
    }

    /// Creates an auxiliary table.
    pub fn create_table(&mut self, suffix: &str) {
        self.txn.create_table(&table_name(self.extension, suffix));
    }

    /// Drops an auxiliary table and its rows.
    pub fn drop_table(&mut self, suffix: &str) {
        self.txn.drop_table(&table_name(self.extension, suffix));
    }

    /// Removes every row of an auxiliary table.
    pub fn clear_table(&mut self, suffix: &str) {
        self.txn.clear_table(&table_name(self.extension, suffix));
    }

    /// Writes an auxiliary row.
    pub fn put(&mut self, suffix: &str, collection: &str, key: &str, data: Vec<u8>) {
        self.txn.put(
            &table_name(self.extension, suffix),
            CollectionKey::new(collection, key),
            StoredRow {
                rowid: AUX_ROWID,
                data,
                metadata: None,
            },
        );
    }

    /// Removes an auxiliary row.
    pub fn delete(&mut self, suffix: &str, collection: &str, key: &str) {
        self.txn.delete(
            &table_name(self.extension, suffix),
            &CollectionKey::new(collection, key),
        );
    }

    /// Removes every row of an auxiliary collection.
    pub fn clear_collection(&mut self, suffix: &str, collection: &str) {
        self.txn
            .clear_collection(&table_name(self.extension, suffix), collection);
    }

    /// Persists a setting for this extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    pub fn set_setting(&mut self, key: &str, value: &Value) -> CoreResult<()> {
        settings::write(self.txn, self.extension, key, value)
    }

    /// Removes a persisted setting.
    pub fn remove_setting(&mut self, key: &str) {
        settings::remove(self.txn, self.extension, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StorageEngine;

    #[test]
    fn tables_are_scoped_to_the_extension() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let mut handle = engine.open_handle();
        let serialization = Serialization::default();

        let mut txn = handle.begin_write();
        {
            let mut tables = WriteTables::new(&mut txn, "by_tag", &serialization);
            tables.create_table("values");
            tables.put("values", "red", "1", b"x".to_vec());
            assert_eq!(tables.read().get("values", "red", "1"), Some(b"x".to_vec()));
            tables.set_setting("flag", &Value::Bool(true)).unwrap();
        }
        txn.commit().unwrap();

        let read = handle.begin_read();
        assert!(read.table_exists("ext_by_tag_values"));
        let tables = ReadTables::new(&read, "by_tag", &serialization);
        assert_eq!(tables.keys_in_collection("values", "red"), vec!["1"]);
        assert_eq!(tables.setting("flag").unwrap(), Some(Value::Bool(true)));

        let other = ReadTables::new(&read, "other", &serialization);
        assert!(!other.table_exists("values"));
        assert_eq!(other.setting("flag").unwrap(), None);
    }
}
