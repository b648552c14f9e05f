//! Persisted extension configuration in the `yap2` table.
//!
//! Rows are addressed `(extension name, setting key)` and hold a CBOR value.
//! Keys starting with `__` are reserved for the registry.

use crate::engine::{RowRead, StoredRow, WriteTxn, CONFIG_TABLE};
use crate::error::{CoreError, CoreResult};
use crate::serialization::{cbor_deserialize, cbor_serialize};
use crate::types::{CollectionKey, RowId};
use ciborium::value::Value;

pub(crate) const CLASS_KEY: &str = "__class";
pub(crate) const VERSION_TAG_KEY: &str = "__version_tag";
pub(crate) const TABLES_KEY: &str = "__tables";

pub(crate) fn read(rows: &dyn RowRead, extension: &str, key: &str) -> CoreResult<Option<Value>> {
    rows.get(CONFIG_TABLE, &CollectionKey::new(extension, key))
        .map(|row| cbor_deserialize(extension, key, &row.data))
        .transpose()
}

pub(crate) fn write(txn: &mut WriteTxn, extension: &str, key: &str, value: &Value) -> CoreResult<()> {
    let data = cbor_serialize(extension, key, value)?;
    txn.put(
        CONFIG_TABLE,
        CollectionKey::new(extension, key),
        StoredRow {
            rowid: RowId::new(0),
            data,
            metadata: None,
        },
    );
    Ok(())
}

pub(crate) fn remove(txn: &mut WriteTxn, extension: &str, key: &str) {
    txn.delete(CONFIG_TABLE, &CollectionKey::new(extension, key));
}

pub(crate) fn remove_all(txn: &mut WriteTxn, extension: &str) {
    txn.clear_collection(CONFIG_TABLE, extension);
}

/// Names of every extension with a persisted registration.
pub(crate) fn persisted_extension_names(rows: &dyn RowRead) -> Vec<String> {
    rows.collections(CONFIG_TABLE)
        .into_iter()
        .filter(|name| rows.get(CONFIG_TABLE, &CollectionKey::new(name, CLASS_KEY)).is_some())
        .collect()
}

/// What a previous registration left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PersistedRegistration {
    pub class_name: String,
    pub version_tag: String,
    pub tables: Vec<String>,
}

impl PersistedRegistration {
    pub fn load(rows: &dyn RowRead, extension: &str) -> CoreResult<Option<Self>> {
        let Some(class) = read(rows, extension, CLASS_KEY)? else {
            return Ok(None);
        };
        let class_name = text(extension, CLASS_KEY, class)?;
        let version_tag = match read(rows, extension, VERSION_TAG_KEY)? {
            Some(value) => text(extension, VERSION_TAG_KEY, value)?,
            None => String::new(),
        };
        let tables = match read(rows, extension, TABLES_KEY)? {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| text(extension, TABLES_KEY, item))
                .collect::<CoreResult<Vec<_>>>()?,
            Some(_) => {
                return Err(CoreError::deserialization(
                    extension,
                    TABLES_KEY,
                    "expected an array of table suffixes",
                ))
            }
            None => Vec::new(),
        };
        Ok(Some(Self {
            class_name,
            version_tag,
            tables,
        }))
    }

    pub fn store(&self, txn: &mut WriteTxn, extension: &str) -> CoreResult<()> {
        write(txn, extension, CLASS_KEY, &Value::Text(self.class_name.clone()))?;
        write(
            txn,
            extension,
            VERSION_TAG_KEY,
            &Value::Text(self.version_tag.clone()),
        )?;
        let tables = self.tables.iter().cloned().map(Value::Text).collect();
        write(txn, extension, TABLES_KEY, &Value::Array(tables))
    }
}

fn text(extension: &str, key: &str, value: Value) -> CoreResult<String> {
    match value {
        Value::Text(text) => Ok(text),
        _ => Err(CoreError::deserialization(extension, key, "expected text")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StorageEngine;

    #[test]
    fn registration_survives_commit() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let mut handle = engine.open_handle();

        let record = PersistedRegistration {
            class_name: "SecondaryIndex".into(),
            version_tag: "v2".into(),
            tables: vec!["values".into(), "rows".into()],
        };
        let mut txn = handle.begin_write();
        record.store(&mut txn, "by_tag").unwrap();
        write(&mut txn, "by_tag", "custom", &Value::Integer(5.into())).unwrap();
        txn.commit().unwrap();

        let read = handle.begin_read();
        assert_eq!(PersistedRegistration::load(&read, "by_tag").unwrap(), Some(record));
        assert_eq!(persisted_extension_names(&read), vec!["by_tag"]);
        assert_eq!(PersistedRegistration::load(&read, "missing").unwrap(), None);
    }

    #[test]
    fn remove_all_forgets_the_extension() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let mut handle = engine.open_handle();

        let mut txn = handle.begin_write();
        write(&mut txn, "gone", CLASS_KEY, &Value::Text("X".into())).unwrap();
        txn.commit().unwrap();

        let mut txn = handle.begin_write();
        remove_all(&mut txn, "gone");
        txn.commit().unwrap();

        assert!(persisted_extension_names(&handle.begin_read()).is_empty());
    }
}
