//! A built-in extension: a secondary index from a derived value to rows.
//!
//! A user block maps each row to an optional [`IndexValue`]. Two auxiliary
//! tables hold the index:
//!
//! - `values`: collection = encoded value, key = rowid
//! - `rows`: key = rowid, data = encoded value
//!
//! Query results are cached per connection and evicted through changesets.

use super::{
    ExtView, Extension, ExtensionConnection, ExtensionTransaction, ReadTables, WriteTables,
};
use crate::changeset::CoreChangeset;
use crate::connection::{FlushLevel, LruCache};
use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionKey, RowId, Snapshot};
use ciborium::value::Value;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};

const VALUES: &str = "values";
const ROWS: &str = "rows";

/// Maps `(collection, key, object, metadata)` to the row's index value.
pub type IndexBlock =
    Arc<dyn Fn(&str, &str, &Value, Option<&Value>) -> Option<IndexValue> + Send + Sync>;

/// A value that can be indexed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexValue {
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Integer(i64),
    /// A string.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl IndexValue {
    /// Order-preserving text encoding, used as the `values` collection name.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Bool(b) => format!("b:{}", u8::from(*b)),
            // Flipping the sign bit makes unsigned order match signed order.
            Self::Integer(i) => format!("i:{:016x}", (*i as u64) ^ (1 << 63)),
            Self::Text(t) => format!("t:{t}"),
            Self::Bytes(bytes) => {
                let mut out = String::with_capacity(2 + bytes.len() * 2);
                out.push_str("x:");
                for byte in bytes {
                    out.push_str(&format!("{byte:02x}"));
                }
                out
            }
        }
    }

    /// Inverse of [`IndexValue::encode`].
    #[must_use]
    pub fn decode(encoded: &str) -> Option<Self> {
        let (tag, body) = encoded.split_once(':')?;
        match tag {
            "b" => match body {
                "0" => Some(Self::Bool(false)),
                "1" => Some(Self::Bool(true)),
                _ => None,
            },
            "i" => u64::from_str_radix(body, 16)
                .ok()
                .map(|raw| Self::Integer((raw ^ (1 << 63)) as i64)),
            "t" => Some(Self::Text(body.to_string())),
            "x" => {
                if body.len() % 2 != 0 {
                    return None;
                }
                (0..body.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&body[i..i + 2], 16).ok())
                    .collect::<Option<Vec<_>>>()
                    .map(Self::Bytes)
            }
            _ => None,
        }
    }

    /// Converts a dynamic value, if it is indexable.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Integer(i) => i64::try_from(*i).ok().map(Self::Integer),
            Value::Text(t) => Some(Self::Text(t.clone())),
            Value::Bytes(b) => Some(Self::Bytes(b.clone())),
            _ => None,
        }
    }

    /// Converts to a dynamic value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Integer(i) => Value::Integer((*i).into()),
            Self::Text(t) => Value::Text(t.clone()),
            Self::Bytes(b) => Value::Bytes(b.clone()),
        }
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

fn rowid_key(rowid: RowId) -> String {
    format!("{:020}", rowid.as_u64())
}

type QueryCache = LruCache<IndexValue, Arc<Vec<CollectionKey>>>;

/// Index values touched by one transaction.
#[derive(Debug, Default, Clone)]
struct IndexChanges {
    values: BTreeSet<IndexValue>,
    all: bool,
    disk: bool,
}

impl IndexChanges {
    fn is_empty(&self) -> bool {
        !self.all && self.values.is_empty()
    }

    fn dirty(&self, value: &IndexValue) -> bool {
        self.all || self.values.contains(value)
    }

    fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Text("all".into()), Value::Bool(self.all)),
            (
                Value::Text("values".into()),
                Value::Array(self.values.iter().map(IndexValue::to_value).collect()),
            ),
        ])
    }

    fn from_value(value: &Value) -> Self {
        let mut changes = Self::default();
        if let Value::Map(entries) = value {
            for (field, payload) in entries {
                match (field, payload) {
                    (Value::Text(name), Value::Bool(all)) if name == "all" => changes.all = *all,
                    (Value::Text(name), Value::Array(items)) if name == "values" => {
                        changes.values = items.iter().filter_map(IndexValue::from_value).collect();
                    }
                    _ => {}
                }
            }
        }
        changes
    }

    fn evict_from(&self, cache: &mut QueryCache) {
        if self.all {
            cache.clear();
        } else {
            for value in &self.values {
                cache.remove(value);
            }
        }
    }
}

/// Secondary index descriptor.
pub struct SecondaryIndex {
    block: IndexBlock,
    version_tag: String,
    collections: Option<BTreeSet<String>>,
    cache_limit: usize,
}

impl fmt::Debug for SecondaryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryIndex")
            .field("version_tag", &self.version_tag)
            .field("collections", &self.collections)
            .finish_non_exhaustive()
    }
}

impl SecondaryIndex {
    /// Creates an index over every collection.
    #[must_use]
    pub fn new(block: IndexBlock) -> Self {
        Self {
            block,
            version_tag: String::new(),
            collections: None,
            cache_limit: 100,
        }
    }

    /// Sets the version tag; changing it rebuilds the index on registration.
    #[must_use]
    pub fn with_version_tag(mut self, tag: impl Into<String>) -> Self {
        self.version_tag = tag.into();
        self
    }

    /// Restricts the index to these collections.
    #[must_use]
    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = Some(collections.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the per-connection query cache size. Zero means unlimited.
    #[must_use]
    pub fn with_cache_limit(mut self, limit: usize) -> Self {
        self.cache_limit = limit;
        self
    }

    fn index_value(
        &self,
        key: &CollectionKey,
        object: &Value,
        metadata: Option<&Value>,
    ) -> Option<IndexValue> {
        if let Some(allowed) = &self.collections {
            if !allowed.contains(&key.collection) {
                return None;
            }
        }
        (self.block)(&key.collection, &key.key, object, metadata)
    }
}

impl Extension for SecondaryIndex {
    fn class_name(&self) -> &'static str {
        "SecondaryIndex"
    }

    fn version_tag(&self) -> String {
        self.version_tag.clone()
    }

    fn table_suffixes(&self) -> Vec<String> {
        vec![VALUES.to_string(), ROWS.to_string()]
    }

    fn create_if_needed(&self, tables: &mut WriteTables<'_>) -> CoreResult<()> {
        if tables.read().table_exists(ROWS) {
            return Ok(());
        }
        tables.create_table(VALUES);
        tables.create_table(ROWS);

        let mut entries = Vec::new();
        {
            let read = tables.read();
            for key in read.main_keys() {
                let (Some(rowid), Some(object)) = (read.main_rowid(&key), read.main_object(&key)?)
                else {
                    continue;
                };
                let metadata = read.main_metadata(&key)?;
                if let Some(value) = self.index_value(&key, &object, metadata.as_ref()) {
                    entries.push((rowid, value));
                }
            }
        }
        tracing::debug!(
            extension = tables.extension_name(),
            rows = entries.len(),
            "populating secondary index"
        );
        for (rowid, value) in entries {
            let encoded = value.encode();
            tables.put(VALUES, &encoded, &rowid_key(rowid), Vec::new());
            tables.put(ROWS, "", &rowid_key(rowid), encoded.into_bytes());
        }
        Ok(())
    }

    fn new_connection(self: Arc<Self>, name: &str) -> Box<dyn ExtensionConnection> {
        let cache = LruCache::new(self.cache_limit);
        Box::new(SecondaryIndexConnection {
            index: Arc::downgrade(&self),
            name: name.to_string(),
            cache: Arc::new(Mutex::new(cache)),
            pending: IndexChanges::default(),
        })
    }
}

/// Per-connection state of a [`SecondaryIndex`].
pub struct SecondaryIndexConnection {
    index: Weak<SecondaryIndex>,
    name: String,
    cache: Arc<Mutex<QueryCache>>,
    pending: IndexChanges,
}

impl SecondaryIndexConnection {
    /// Number of cached query results.
    #[must_use]
    pub fn cached_queries(&self) -> usize {
        self.cache.lock().len()
    }
}

impl ExtensionConnection for SecondaryIndexConnection {
    fn new_transaction(
        &mut self,
        _snapshot: Snapshot,
        _writable: bool,
    ) -> Box<dyn ExtensionTransaction> {
        Box::new(SecondaryIndexTransaction {
            index: self.index.upgrade(),
            name: self.name.clone(),
            cache: Arc::clone(&self.cache),
            changes: IndexChanges::default(),
        })
    }

    fn finish_transaction(&mut self, transaction: Box<dyn ExtensionTransaction>) {
        if let Ok(transaction) = transaction.into_any().downcast::<SecondaryIndexTransaction>() {
            self.pending = transaction.changes;
        }
    }

    fn internal_changeset(&mut self) -> Option<Value> {
        (!self.pending.is_empty()).then(|| self.pending.to_value())
    }

    fn external_changeset(&mut self) -> Option<Value> {
        (!self.pending.is_empty()).then(|| self.pending.to_value())
    }

    fn has_disk_changes(&self) -> bool {
        self.pending.disk
    }

    fn post_commit(&mut self, _snapshot: Snapshot) {
        let pending = std::mem::take(&mut self.pending);
        pending.evict_from(&mut self.cache.lock());
    }

    fn post_rollback(&mut self) {
        self.pending = IndexChanges::default();
    }

    fn process_changeset(&mut self, internal: Option<&Value>, _core: &CoreChangeset) {
        if let Some(payload) = internal {
            IndexChanges::from_value(payload).evict_from(&mut self.cache.lock());
        }
    }

    fn invalidate(&mut self) {
        self.cache.lock().clear();
    }

    fn flush_memory(&mut self, level: FlushLevel) {
        let mut cache = self.cache.lock();
        match level {
            FlushLevel::Mild => {
                let half = cache.len() / 2;
                cache.shrink_to(half);
            }
            FlushLevel::Moderate | FlushLevel::Full => cache.clear(),
        }
    }
}

/// Per-transaction state of a [`SecondaryIndex`].
pub struct SecondaryIndexTransaction {
    index: Option<Arc<SecondaryIndex>>,
    name: String,
    cache: Arc<Mutex<QueryCache>>,
    changes: IndexChanges,
}

impl SecondaryIndexTransaction {
    fn index(&self) -> CoreResult<&SecondaryIndex> {
        self.index
            .as_deref()
            .ok_or_else(|| CoreError::extension_failure(&self.name, "extension was dropped"))
    }

    fn current_value(tables: &ReadTables<'_>, rowid: RowId) -> Option<IndexValue> {
        let bytes = tables.get(ROWS, "", &rowid_key(rowid))?;
        IndexValue::decode(std::str::from_utf8(&bytes).ok()?)
    }

    fn set_value(
        &mut self,
        tables: &mut WriteTables<'_>,
        rowid: RowId,
        value: Option<IndexValue>,
    ) {
        let old = Self::current_value(&tables.read(), rowid);
        if old == value {
            return;
        }
        let key = rowid_key(rowid);
        if let Some(old) = old {
            tables.delete(VALUES, &old.encode(), &key);
            self.changes.values.insert(old);
        }
        match value {
            Some(value) => {
                let encoded = value.encode();
                tables.put(VALUES, &encoded, &key, Vec::new());
                tables.put(ROWS, "", &key, encoded.into_bytes());
                self.changes.values.insert(value);
            }
            None => tables.delete(ROWS, "", &key),
        }
        self.changes.disk = true;
    }

    /// Rows whose index value equals `value`, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the index tables are damaged.
    pub fn keys_for_value(
        &mut self,
        tables: &ReadTables<'_>,
        value: &IndexValue,
    ) -> CoreResult<Vec<CollectionKey>> {
        let cacheable = !self.changes.dirty(value);
        if cacheable {
            if let Some(hit) = self.cache.lock().get(value) {
                return Ok(hit.as_ref().clone());
            }
        }

        let mut keys = Vec::new();
        for rowid in tables.keys_in_collection(VALUES, &value.encode()) {
            let rowid = rowid.parse::<u64>().map_err(|_| {
                CoreError::extension_failure(&self.name, format!("invalid rowid entry {rowid}"))
            })?;
            if let Some(key) = tables.main_key_for_rowid(RowId::new(rowid)) {
                keys.push(key);
            }
        }
        keys.sort();

        if cacheable {
            self.cache.lock().put(value.clone(), Arc::new(keys.clone()));
        }
        Ok(keys)
    }

    /// Number of rows whose index value equals `value`.
    #[must_use]
    pub fn count_for_value(&self, tables: &ReadTables<'_>, value: &IndexValue) -> usize {
        tables.keys_in_collection(VALUES, &value.encode()).len()
    }

    /// Every distinct indexed value, in order.
    #[must_use]
    pub fn values(&self, tables: &ReadTables<'_>) -> Vec<IndexValue> {
        tables
            .collections(VALUES)
            .iter()
            .filter_map(|encoded| IndexValue::decode(encoded))
            .collect()
    }

    /// The index value of one row.
    #[must_use]
    pub fn value_for_key(&self, tables: &ReadTables<'_>, key: &CollectionKey) -> Option<IndexValue> {
        let rowid = tables.main_rowid(key)?;
        Self::current_value(tables, rowid)
    }
}

impl ExtensionTransaction for SecondaryIndexTransaction {
    fn handle_insert_object(
        &mut self,
        tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        rowid: RowId,
        object: &Value,
        metadata: Option<&Value>,
    ) -> CoreResult<()> {
        let value = self.index()?.index_value(key, object, metadata);
        self.set_value(tables, rowid, value);
        Ok(())
    }

    fn handle_update_object(
        &mut self,
        tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        rowid: RowId,
        object: &Value,
        metadata: Option<&Value>,
    ) -> CoreResult<()> {
        self.handle_insert_object(tables, key, rowid, object, metadata)
    }

    fn handle_replace_object(
        &mut self,
        tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        rowid: RowId,
        object: &Value,
    ) -> CoreResult<()> {
        let metadata = tables.read().main_metadata(key)?;
        let value = self.index()?.index_value(key, object, metadata.as_ref());
        self.set_value(tables, rowid, value);
        Ok(())
    }

    fn handle_replace_metadata(
        &mut self,
        tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        rowid: RowId,
        metadata: Option<&Value>,
    ) -> CoreResult<()> {
        let Some(object) = tables.read().main_object(key)? else {
            return Ok(());
        };
        let value = self.index()?.index_value(key, &object, metadata);
        self.set_value(tables, rowid, value);
        Ok(())
    }

    fn handle_remove_object(
        &mut self,
        tables: &mut WriteTables<'_>,
        _key: &CollectionKey,
        rowid: RowId,
    ) -> CoreResult<()> {
        self.set_value(tables, rowid, None);
        Ok(())
    }

    fn handle_remove_objects(
        &mut self,
        tables: &mut WriteTables<'_>,
        _collection: &str,
        _keys: &[String],
        rowids: &[RowId],
    ) -> CoreResult<()> {
        for rowid in rowids {
            self.set_value(tables, *rowid, None);
        }
        Ok(())
    }

    fn handle_remove_all(&mut self, tables: &mut WriteTables<'_>) -> CoreResult<()> {
        tables.clear_table(VALUES);
        tables.clear_table(ROWS);
        self.changes.all = true;
        self.changes.disk = true;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl ExtView<'_, SecondaryIndexTransaction> {
    /// Rows whose index value equals `value`, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the index tables are damaged.
    pub fn keys_for_value(&mut self, value: impl Into<IndexValue>) -> CoreResult<Vec<CollectionKey>> {
        let value = value.into();
        let (transaction, tables) = self.parts();
        transaction.keys_for_value(tables, &value)
    }

    /// Number of rows whose index value equals `value`.
    pub fn count_for_value(&mut self, value: impl Into<IndexValue>) -> usize {
        let value = value.into();
        let (transaction, tables) = self.parts();
        transaction.count_for_value(tables, &value)
    }

    /// Every distinct indexed value, in order.
    pub fn values(&mut self) -> Vec<IndexValue> {
        let (transaction, tables) = self.parts();
        transaction.values(tables)
    }

    /// The index value of one row.
    pub fn value_for_key(&mut self, key: &str, collection: &str) -> Option<IndexValue> {
        let key = CollectionKey::new(collection, key);
        let (transaction, tables) = self.parts();
        transaction.value_for_key(tables, &key)
    }
}
