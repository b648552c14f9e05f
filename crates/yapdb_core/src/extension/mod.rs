//! The extension hook protocol.
//!
//! An extension is three cooperating roles:
//!
//! - [`Extension`]: the registered descriptor and factory. Shared by every
//!   connection.
//! - [`ExtensionConnection`]: one per connection. Owns the extension's caches,
//!   folds in changesets from sibling connections, and contributes its part of
//!   every changeset its connection commits.
//! - [`ExtensionTransaction`]: one per transaction. Receives a hook call for
//!   every row mutation, synchronously and in transaction order, and may
//!   write to the extension's auxiliary tables inside the same physical
//!   transaction.
//!
//! Auxiliary tables are reached only through [`ReadTables`] and
//! [`WriteTables`], which scope every table name to the extension.

mod registry;
mod secondary_index;
mod settings;
mod tables;

pub(crate) use registry::{register, unregister};
pub use secondary_index::{
    IndexBlock, IndexValue, SecondaryIndex, SecondaryIndexConnection, SecondaryIndexTransaction,
};
pub(crate) use settings::persisted_extension_names;
pub use tables::{table_name, ReadTables, WriteTables};

use crate::changeset::CoreChangeset;
use crate::config::DatabaseOptions;
use crate::connection::FlushLevel;
use crate::error::CoreResult;
use crate::types::{CollectionKey, RowId, Snapshot};
use ciborium::value::Value;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// A registered extension: descriptor and connection factory.
pub trait Extension: Send + Sync + 'static {
    /// Implementation name. Registering a second extension under an existing
    /// name fails unless the class names match.
    fn class_name(&self) -> &'static str;

    /// Configuration tag persisted at registration. When the persisted tag of
    /// a previous registration differs, the old tables are dropped and
    /// rebuilt.
    fn version_tag(&self) -> String {
        String::new()
    }

    /// Names of extensions that must be registered first.
    fn dependencies(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Whether the extension can run with these database options.
    fn supports_database(&self, options: &DatabaseOptions) -> bool {
        let _ = options;
        true
    }

    /// Suffixes of the auxiliary tables this extension owns.
    fn table_suffixes(&self) -> Vec<String> {
        Vec::new()
    }

    /// Creates and populates the auxiliary tables if they do not exist.
    ///
    /// Runs once per registration, inside the registering write transaction.
    ///
    /// # Errors
    ///
    /// Any error aborts the registration.
    fn create_if_needed(&self, tables: &mut WriteTables<'_>) -> CoreResult<()>;

    /// Drops the auxiliary tables. The default drops every table named by
    /// [`Extension::table_suffixes`].
    ///
    /// # Errors
    ///
    /// Any error aborts the unregistration.
    fn drop_tables(&self, tables: &mut WriteTables<'_>) -> CoreResult<()> {
        for suffix in self.table_suffixes() {
            tables.drop_table(&suffix);
        }
        Ok(())
    }

    /// Creates the per-connection half of the extension.
    fn new_connection(self: Arc<Self>, name: &str) -> Box<dyn ExtensionConnection>;
}

/// The per-connection half of an extension.
///
/// Read-write lifecycle, driven by the owning connection:
/// `new_transaction`, hooks on the transaction, `finish_transaction`,
/// `internal_changeset` / `external_changeset` / `has_disk_changes`, then
/// exactly one of `post_commit` or `post_rollback`.
pub trait ExtensionConnection: Send {
    /// Starts the extension's side of a transaction at `snapshot`.
    fn new_transaction(&mut self, snapshot: Snapshot, writable: bool)
        -> Box<dyn ExtensionTransaction>;

    /// Takes back a transaction whose body has finished.
    fn finish_transaction(&mut self, transaction: Box<dyn ExtensionTransaction>);

    /// Payload for sibling connections of the pending commit.
    fn internal_changeset(&mut self) -> Option<Value>;

    /// Payload for notification observers of the pending commit.
    fn external_changeset(&mut self) -> Option<Value>;

    /// Whether the pending commit changed the extension's tables.
    fn has_disk_changes(&self) -> bool;

    /// The pending commit is durable at `snapshot`.
    fn post_commit(&mut self, snapshot: Snapshot);

    /// The pending transaction was rolled back.
    fn post_rollback(&mut self);

    /// Folds in a commit made by another connection. `internal` is this
    /// extension's payload from that commit, if it contributed one.
    fn process_changeset(&mut self, internal: Option<&Value>, core: &CoreChangeset);

    /// Drops every cache; used when catch-up skips changesets.
    fn invalidate(&mut self);

    /// Releases memory under pressure.
    fn flush_memory(&mut self, level: FlushLevel) {
        if level >= FlushLevel::Moderate {
            self.invalidate();
        }
    }
}

/// The per-transaction half of an extension.
///
/// Hooks run after the main-table mutation and before the transaction
/// proceeds. An error from a hook aborts the transaction.
pub trait ExtensionTransaction: Send + 'static {
    /// A new row was inserted.
    fn handle_insert_object(
        &mut self,
        tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        rowid: RowId,
        object: &Value,
        metadata: Option<&Value>,
    ) -> CoreResult<()>;

    /// An existing row was overwritten, object and metadata.
    fn handle_update_object(
        &mut self,
        tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        rowid: RowId,
        object: &Value,
        metadata: Option<&Value>,
    ) -> CoreResult<()>;

    /// The object of an existing row was replaced; metadata is unchanged.
    fn handle_replace_object(
        &mut self,
        tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        rowid: RowId,
        object: &Value,
    ) -> CoreResult<()>;

    /// The metadata of an existing row was replaced; the object is unchanged.
    fn handle_replace_metadata(
        &mut self,
        tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        rowid: RowId,
        metadata: Option<&Value>,
    ) -> CoreResult<()>;

    /// The object was touched.
    fn handle_touch_object(
        &mut self,
        _tables: &mut WriteTables<'_>,
        _key: &CollectionKey,
        _rowid: RowId,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// The metadata was touched.
    fn handle_touch_metadata(
        &mut self,
        _tables: &mut WriteTables<'_>,
        _key: &CollectionKey,
        _rowid: RowId,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// One row was removed.
    fn handle_remove_object(
        &mut self,
        tables: &mut WriteTables<'_>,
        key: &CollectionKey,
        rowid: RowId,
    ) -> CoreResult<()>;

    /// Several rows of one collection were removed. `keys` and `rowids` are
    /// parallel.
    fn handle_remove_objects(
        &mut self,
        tables: &mut WriteTables<'_>,
        collection: &str,
        keys: &[String],
        rowids: &[RowId],
    ) -> CoreResult<()>;

    /// Every row of every collection was removed.
    fn handle_remove_all(&mut self, tables: &mut WriteTables<'_>) -> CoreResult<()>;

    /// Last chance to write deferred changes before the commit.
    fn flush_pending_changes_to_main_table(
        &mut self,
        _tables: &mut WriteTables<'_>,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// For typed access through `Transaction::ext`.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// For typed access in `ExtensionConnection::finish_transaction`.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Registered extensions in registration order.
///
/// Hooks run in this order, so an extension always sees a mutation after
/// the extensions it depends on.
#[derive(Clone, Default)]
pub struct ExtensionMap {
    entries: Vec<(String, Arc<dyn Extension>)>,
}

impl fmt::Debug for ExtensionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(name, ext)| (name, ext.class_name())),
            )
            .finish()
    }
}

impl ExtensionMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an extension.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Extension>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ext)| ext)
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Extension>)> {
        self.entries.iter().map(|(name, ext)| (name.as_str(), ext))
    }

    /// Number of registered extensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A copy with `extension` appended under `name`.
    #[must_use]
    pub fn with(&self, name: &str, extension: Arc<dyn Extension>) -> Self {
        let mut entries = self.entries.clone();
        entries.push((name.to_string(), extension));
        Self { entries }
    }

    /// A copy without the named extensions.
    #[must_use]
    pub fn without(&self, names: &BTreeSet<String>) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(name, _)| !names.contains(name))
                .cloned()
                .collect(),
        }
    }

    /// `name` plus every extension that depends on it, directly or not.
    #[must_use]
    pub fn dependents_closure(&self, name: &str) -> BTreeSet<String> {
        let mut closure = BTreeSet::from([name.to_string()]);
        loop {
            let before = closure.len();
            for (candidate, ext) in &self.entries {
                if ext.dependencies().iter().any(|dep| closure.contains(dep)) {
                    closure.insert(candidate.clone());
                }
            }
            if closure.len() == before {
                return closure;
            }
        }
    }
}

/// Typed access to one extension's transaction.
///
/// Returned by `Transaction::ext`; pairs the extension transaction with
/// read access to its tables at the transaction's snapshot.
pub struct ExtView<'t, T> {
    transaction: &'t mut T,
    tables: ReadTables<'t>,
}

impl<'t, T> ExtView<'t, T> {
    pub(crate) fn new(transaction: &'t mut T, tables: ReadTables<'t>) -> Self {
        Self {
            transaction,
            tables,
        }
    }

    /// The extension transaction and its tables.
    pub fn parts(&mut self) -> (&mut T, &ReadTables<'t>) {
        (&mut *self.transaction, &self.tables)
    }

    /// Read access to the extension's tables.
    #[must_use]
    pub fn tables(&self) -> &ReadTables<'t> {
        &self.tables
    }
}
