//! Changesets: what one committed read-write transaction changed.
//!
//! Each layer produces its own structured delta. The core records row-level
//! changes in a [`CoreChangeset`], each extension contributes an
//! [`ExtensionChangeset`], and [`Changeset::merge`] combines them into the
//! value the database hands to sibling connections. The reduced
//! [`ExternalChangeset`] travels on the public modified notification.

use crate::extension::ExtensionMap;
use crate::types::{CollectionKey, ConnectionId, Snapshot};
use ciborium::value::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Format version of [`Changeset`].
pub const CHANGESET_VERSION: u16 = 1;

/// How an object changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectChange {
    /// The object was written with this value.
    Set(Value),
    /// The object was touched; its value is unchanged.
    Touched,
}

/// How metadata changed.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataChange {
    /// Metadata was written; `None` means the row now has no metadata.
    Set(Option<Value>),
    /// Metadata was touched; its value is unchanged.
    Touched,
}

/// Row-level changes of one transaction, at full fidelity.
///
/// Applied in this order by a sibling connection: `all_keys_removed`, then
/// `removed_collections`, then `removed_keys`, then `objects` and
/// `metadata`. The `record_*` methods keep the fields consistent with that
/// order. A row removed and written again in one transaction stays in
/// `removed_keys`: it got a new rowid, so whatever a sibling cached under the
/// old one must go.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreChangeset {
    /// Object changes by row.
    pub objects: HashMap<CollectionKey, ObjectChange>,
    /// Metadata changes by row.
    pub metadata: HashMap<CollectionKey, MetadataChange>,
    /// Rows removed individually.
    pub removed_keys: HashSet<CollectionKey>,
    /// Collections removed as a whole.
    pub removed_collections: HashSet<String>,
    /// Every row of every collection was removed.
    pub all_keys_removed: bool,
}

impl CoreChangeset {
    /// Creates an empty changeset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
            && self.metadata.is_empty()
            && self.removed_keys.is_empty()
            && self.removed_collections.is_empty()
            && !self.all_keys_removed
    }

    /// Records a written object.
    pub fn record_object(&mut self, key: &CollectionKey, value: Value) {
        self.objects.insert(key.clone(), ObjectChange::Set(value));
    }

    /// Records written metadata.
    pub fn record_metadata(&mut self, key: &CollectionKey, value: Option<Value>) {
        self.metadata.insert(key.clone(), MetadataChange::Set(value));
    }

    /// Records a touched object, unless the object was already written.
    pub fn record_touch_object(&mut self, key: &CollectionKey) {
        self.objects
            .entry(key.clone())
            .or_insert(ObjectChange::Touched);
    }

    /// Records touched metadata, unless the metadata was already written.
    pub fn record_touch_metadata(&mut self, key: &CollectionKey) {
        self.metadata
            .entry(key.clone())
            .or_insert(MetadataChange::Touched);
    }

    /// Records a removed row.
    pub fn record_remove(&mut self, key: &CollectionKey) {
        self.objects.remove(key);
        self.metadata.remove(key);
        self.removed_keys.insert(key.clone());
    }

    /// Records a removed collection.
    pub fn record_remove_collection(&mut self, collection: &str) {
        self.objects.retain(|key, _| key.collection != collection);
        self.metadata.retain(|key, _| key.collection != collection);
        self.removed_keys.retain(|key| key.collection != collection);
        self.removed_collections.insert(collection.to_string());
    }

    /// Records removal of every row.
    pub fn record_remove_all(&mut self) {
        self.objects.clear();
        self.metadata.clear();
        self.removed_keys.clear();
        self.removed_collections.clear();
        self.all_keys_removed = true;
    }

    /// Whether a cached row at `key` must be dropped or refreshed.
    #[must_use]
    pub fn affects(&self, key: &CollectionKey) -> bool {
        self.all_keys_removed
            || self.removed_collections.contains(&key.collection)
            || self.removed_keys.contains(key)
            || self.objects.contains_key(key)
            || self.metadata.contains_key(key)
    }

    /// Builds the reduced, key-only form.
    #[must_use]
    pub fn to_external(
        &self,
        snapshot: Snapshot,
        extensions: BTreeMap<String, Value>,
    ) -> ExternalChangeset {
        ExternalChangeset {
            snapshot,
            changed_object_keys: self.objects.keys().cloned().collect(),
            changed_metadata_keys: self.metadata.keys().cloned().collect(),
            removed_keys: self.removed_keys.clone(),
            removed_collections: self.removed_collections.clone(),
            all_keys_removed: self.all_keys_removed,
            extensions,
        }
    }
}

/// One extension's contribution to a changeset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionChangeset {
    /// Payload for the extension's sibling connections.
    pub internal: Option<Value>,
    /// Payload for notification observers.
    pub external: Option<Value>,
}

/// Key-only description of a commit, safe for any observer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalChangeset {
    /// Snapshot produced by the commit.
    pub snapshot: Snapshot,
    /// Rows whose object was written or touched.
    pub changed_object_keys: HashSet<CollectionKey>,
    /// Rows whose metadata was written or touched.
    pub changed_metadata_keys: HashSet<CollectionKey>,
    /// Rows removed individually.
    pub removed_keys: HashSet<CollectionKey>,
    /// Collections removed as a whole.
    pub removed_collections: HashSet<String>,
    /// Every row was removed.
    pub all_keys_removed: bool,
    /// External payloads by extension name.
    pub extensions: BTreeMap<String, Value>,
}

impl ExternalChangeset {
    fn removed(&self, key: &CollectionKey) -> bool {
        self.all_keys_removed
            || self.removed_collections.contains(&key.collection)
            || self.removed_keys.contains(key)
    }

    /// Whether the commit changed nothing observable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.all_keys_removed
            && self.changed_object_keys.is_empty()
            && self.changed_metadata_keys.is_empty()
            && self.removed_keys.is_empty()
            && self.removed_collections.is_empty()
            && self.extensions.is_empty()
    }

    /// Whether the object at `key` in `collection` changed or was removed.
    #[must_use]
    pub fn has_object_change_for_key(&self, key: &str, collection: &str) -> bool {
        let key = CollectionKey::new(collection, key);
        self.changed_object_keys.contains(&key) || self.removed(&key)
    }

    /// Whether the metadata at `key` in `collection` changed or was removed.
    #[must_use]
    pub fn has_metadata_change_for_key(&self, key: &str, collection: &str) -> bool {
        let key = CollectionKey::new(collection, key);
        self.changed_metadata_keys.contains(&key) || self.removed(&key)
    }

    /// Whether anything about the row at `key` in `collection` changed.
    #[must_use]
    pub fn has_change_for_key(&self, key: &str, collection: &str) -> bool {
        let key = CollectionKey::new(collection, key);
        self.changed_object_keys.contains(&key)
            || self.changed_metadata_keys.contains(&key)
            || self.removed(&key)
    }

    /// Whether any of `keys` in `collection` changed.
    #[must_use]
    pub fn has_change_for_any_keys<I, S>(&self, keys: I, collection: &str) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter()
            .any(|key| self.has_change_for_key(key.as_ref(), collection))
    }

    /// Whether any row of `collection` changed.
    #[must_use]
    pub fn has_change_for_collection(&self, collection: &str) -> bool {
        self.all_keys_removed
            || self.removed_collections.contains(collection)
            || self
                .changed_object_keys
                .iter()
                .chain(&self.changed_metadata_keys)
                .chain(&self.removed_keys)
                .any(|key| key.collection == collection)
    }
}

/// The full changeset of one commit, as delivered to sibling connections.
#[derive(Debug, Clone)]
pub struct Changeset {
    /// Format version, [`CHANGESET_VERSION`].
    pub version: u16,
    /// Snapshot produced by the commit.
    pub snapshot: Snapshot,
    /// Connection that committed.
    pub origin: ConnectionId,
    /// Row changes.
    pub core: CoreChangeset,
    /// Internal extension payloads by extension name.
    pub extensions: BTreeMap<String, Value>,
    /// The extension map in force after this commit, if the commit changed it.
    pub registered_extensions: Option<Arc<ExtensionMap>>,
    /// Whether the commit wrote anything.
    pub has_disk_changes: bool,
    /// Reduced form for observers.
    pub external: Arc<ExternalChangeset>,
}

impl Changeset {
    /// Combines the core delta and the extension deltas of one commit.
    #[must_use]
    pub fn merge(
        snapshot: Snapshot,
        origin: ConnectionId,
        core: CoreChangeset,
        parts: BTreeMap<String, ExtensionChangeset>,
        registered_extensions: Option<Arc<ExtensionMap>>,
        has_disk_changes: bool,
    ) -> Self {
        let mut internal = BTreeMap::new();
        let mut external = BTreeMap::new();
        for (name, part) in parts {
            if let Some(value) = part.internal {
                internal.insert(name.clone(), value);
            }
            if let Some(value) = part.external {
                external.insert(name, value);
            }
        }
        let external = Arc::new(core.to_external(snapshot, external));
        Self {
            version: CHANGESET_VERSION,
            snapshot,
            origin,
            core,
            extensions: internal,
            registered_extensions,
            has_disk_changes,
            external,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(c: &str, k: &str) -> CollectionKey {
        CollectionKey::new(c, k)
    }

    fn text(s: &str) -> Value {
        Value::Text(s.into())
    }

    #[test]
    fn set_after_remove_keeps_removal() {
        let mut cs = CoreChangeset::new();
        cs.record_remove(&key("notes", "1"));
        cs.record_object(&key("notes", "1"), text("again"));
        assert!(cs.removed_keys.contains(&key("notes", "1")));
        assert_eq!(
            cs.objects.get(&key("notes", "1")),
            Some(&ObjectChange::Set(text("again")))
        );
    }

    #[test]
    fn touch_does_not_hide_a_write() {
        let mut cs = CoreChangeset::new();
        cs.record_object(&key("c", "k"), text("v"));
        cs.record_touch_object(&key("c", "k"));
        assert_eq!(cs.objects[&key("c", "k")], ObjectChange::Set(text("v")));

        cs.record_touch_metadata(&key("c", "j"));
        assert_eq!(cs.metadata[&key("c", "j")], MetadataChange::Touched);
    }

    #[test]
    fn remove_collection_subsumes_row_changes() {
        let mut cs = CoreChangeset::new();
        cs.record_object(&key("users", "a"), text("1"));
        cs.record_remove(&key("users", "b"));
        cs.record_object(&key("products", "p"), text("2"));
        cs.record_remove_collection("users");

        assert_eq!(cs.objects.len(), 1);
        assert!(cs.removed_keys.is_empty());
        assert!(cs.affects(&key("users", "zzz")));
        assert!(!cs.affects(&key("other", "a")));
    }

    #[test]
    fn external_queries() {
        let mut cs = CoreChangeset::new();
        cs.record_object(&key("notes", "1"), text("hello"));
        cs.record_metadata(&key("notes", "2"), None);
        cs.record_remove_collection("trash");
        let external = cs.to_external(Snapshot::new(3), BTreeMap::new());

        assert!(external.has_object_change_for_key("1", "notes"));
        assert!(!external.has_metadata_change_for_key("1", "notes"));
        assert!(external.has_metadata_change_for_key("2", "notes"));
        assert!(external.has_change_for_key("anything", "trash"));
        assert!(external.has_change_for_any_keys(["9", "1"], "notes"));
        assert!(external.has_change_for_collection("notes"));
        assert!(!external.has_change_for_collection("users"));
    }

    #[test]
    fn merge_splits_extension_payloads() {
        let mut parts = BTreeMap::new();
        parts.insert(
            "by_tag".to_string(),
            ExtensionChangeset {
                internal: Some(text("internal")),
                external: Some(text("external")),
            },
        );
        parts.insert(
            "quiet".to_string(),
            ExtensionChangeset {
                internal: Some(text("only internal")),
                external: None,
            },
        );
        let cs = Changeset::merge(
            Snapshot::new(9),
            ConnectionId::new(),
            CoreChangeset::new(),
            parts,
            None,
            true,
        );
        assert_eq!(cs.version, CHANGESET_VERSION);
        assert_eq!(cs.extensions.len(), 2);
        assert_eq!(cs.external.extensions.len(), 1);
        assert_eq!(cs.external.snapshot, Snapshot::new(9));
    }
}
