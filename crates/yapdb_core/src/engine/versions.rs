//! Multi-version row storage.
//!
//! Each row keeps a chain of `(snapshot, value)` versions in ascending
//! snapshot order. A reader pinned at snapshot `N` sees the newest version
//! at or below `N`; `None` versions are deletions.

use super::wal::WriteOp;
use crate::types::{CollectionKey, RowId, Snapshot};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// The bytes of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Stable row identifier.
    pub rowid: RowId,
    /// Serialized object.
    pub data: Vec<u8>,
    /// Serialized metadata, if any.
    pub metadata: Option<Vec<u8>>,
}

#[derive(Debug, Default, Clone)]
struct VersionChain {
    versions: Vec<(Snapshot, Option<Arc<StoredRow>>)>,
}

impl VersionChain {
    fn at(&self, snapshot: Snapshot) -> Option<&Arc<StoredRow>> {
        self.versions
            .iter()
            .rev()
            .find(|(s, _)| *s <= snapshot)
            .and_then(|(_, row)| row.as_ref())
    }

    fn latest(&self) -> Option<&Arc<StoredRow>> {
        self.versions.last().and_then(|(_, row)| row.as_ref())
    }

    fn push(&mut self, snapshot: Snapshot, row: Option<Arc<StoredRow>>) {
        match self.versions.last_mut() {
            Some((last, value)) if *last == snapshot => *value = row,
            _ => self.versions.push((snapshot, row)),
        }
    }

    /// Drops versions nobody at or after `oldest` can see. Returns true if
    /// the chain is a bare deletion afterwards and can be removed.
    fn prune(&mut self, oldest: Snapshot) -> bool {
        let visible_from = self
            .versions
            .iter()
            .rposition(|(s, _)| *s <= oldest)
            .unwrap_or(0);
        self.versions.drain(..visible_from);
        self.versions.len() == 1 && self.versions[0].1.is_none()
    }
}

#[derive(Debug, Default, Clone)]
struct TableVersions {
    /// Existence history, for create/drop.
    existence: Vec<(Snapshot, bool)>,
    rows: BTreeMap<CollectionKey, VersionChain>,
    rowids: HashMap<RowId, CollectionKey>,
}

impl TableVersions {
    fn exists_at(&self, snapshot: Snapshot) -> bool {
        self.existence
            .iter()
            .rev()
            .find(|(s, _)| *s <= snapshot)
            .is_some_and(|(_, exists)| *exists)
    }

    fn set_exists(&mut self, snapshot: Snapshot, exists: bool) {
        match self.existence.last_mut() {
            Some((last, value)) if *last == snapshot => *value = exists,
            _ => self.existence.push((snapshot, exists)),
        }
    }

    fn delete_where(&mut self, snapshot: Snapshot, pred: impl Fn(&CollectionKey) -> bool) {
        for (key, chain) in &mut self.rows {
            if pred(key) && chain.latest().is_some() {
                chain.push(snapshot, None);
            }
        }
    }

    fn collection_range<'a>(
        &'a self,
        collection: &'a str,
    ) -> impl Iterator<Item = (&'a CollectionKey, &'a VersionChain)> + 'a {
        let start = CollectionKey::new(collection, "");
        self.rows
            .range(start..)
            .take_while(move |(key, _)| key.collection == collection)
    }
}

/// All tables, versioned by snapshot.
#[derive(Debug, Default, Clone)]
pub struct VersionedTables {
    tables: BTreeMap<String, TableVersions>,
}

impl VersionedTables {
    /// Creates an empty set of tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one committed transaction at `snapshot`.
    pub fn apply(&mut self, ops: &[WriteOp], snapshot: Snapshot) {
        for op in ops {
            self.apply_one(op, snapshot);
        }
    }

    fn table_mut(&mut self, name: &str, snapshot: Snapshot) -> &mut TableVersions {
        let table = self.tables.entry(name.to_string()).or_default();
        if !table.exists_at(snapshot) {
            table.set_exists(snapshot, true);
        }
        table
    }

    fn apply_one(&mut self, op: &WriteOp, snapshot: Snapshot) {
        match op {
            WriteOp::Put { table, key, row } => {
                let table = self.table_mut(table, snapshot);
                table.rowids.insert(row.rowid, key.clone());
                table
                    .rows
                    .entry(key.clone())
                    .or_default()
                    .push(snapshot, Some(Arc::clone(row)));
            }
            WriteOp::Delete { table, key } => {
                if let Some(chain) = self
                    .tables
                    .get_mut(table)
                    .and_then(|t| t.rows.get_mut(key))
                {
                    chain.push(snapshot, None);
                }
            }
            WriteOp::ClearCollection { table, collection } => {
                if let Some(table) = self.tables.get_mut(table) {
                    table.delete_where(snapshot, |key| key.collection == *collection);
                }
            }
            WriteOp::ClearTable { table } => {
                if let Some(table) = self.tables.get_mut(table) {
                    table.delete_where(snapshot, |_| true);
                }
            }
            WriteOp::CreateTable { table } => {
                self.table_mut(table, snapshot);
            }
            WriteOp::DropTable { table } => {
                if let Some(table) = self.tables.get_mut(table) {
                    table.delete_where(snapshot, |_| true);
                    table.set_exists(snapshot, false);
                }
            }
        }
    }

    /// Row visible at `snapshot`.
    pub fn get(&self, table: &str, key: &CollectionKey, snapshot: Snapshot) -> Option<Arc<StoredRow>> {
        self.tables.get(table)?.rows.get(key)?.at(snapshot).cloned()
    }

    /// Row with `rowid` visible at `snapshot`.
    pub fn get_by_rowid(
        &self,
        table: &str,
        rowid: RowId,
        snapshot: Snapshot,
    ) -> Option<(CollectionKey, Arc<StoredRow>)> {
        let table = self.tables.get(table)?;
        let key = table.rowids.get(&rowid)?;
        let row = table.rows.get(key)?.at(snapshot)?;
        (row.rowid == rowid).then(|| (key.clone(), Arc::clone(row)))
    }

    /// Keys of `collection` visible at `snapshot`, in key order.
    pub fn keys_in_collection(&self, table: &str, collection: &str, snapshot: Snapshot) -> Vec<String> {
        self.tables.get(table).map_or_else(Vec::new, |t| {
            t.collection_range(collection)
                .filter(|(_, chain)| chain.at(snapshot).is_some())
                .map(|(key, _)| key.key.clone())
                .collect()
        })
    }

    /// Collections with at least one visible row, in order.
    pub fn collections(&self, table: &str, snapshot: Snapshot) -> Vec<String> {
        let mut out = BTreeSet::new();
        if let Some(t) = self.tables.get(table) {
            for (key, chain) in &t.rows {
                if chain.at(snapshot).is_some() {
                    out.insert(key.collection.clone());
                }
            }
        }
        out.into_iter().collect()
    }

    /// Every visible row address of a table, in order.
    pub fn keys(&self, table: &str, snapshot: Snapshot) -> Vec<CollectionKey> {
        self.tables.get(table).map_or_else(Vec::new, |t| {
            t.rows
                .iter()
                .filter(|(_, chain)| chain.at(snapshot).is_some())
                .map(|(key, _)| key.clone())
                .collect()
        })
    }

    /// Whether the table exists at `snapshot`.
    pub fn table_exists(&self, table: &str, snapshot: Snapshot) -> bool {
        self.tables.get(table).is_some_and(|t| t.exists_at(snapshot))
    }

    /// Names of tables existing at `snapshot`.
    pub fn table_names(&self, snapshot: Snapshot) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, t)| t.exists_at(snapshot))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Materializes the state at `snapshot` as `(table, key, row)` triples,
    /// plus the names of empty tables.
    pub fn image_at(&self, snapshot: Snapshot) -> (Vec<(String, CollectionKey, Arc<StoredRow>)>, Vec<String>) {
        let mut rows = Vec::new();
        let mut empty = Vec::new();
        for (name, table) in &self.tables {
            if !table.exists_at(snapshot) {
                continue;
            }
            let before = rows.len();
            for (key, chain) in &table.rows {
                if let Some(row) = chain.at(snapshot) {
                    rows.push((name.clone(), key.clone(), Arc::clone(row)));
                }
            }
            if rows.len() == before {
                empty.push(name.clone());
            }
        }
        (rows, empty)
    }

    /// Forgets versions no reader at or after `oldest` can observe.
    pub fn prune(&mut self, oldest: Snapshot) {
        self.tables.retain(|_, table| {
            let dead: Vec<CollectionKey> = table
                .rows
                .iter_mut()
                .filter_map(|(key, chain)| chain.prune(oldest).then(|| key.clone()))
                .collect();
            for key in dead {
                table.rows.remove(&key);
            }
            let rows = &table.rows;
            table.rowids.retain(|_, key| rows.contains_key(key));

            let keep_from = table
                .existence
                .iter()
                .rposition(|(s, _)| *s <= oldest)
                .unwrap_or(0);
            table.existence.drain(..keep_from);
            !(table.existence.len() == 1 && !table.existence[0].1 && table.rows.is_empty())
        });
    }

    /// Total number of stored versions. Used by tests and stats.
    pub fn version_count(&self) -> usize {
        self.tables
            .values()
            .flat_map(|t| t.rows.values())
            .map(|chain| chain.versions.len())
            .sum()
    }

    /// Highest rowid present in any table.
    pub fn max_rowid(&self) -> u64 {
        self.tables
            .values()
            .flat_map(|t| t.rowids.keys())
            .map(|rowid| rowid.as_u64())
            .max()
            .unwrap_or(0)
    }
}
