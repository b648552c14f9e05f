//! Connection-private row caches.

use crate::changeset::{Changeset, MetadataChange, ObjectChange};
use crate::config::{CachePolicy, ConnectionConfig};
use crate::types::{CollectionKey, RowId};
use ciborium::value::Value;
use std::collections::HashMap;
use std::hash::Hash;

/// Least-recently-used map.
///
/// Entries live in a vector and are linked into a recency list by index.
/// A capacity of zero means unlimited.
pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    entries: Vec<Entry<K, V>>,
    head: Option<usize>,
    tail: Option<usize>,
    capacity: usize,
}

struct Entry<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            entries: Vec::new(),
            head: None,
            tail: None,
            capacity,
        }
    }

    /// Returns the value and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.move_to_front(idx);
        Some(&self.entries[idx].value)
    }

    /// Returns the value without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.map.get(key).map(|&idx| &self.entries[idx].value)
    }

    /// Whether `key` is cached.
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Inserts or replaces a value, evicting the least recently used entry
    /// when full.
    pub fn put(&mut self, key: K, value: V) {
        if let Some(&idx) = self.map.get(&key) {
            self.entries[idx].value = value;
            self.move_to_front(idx);
            return;
        }
        if self.capacity > 0 && self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        let idx = self.entries.len();
        self.entries.push(Entry {
            key: key.clone(),
            value,
            prev: None,
            next: self.head,
        });
        if let Some(old_head) = self.head {
            self.entries[old_head].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.map.insert(key, idx);
    }

    /// Replaces the value only if `key` is already cached.
    pub fn update(&mut self, key: &K, value: V) -> bool {
        match self.map.get(key) {
            Some(&idx) => {
                self.entries[idx].value = value;
                true
            }
            None => false,
        }
    }

    /// Removes an entry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.map.remove(key)?;
        Some(self.remove_index(idx).value)
    }

    /// Keeps only the entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        let doomed: Vec<K> = self
            .entries
            .iter()
            .filter(|entry| !keep(&entry.key, &entry.value))
            .map(|entry| entry.key.clone())
            .collect();
        for key in doomed {
            self.remove(&key);
        }
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.map.clear();
        self.entries.clear();
        self.head = None;
        self.tail = None;
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current capacity, zero meaning unlimited.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes the capacity, evicting as needed.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        if capacity > 0 {
            self.shrink_to(capacity);
        }
    }

    /// Evicts least recently used entries until at most `len` remain.
    pub fn shrink_to(&mut self, len: usize) {
        while self.entries.len() > len {
            self.evict_lru();
        }
    }

    /// Keys from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.entries.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            keys.push(self.entries[idx].key.clone());
            cursor = self.entries[idx].next;
        }
        keys
    }

    fn evict_lru(&mut self) {
        if let Some(tail) = self.tail {
            let key = self.entries[tail].key.clone();
            self.map.remove(&key);
            self.remove_index(tail);
        }
    }

    fn remove_index(&mut self, idx: usize) -> Entry<K, V> {
        self.unlink(idx);
        let entry = self.entries.swap_remove(idx);
        if idx < self.entries.len() {
            // The former last entry now lives at `idx`.
            let moved_key = self.entries[idx].key.clone();
            self.map.insert(moved_key, idx);
            match self.entries[idx].prev {
                Some(prev) => self.entries[prev].next = Some(idx),
                None => self.head = Some(idx),
            }
            match self.entries[idx].next {
                Some(next) => self.entries[next].prev = Some(idx),
                None => self.tail = Some(idx),
            }
        }
        entry
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.entries[idx].prev = None;
        self.entries[idx].next = self.head;
        if let Some(old_head) = self.head {
            self.entries[old_head].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.entries[idx].prev;
        let next = self.entries[idx].next;
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
    }
}

/// Cache hit and miss counters of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    /// Lookups answered from cache.
    pub hits: u64,
    /// Lookups that went to the engine.
    pub misses: u64,
}

/// The object, metadata and rowid caches of one connection.
///
/// Entries are always correct for the connection's snapshot. Metadata entries
/// hold `None` for a row known to have no metadata.
pub struct RowCaches {
    objects: LruCache<CollectionKey, Value>,
    metadata: LruCache<CollectionKey, Option<Value>>,
    keys: LruCache<RowId, CollectionKey>,
    object_enabled: bool,
    metadata_enabled: bool,
    object_policy: CachePolicy,
    metadata_policy: CachePolicy,
    counters: CacheCounters,
}

impl RowCaches {
    /// Creates empty caches.
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            objects: LruCache::new(config.object_cache_limit),
            metadata: LruCache::new(config.metadata_cache_limit),
            keys: LruCache::new(config.key_cache_limit),
            object_enabled: config.object_cache_enabled,
            metadata_enabled: config.metadata_cache_enabled,
            object_policy: config.object_policy,
            metadata_policy: config.metadata_policy,
            counters: CacheCounters::default(),
        }
    }

    /// Applies new settings, dropping whatever no longer fits.
    pub fn configure(&mut self, config: &ConnectionConfig) {
        self.object_enabled = config.object_cache_enabled;
        self.metadata_enabled = config.metadata_cache_enabled;
        self.object_policy = config.object_policy;
        self.metadata_policy = config.metadata_policy;
        self.objects.set_capacity(config.object_cache_limit);
        self.metadata.set_capacity(config.metadata_cache_limit);
        self.keys.set_capacity(config.key_cache_limit);
        if !self.object_enabled {
            self.objects.clear();
        }
        if !self.metadata_enabled {
            self.metadata.clear();
        }
    }

    /// Cached object.
    pub fn object(&mut self, key: &CollectionKey) -> Option<Value> {
        let found = if self.object_enabled {
            self.objects.get(key).cloned()
        } else {
            None
        };
        self.count(found.is_some());
        found
    }

    /// Cached metadata. The outer `Option` is the cache hit.
    pub fn metadata(&mut self, key: &CollectionKey) -> Option<Option<Value>> {
        let found = if self.metadata_enabled {
            self.metadata.get(key).cloned()
        } else {
            None
        };
        self.count(found.is_some());
        found
    }

    fn count(&mut self, hit: bool) {
        if hit {
            self.counters.hits += 1;
        } else {
            self.counters.misses += 1;
        }
    }

    /// Caches an object fetched from the engine.
    pub fn fill_object(&mut self, key: &CollectionKey, value: &Value) {
        if self.object_enabled && self.object_policy.populate_on_read {
            self.objects.put(key.clone(), value.clone());
        }
    }

    /// Caches metadata fetched from the engine.
    pub fn fill_metadata(&mut self, key: &CollectionKey, value: &Option<Value>) {
        if self.metadata_enabled && self.metadata_policy.populate_on_read {
            self.metadata.put(key.clone(), value.clone());
        }
    }

    /// Records an object written by this connection.
    pub fn wrote_object(&mut self, key: &CollectionKey, value: &Value) {
        if !self.object_enabled {
            return;
        }
        if self.object_policy.populate_on_write {
            self.objects.put(key.clone(), value.clone());
        } else {
            self.objects.remove(key);
        }
    }

    /// Records metadata written by this connection.
    pub fn wrote_metadata(&mut self, key: &CollectionKey, value: &Option<Value>) {
        if !self.metadata_enabled {
            return;
        }
        if self.metadata_policy.populate_on_write {
            self.metadata.put(key.clone(), value.clone());
        } else {
            self.metadata.remove(key);
        }
    }

    /// Cached address of a rowid.
    pub fn key_for_rowid(&mut self, rowid: RowId) -> Option<CollectionKey> {
        let found = self.keys.get(&rowid).cloned();
        self.count(found.is_some());
        found
    }

    /// Remembers the address of a rowid.
    pub fn fill_key(&mut self, rowid: RowId, key: &CollectionKey) {
        self.keys.put(rowid, key.clone());
    }

    /// Forgets one row.
    pub fn remove(&mut self, key: &CollectionKey) {
        self.objects.remove(key);
        self.metadata.remove(key);
        self.keys.retain(|_, cached| cached != key);
    }

    /// Forgets one collection.
    pub fn remove_collection(&mut self, collection: &str) {
        self.objects.retain(|key, _| key.collection != collection);
        self.metadata.retain(|key, _| key.collection != collection);
        self.keys.retain(|_, key| key.collection != collection);
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.metadata.clear();
        self.keys.clear();
    }

    /// Halves every cache, keeping the most recently used entries.
    pub fn trim(&mut self) {
        self.objects.shrink_to(self.objects.len() / 2);
        self.metadata.shrink_to(self.metadata.len() / 2);
        self.keys.shrink_to(self.keys.len() / 2);
    }

    /// Folds in a changeset committed by another connection.
    ///
    /// Removed rows are evicted. Written rows that are cached are refreshed;
    /// uncached rows stay uncached. Touches change nothing.
    pub fn apply(&mut self, changeset: &Changeset) {
        let core = &changeset.core;
        if core.all_keys_removed {
            self.clear();
        }
        for collection in &core.removed_collections {
            self.remove_collection(collection);
        }
        for key in &core.removed_keys {
            self.remove(key);
        }
        for (key, change) in &core.objects {
            if let ObjectChange::Set(value) = change {
                self.objects.update(key, value.clone());
            }
        }
        for (key, change) in &core.metadata {
            if let MetadataChange::Set(value) = change {
                self.metadata.update(key, value.clone());
            }
        }
    }

    /// Number of cached objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Number of cached metadata entries.
    pub fn metadata_count(&self) -> usize {
        self.metadata.len()
    }

    /// Whether the object for `key` is cached, without touching recency.
    pub fn has_object(&self, key: &CollectionKey) -> bool {
        self.objects.contains(key)
    }

    /// Cached object without touching recency or counters.
    pub fn peek_object(&self, key: &CollectionKey) -> Option<&Value> {
        self.objects.peek(key)
    }

    /// Cached metadata without touching recency or counters.
    pub fn peek_metadata(&self, key: &CollectionKey) -> Option<&Option<Value>> {
        self.metadata.peek(key)
    }

    /// Hit and miss counters since the last call, resetting them.
    pub fn take_counters(&mut self) -> CacheCounters {
        std::mem::take(&mut self.counters)
    }
}
