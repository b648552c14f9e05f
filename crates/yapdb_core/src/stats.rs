//! Database statistics.
//!
//! # Usage
//!
//! ```rust,ignore
//! let db = Database::open_in_memory(DatabaseOptions::default())?;
//! let conn = db.new_connection();
//! conn.read_write(|txn| txn.set_object("1", "notes", "hello".into()))?;
//!
//! let stats = db.stats();
//! println!("commits: {}", stats.commits());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Database-wide counters.
///
/// All counters are atomic and can be read while transactions are running.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    read_transactions: AtomicU64,
    read_write_transactions: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    changesets_delivered: AtomicU64,
    catch_up_replays: AtomicU64,
    cache_invalidations: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    checkpoints: AtomicU64,
    extension_registrations: AtomicU64,
}

impl DatabaseStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read_transaction(&self) {
        self.read_transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_write_transaction(&self) {
        self.read_write_transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Records changesets handed to sibling connections by one commit.
    pub(crate) fn record_changesets_delivered(&self, count: u64) {
        self.changesets_delivered.fetch_add(count, Ordering::Relaxed);
    }

    /// Records a catch-up that replayed `count` changesets.
    pub(crate) fn record_catch_up_replay(&self, count: u64) {
        self.catch_up_replays.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_invalidation(&self) {
        self.cache_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds in a connection's cache counters.
    pub(crate) fn record_cache_lookups(&self, hits: u64, misses: u64) {
        self.cache_hits.fetch_add(hits, Ordering::Relaxed);
        self.cache_misses.fetch_add(misses, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_extension_registration(&self) {
        self.extension_registrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of committed read-write transactions.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Returns the total number of checkpoints.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_transactions: self.read_transactions.load(Ordering::Relaxed),
            read_write_transactions: self.read_write_transactions.load(Ordering::Relaxed),
            commits: self.commits(),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            changesets_delivered: self.changesets_delivered.load(Ordering::Relaxed),
            catch_up_replays: self.catch_up_replays.load(Ordering::Relaxed),
            cache_invalidations: self.cache_invalidations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            checkpoints: self.checkpoints(),
            extension_registrations: self.extension_registrations.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`DatabaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Read transactions begun.
    pub read_transactions: u64,
    /// Read-write transactions begun.
    pub read_write_transactions: u64,
    /// Read-write transactions committed.
    pub commits: u64,
    /// Read-write transactions rolled back.
    pub rollbacks: u64,
    /// Changesets queued for sibling connections.
    pub changesets_delivered: u64,
    /// Changesets folded in during catch-up.
    pub catch_up_replays: u64,
    /// Catch-ups that dropped caches instead of replaying.
    pub cache_invalidations: u64,
    /// Row cache hits, reported when transactions end.
    pub cache_hits: u64,
    /// Row cache misses, reported when transactions end.
    pub cache_misses: u64,
    /// Checkpoints performed.
    pub checkpoints: u64,
    /// Successful extension registrations.
    pub extension_registrations: u64,
}
