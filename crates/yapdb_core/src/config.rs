//! Database and connection configuration.

use std::time::Duration;

/// What to do when the database files fail to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorruptAction {
    /// Return the error from `open`.
    #[default]
    Fail,
    /// Move the damaged files aside and start an empty database.
    Rename,
    /// Delete the damaged files and start an empty database.
    Delete,
}

/// How hard a commit pushes the WAL to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Synchronous {
    /// Leave buffering to the OS. A crash may lose recent commits.
    Off,
    /// Flush the WAL on commit, sync at checkpoint.
    #[default]
    Normal,
    /// Sync the WAL on every commit.
    Full,
}

/// Whether a connection's caches are filled by reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Cache values fetched from the engine.
    pub populate_on_read: bool,
    /// Cache values written by this connection's transactions.
    pub populate_on_write: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            populate_on_read: true,
            populate_on_write: true,
        }
    }
}

/// Per-connection cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Whether the object cache is used.
    pub object_cache_enabled: bool,
    /// Maximum number of cached objects. Zero means unlimited.
    pub object_cache_limit: usize,
    /// Whether the metadata cache is used.
    pub metadata_cache_enabled: bool,
    /// Maximum number of cached metadata values. Zero means unlimited.
    pub metadata_cache_limit: usize,
    /// Population policy for the object cache.
    pub object_policy: CachePolicy,
    /// Population policy for the metadata cache.
    pub metadata_policy: CachePolicy,
    /// Maximum number of cached rowid lookups. Zero means unlimited.
    pub key_cache_limit: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            object_cache_enabled: true,
            object_cache_limit: 250,
            metadata_cache_enabled: true,
            metadata_cache_limit: 500,
            object_policy: CachePolicy::default(),
            metadata_policy: CachePolicy::default(),
            key_cache_limit: 500,
        }
    }
}

impl ConnectionConfig {
    /// Creates the default connection configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables the object cache.
    #[must_use]
    pub const fn object_cache_enabled(mut self, value: bool) -> Self {
        self.object_cache_enabled = value;
        self
    }

    /// Sets the object cache limit.
    #[must_use]
    pub const fn object_cache_limit(mut self, limit: usize) -> Self {
        self.object_cache_limit = limit;
        self
    }

    /// Enables or disables the metadata cache.
    #[must_use]
    pub const fn metadata_cache_enabled(mut self, value: bool) -> Self {
        self.metadata_cache_enabled = value;
        self
    }

    /// Sets the metadata cache limit.
    #[must_use]
    pub const fn metadata_cache_limit(mut self, limit: usize) -> Self {
        self.metadata_cache_limit = limit;
        self
    }

    /// Sets the object cache policy.
    #[must_use]
    pub const fn object_policy(mut self, policy: CachePolicy) -> Self {
        self.object_policy = policy;
        self
    }

    /// Sets the metadata cache policy.
    #[must_use]
    pub const fn metadata_policy(mut self, policy: CachePolicy) -> Self {
        self.metadata_policy = policy;
        self
    }

    /// Sets the rowid lookup cache limit.
    #[must_use]
    pub const fn key_cache_limit(mut self, limit: usize) -> Self {
        self.key_cache_limit = limit;
        self
    }
}

/// Construction-time options for a [`crate::Database`].
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Create the directory if it does not exist.
    pub create_if_missing: bool,

    /// Recovery policy for corrupt files.
    pub corrupt_action: CorruptAction,

    /// Durability level of commits.
    pub synchronous: Synchronous,

    /// Read buffer size used when scanning the WAL and main store.
    pub page_size: usize,

    /// Memory-map size hint. Recorded and reported, the engine does not map
    /// files.
    pub mmap_size: u64,

    /// Assume other processes may write the same files.
    ///
    /// Connections then invalidate their caches on catch-up instead of
    /// folding changesets in.
    pub multiprocess: bool,

    /// Run an async checkpoint every this many commits. Zero disables.
    pub auto_checkpoint_interval: u64,

    /// Catch-up replays at most this many changesets; a connection further
    /// behind drops its caches instead.
    pub max_replay_changesets: usize,

    /// Number of modified notifications kept for `poll`.
    pub notification_history: usize,

    /// Maximum number of idle engine handles kept in the pool.
    pub max_connection_pool_count: usize,

    /// Idle handles older than this are closed. Zero disables the check.
    pub connection_pool_lifetime: Duration,

    /// Configuration given to connections created without one.
    pub connection_defaults: ConnectionConfig,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            corrupt_action: CorruptAction::Fail,
            synchronous: Synchronous::Normal,
            page_size: 4096,
            mmap_size: 0,
            multiprocess: false,
            auto_checkpoint_interval: 64,
            max_replay_changesets: 128,
            notification_history: 1024,
            max_connection_pool_count: 5,
            connection_pool_lifetime: Duration::from_secs(90),
            connection_defaults: ConnectionConfig::default(),
        }
    }
}

impl DatabaseOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the corrupt-database action.
    #[must_use]
    pub const fn corrupt_action(mut self, action: CorruptAction) -> Self {
        self.corrupt_action = action;
        self
    }

    /// Sets the synchronous level.
    #[must_use]
    pub const fn synchronous(mut self, level: Synchronous) -> Self {
        self.synchronous = level;
        self
    }

    /// Sets the page size.
    #[must_use]
    pub const fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the memory-map size hint.
    #[must_use]
    pub const fn mmap_size(mut self, size: u64) -> Self {
        self.mmap_size = size;
        self
    }

    /// Enables multiprocess mode.
    #[must_use]
    pub const fn multiprocess(mut self, value: bool) -> Self {
        self.multiprocess = value;
        self
    }

    /// Sets the auto-checkpoint interval.
    #[must_use]
    pub const fn auto_checkpoint_interval(mut self, commits: u64) -> Self {
        self.auto_checkpoint_interval = commits;
        self
    }

    /// Sets the catch-up replay bound.
    #[must_use]
    pub const fn max_replay_changesets(mut self, count: usize) -> Self {
        self.max_replay_changesets = count;
        self
    }

    /// Sets the notification history size.
    #[must_use]
    pub const fn notification_history(mut self, count: usize) -> Self {
        self.notification_history = count;
        self
    }

    /// Sets the maximum number of pooled engine handles.
    #[must_use]
    pub const fn max_connection_pool_count(mut self, count: usize) -> Self {
        self.max_connection_pool_count = count;
        self
    }

    /// Sets the pooled handle lifetime.
    #[must_use]
    pub const fn connection_pool_lifetime(mut self, lifetime: Duration) -> Self {
        self.connection_pool_lifetime = lifetime;
        self
    }

    /// Sets the default connection configuration.
    #[must_use]
    pub const fn connection_defaults(mut self, config: ConnectionConfig) -> Self {
        self.connection_defaults = config;
        self
    }
}
