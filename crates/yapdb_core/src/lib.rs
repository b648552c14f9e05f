//! # yapdb core
//!
//! An embedded collection/key/value store with snapshot isolation.
//!
//! - [`Database`] owns the storage engine and publishes a monotonically
//!   increasing [`Snapshot`] per commit.
//! - [`Connection`]s run transactions one at a time over private caches and
//!   catch up with their siblings through per-commit [`Changeset`]s.
//! - [`Transaction`]s read and write objects and metadata, and refuse
//!   mutations of a collection they are enumerating.
//! - [`Extension`]s receive a hook for every row mutation and keep their own
//!   tables in the same physical transaction.
//! - [`ConnectionProxy`] trades durability for latency with buffered writes.
//!
//! ```rust,ignore
//! use yapdb_core::{Database, DatabaseOptions};
//!
//! let db = Database::open("notes.yapdb", DatabaseOptions::default())?;
//! let conn = db.new_connection();
//! conn.read_write(|txn| txn.set_object("1", "notes", "hello".into()))?;
//! let note = conn.read(|txn| txn.object("1", "notes"))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod changeset;
mod config;
mod connection;
mod database;
mod dir;
pub mod engine;
mod error;
pub mod extension;
mod manifest;
mod notification;
mod proxy;
mod serialization;
mod stats;
mod transaction;
mod types;

pub use changeset::{
    Changeset, CoreChangeset, ExtensionChangeset, ExternalChangeset, MetadataChange, ObjectChange,
};
pub use config::{CachePolicy, ConnectionConfig, CorruptAction, DatabaseOptions, Synchronous};
pub use connection::{CacheCounters, Connection, FlushLevel, LruCache, RowCaches};
pub use database::{Database, DatabaseBuilder};
pub use dir::DatabaseDir;
pub use engine::{CheckpointReport, PoolStats, StorageEngine};
pub use error::{CoreError, CoreResult};
pub use extension::{
    ExtView, Extension, ExtensionConnection, ExtensionMap, ExtensionTransaction, IndexBlock,
    IndexValue, ReadTables, SecondaryIndex, WriteTables,
};
pub use manifest::Manifest;
pub use notification::{ModifiedNotification, NotificationCenter};
pub use proxy::ConnectionProxy;
pub use serialization::{
    cbor_deserialize, cbor_serialize, from_value, to_value, Deserializer, PostSanitizer,
    PreSanitizer, Serialization, Serializer, ValueCodec,
};
pub use stats::{DatabaseStats, StatsSnapshot};
pub use transaction::{KeyFilter, ReadTransaction, ReadWriteTransaction, Transaction};
pub use types::{CollectionKey, ConnectionId, RowId, Snapshot, TransactionId};

pub use ciborium::value::Value;

/// Version of the core crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
