//! # yapdb storage
//!
//! Byte stores underneath the yapdb engine.
//!
//! Backends know nothing about WAL records, row versions, or snapshots. The
//! engine in `yapdb_core` owns every format; a backend only stores bytes and
//! makes them durable on request.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] for tests and in-memory databases
//! - [`FileBackend`] for persistent storage using OS file APIs
//! - [`ObservedBackend`] wraps any backend and reports disk activity to a
//!   [`DiskActivityObserver`]
//!
//! ## Example
//!
//! ```rust
//! use yapdb_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"row bytes").unwrap();
//! assert_eq!(backend.read_at(offset, 9).unwrap(), b"row bytes");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod observed;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use observed::{DiskActivity, DiskActivityObserver, ObservedBackend};
