//! Error types for the yapdb core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the database, its connections and transactions.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] yapdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A value could not be serialized.
    #[error("serialization failed for {collection}/{key}: {message}")]
    Serialization {
        /// Collection of the row.
        collection: String,
        /// Key of the row.
        key: String,
        /// Serializer message.
        message: String,
    },

    /// Stored bytes could not be deserialized.
    #[error("deserialization failed for {collection}/{key}: {message}")]
    Deserialization {
        /// Collection of the row.
        collection: String,
        /// Key of the row.
        key: String,
        /// Deserializer message.
        message: String,
    },

    /// A pre-sanitizer rejected a value.
    #[error("sanitizer rejected {collection}/{key}: {reason}")]
    SanitizerRejected {
        /// Collection of the row.
        collection: String,
        /// Key of the row.
        key: String,
        /// Reason given by the sanitizer.
        reason: String,
    },

    /// The write-ahead log is corrupted.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// The main store is corrupted.
    #[error("store corruption: {message}")]
    StoreCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Another process holds the database directory.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// The database has been dropped while a connection still exists.
    #[error("database is closed")]
    DatabaseClosed,

    /// A collection was mutated while the same transaction enumerated it.
    #[error("collection {collection:?} mutated during enumeration")]
    MutationDuringEnumeration {
        /// The enumerated collection, or `None` for an all-collections
        /// enumeration.
        collection: Option<String>,
    },

    /// An extension could not be registered.
    #[error("cannot register extension {name:?}: {reason}")]
    ExtensionRegistration {
        /// Requested extension name.
        name: String,
        /// Why registration was refused.
        reason: String,
    },

    /// No extension is registered under the name.
    #[error("extension not registered: {name}")]
    ExtensionNotFound {
        /// The requested name.
        name: String,
    },

    /// An extension hook failed.
    #[error("extension {name:?} failed: {message}")]
    ExtensionFailure {
        /// Extension name.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates a store corruption error.
    pub fn store_corruption(message: impl Into<String>) -> Self {
        Self::StoreCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a serialization error for a row.
    pub fn serialization(
        collection: impl Into<String>,
        key: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Serialization {
            collection: collection.into(),
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Creates a deserialization error for a row.
    pub fn deserialization(
        collection: impl Into<String>,
        key: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Deserialization {
            collection: collection.into(),
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Creates a sanitizer rejection error.
    pub fn sanitizer_rejected(
        collection: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::SanitizerRejected {
            collection: collection.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates an extension registration error.
    pub fn extension_registration(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExtensionRegistration {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates an extension failure error.
    pub fn extension_failure(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExtensionFailure {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error means on-disk state cannot be trusted.
    ///
    /// These errors trigger the configured corrupt-database action on open.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::WalCorruption { .. }
                | Self::StoreCorruption { .. }
                | Self::ChecksumMismatch { .. }
                | Self::InvalidFormat { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_classification() {
        assert!(CoreError::wal_corruption("bad magic").is_corruption());
        assert!(CoreError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_corruption());
        assert!(!CoreError::DatabaseLocked.is_corruption());
        assert!(!CoreError::MutationDuringEnumeration { collection: None }.is_corruption());
    }

    #[test]
    fn messages_name_the_row() {
        let err = CoreError::sanitizer_rejected("users", "u1", "empty name");
        assert_eq!(err.to_string(), "sanitizer rejected users/u1: empty name");
    }
}
