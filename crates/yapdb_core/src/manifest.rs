//! Database manifest.
//!
//! The manifest identifies a database directory and records how far the main
//! store has been checkpointed. It is tiny and rewritten whole.

use crate::engine::{compute_crc32, ByteReader, ByteWriter};
use crate::error::{CoreError, CoreResult};
use crate::types::Snapshot;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Magic bytes for manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"YMFN";

/// Current manifest version.
pub const MANIFEST_VERSION: u8 = 1;

/// Database manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Identity of the database, fixed at creation.
    pub database_id: Uuid,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    /// Snapshot covered by the main store.
    pub checkpoint: Snapshot,
    /// Next rowid to assign, as of the last checkpoint.
    pub next_rowid: u64,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    /// Creates a manifest for a new database.
    #[must_use]
    pub fn new() -> Self {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            database_id: Uuid::new_v4(),
            created_at_ms,
            checkpoint: Snapshot::ZERO,
            next_rowid: 1,
        }
    }

    /// Encodes the manifest: magic, version, fields, then a CRC32 of all
    /// preceding bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = MANIFEST_MAGIC.to_vec();
        let body = ByteWriter::new()
            .u8(MANIFEST_VERSION)
            .bytes(self.database_id.as_bytes())
            .u64(self.created_at_ms)
            .u64(self.checkpoint.as_u64())
            .u64(self.next_rowid)
            .finish();
        buf.extend_from_slice(&body);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a manifest.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for a wrong magic or version, and
    /// `ChecksumMismatch` if the trailing CRC does not match.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < MANIFEST_MAGIC.len() + 4 || data[..4] != MANIFEST_MAGIC {
            return Err(CoreError::invalid_format("invalid manifest magic"));
        }
        let (content, crc_bytes) = data.split_at(data.len() - 4);
        let mut stored = [0u8; 4];
        stored.copy_from_slice(crc_bytes);
        let expected = u32::from_le_bytes(stored);
        let actual = compute_crc32(content);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        let mut reader = ByteReader::new(&content[4..], CoreError::invalid_format);
        let version = reader.u8()?;
        if version != MANIFEST_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest version: {version}"
            )));
        }
        let id_bytes = reader.bytes()?;
        let database_id = Uuid::from_slice(&id_bytes)
            .map_err(|e| CoreError::invalid_format(format!("invalid database id: {e}")))?;
        let created_at_ms = reader.u64()?;
        let checkpoint = Snapshot::new(reader.u64()?);
        let next_rowid = reader.u64()?;
        reader.finish()?;

        Ok(Self {
            database_id,
            created_at_ms,
            checkpoint,
            next_rowid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_manifest_starts_empty() {
        let manifest = Manifest::new();
        assert_eq!(manifest.checkpoint, Snapshot::ZERO);
        assert_eq!(manifest.next_rowid, 1);
        assert_ne!(manifest.database_id, Manifest::new().database_id);
    }

    #[test]
    fn decode_restores_fields() {
        let mut manifest = Manifest::new();
        manifest.checkpoint = Snapshot::new(42);
        manifest.next_rowid = 7;
        let decoded = Manifest::decode(&manifest.encode()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn invalid_magic_rejected() {
        let result = Manifest::decode(b"XXXXXXXX");
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn flipped_byte_is_detected() {
        let mut bytes = Manifest::new().encode();
        bytes[10] ^= 0xFF;
        assert!(matches!(
            Manifest::decode(&bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }
}
