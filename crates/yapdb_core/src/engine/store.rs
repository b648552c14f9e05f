//! The main store: a compacted image of every table at the last checkpoint.
//!
//! The store is rewritten as a whole at checkpoint through
//! [`StorageBackend::replace`], so its header snapshot and its rows always
//! describe the same state.

use super::codec::{ByteReader, ByteWriter, FrameFormat};
use super::versions::StoredRow;
use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionKey, RowId, Snapshot};
use std::sync::Arc;
use yapdb_storage::StorageBackend;

pub(crate) const STORE_FORMAT: FrameFormat = FrameFormat {
    magic: *b"YSTR",
    version: 1,
    corruption: CoreError::store_corruption,
};

const KIND_HEADER: u8 = 1;
const KIND_TABLE: u8 = 2;
const KIND_ROW: u8 = 3;

/// Contents of the main store.
#[derive(Debug, Default, Clone)]
pub struct StoreImage {
    /// Snapshot the image was taken at.
    pub snapshot: Snapshot,
    /// Next rowid to hand out.
    pub next_rowid: u64,
    /// Tables without rows.
    pub empty_tables: Vec<String>,
    /// Every row as `(table, key, row)`.
    pub rows: Vec<(String, CollectionKey, Arc<StoredRow>)>,
}

/// Reads and rewrites the main store file.
pub struct MainStore {
    backend: Box<dyn StorageBackend>,
    page_size: usize,
}

impl MainStore {
    /// Creates a store over `backend`.
    pub fn new(backend: Box<dyn StorageBackend>, page_size: usize) -> Self {
        Self { backend, page_size }
    }

    /// Loads the image. An empty backend is an empty database.
    pub fn load(&self) -> CoreResult<StoreImage> {
        let mut image = StoreImage::default();
        let mut saw_header = false;
        for frame in STORE_FORMAT.reader(self.backend.as_ref(), self.page_size)? {
            let frame = frame?;
            let mut r = ByteReader::new(&frame.payload, CoreError::store_corruption);
            match frame.kind {
                KIND_HEADER => {
                    image.snapshot = Snapshot::new(r.u64()?);
                    image.next_rowid = r.u64()?;
                    saw_header = true;
                }
                KIND_TABLE => image.empty_tables.push(r.str()?),
                KIND_ROW => {
                    let table = r.str()?;
                    let key = CollectionKey::new(r.str()?, r.str()?);
                    let row = StoredRow {
                        rowid: RowId::new(r.u64()?),
                        data: r.bytes()?,
                        metadata: r.opt_bytes()?,
                    };
                    image.rows.push((table, key, Arc::new(row)));
                }
                other => {
                    return Err(CoreError::store_corruption(format!(
                        "unknown record kind {other} at offset {}",
                        frame.offset
                    )))
                }
            }
            r.finish()?;
        }
        if !saw_header && !(image.rows.is_empty() && image.empty_tables.is_empty()) {
            return Err(CoreError::store_corruption("missing store header"));
        }
        Ok(image)
    }

    /// Atomically replaces the store with `image` and syncs it.
    pub fn write(&mut self, image: &StoreImage) -> CoreResult<()> {
        let header = ByteWriter::new()
            .u64(image.snapshot.as_u64())
            .u64(image.next_rowid)
            .finish();
        let mut data = STORE_FORMAT.encode(KIND_HEADER, &header)?;
        for table in &image.empty_tables {
            data.extend(STORE_FORMAT.encode(KIND_TABLE, &ByteWriter::new().str(table).finish())?);
        }
        for (table, key, row) in &image.rows {
            let payload = ByteWriter::new()
                .str(table)
                .str(&key.collection)
                .str(&key.key)
                .u64(row.rowid.as_u64())
                .bytes(&row.data)
                .opt_bytes(row.metadata.as_deref())
                .finish();
            data.extend(STORE_FORMAT.encode(KIND_ROW, &payload)?);
        }
        self.backend.replace(&data)?;
        self.backend.sync()?;
        Ok(())
    }

    /// Size of the store in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yapdb_storage::InMemoryBackend;

    #[test]
    fn image_survives_rewrite() {
        let backend = InMemoryBackend::new();
        let mut store = MainStore::new(Box::new(backend.clone()), 64);
        assert_eq!(store.load().unwrap().snapshot, Snapshot::ZERO);

        let image = StoreImage {
            snapshot: Snapshot::new(12),
            next_rowid: 4,
            empty_tables: vec!["yap2".into()],
            rows: vec![(
                "database2".into(),
                CollectionKey::new("notes", "1"),
                Arc::new(StoredRow {
                    rowid: RowId::new(3),
                    data: b"hello".to_vec(),
                    metadata: None,
                }),
            )],
        };
        store.write(&image).unwrap();

        let reopened = MainStore::new(Box::new(backend), 64).load().unwrap();
        assert_eq!(reopened.snapshot, Snapshot::new(12));
        assert_eq!(reopened.next_rowid, 4);
        assert_eq!(reopened.empty_tables, vec!["yap2"]);
        assert_eq!(reopened.rows[0].2.data, b"hello");
    }

    #[test]
    fn damaged_store_is_corruption() {
        let backend = InMemoryBackend::new();
        let mut store = MainStore::new(Box::new(backend.clone()), 64);
        store
            .write(&StoreImage {
                snapshot: Snapshot::new(1),
                ..StoreImage::default()
            })
            .unwrap();
        backend.corrupt_byte(12, 0xEE);
        assert!(store.load().unwrap_err().is_corruption());
    }
}
