//! Database directory management.
//!
//! ```text
//! <db_path>/
//! ├─ MANIFEST          # Identity and checkpoint snapshot
//! ├─ LOCK              # Advisory lock held while the database is open
//! ├─ wal.log           # Write-ahead log
//! └─ store.dat         # Main store image
//! ```

use crate::config::CorruptAction;
use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "wal.log";
const STORE_FILE: &str = "store.dat";
const MANIFEST_TEMP: &str = "MANIFEST.tmp";

/// Files that make up the database contents, as opposed to the lock.
const DATA_FILES: [&str; 3] = [MANIFEST_FILE, WAL_FILE, STORE_FILE];

/// The database directory and its exclusive lock.
///
/// Only one `DatabaseDir` can exist per directory at a time, across
/// processes.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process or `Database` holds the lock (`DatabaseLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the WAL file.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.path.join(WAL_FILE)
    }

    /// Returns the path to the main store file.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.path.join(STORE_FILE)
    }

    /// Returns the path to the MANIFEST file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Loads the manifest, or `None` for a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest exists but cannot be read or decoded.
    pub fn load_manifest(&self) -> CoreResult<Option<Manifest>> {
        let manifest_path = self.manifest_path();
        if !manifest_path.exists() {
            return Ok(None);
        }

        let mut data = Vec::new();
        File::open(&manifest_path)?.read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(None);
        }
        Manifest::decode(&data).map(Some)
    }

    /// Saves the manifest atomically: temp file, fsync, rename, directory
    /// fsync.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn save_manifest(&self, manifest: &Manifest) -> CoreResult<()> {
        let temp_path = self.path.join(MANIFEST_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&manifest.encode())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.manifest_path())?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        // NTFS journals directory metadata.
        Ok(())
    }

    /// Checks if this is a new (empty) database directory.
    #[must_use]
    pub fn is_new_database(&self) -> bool {
        DATA_FILES.iter().all(|name| !self.path.join(name).exists())
    }

    /// Moves the data files out of the way after corruption was detected.
    ///
    /// `Rename` keeps them as `<name>.corrupt.<unix-millis>`; `Delete` removes
    /// them. Returns the paths the files were moved to (empty for `Delete`).
    ///
    /// # Errors
    ///
    /// Returns an error for `CorruptAction::Fail` or on I/O failure.
    pub fn discard_data_files(&self, action: CorruptAction) -> CoreResult<Vec<PathBuf>> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let mut moved = Vec::new();
        for name in DATA_FILES {
            let path = self.path.join(name);
            if !path.exists() {
                continue;
            }
            match action {
                CorruptAction::Fail => {
                    return Err(CoreError::invalid_operation(
                        "corrupt action is Fail; refusing to discard data files",
                    ));
                }
                CorruptAction::Rename => {
                    let target = self.path.join(format!("{name}.corrupt.{stamp}"));
                    fs::rename(&path, &target)?;
                    moved.push(target);
                }
                CorruptAction::Delete => fs::remove_file(&path)?,
            }
        }
        self.sync_directory()?;
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("new_db");

        let dir = DatabaseDir::open(&db_path, true).unwrap();
        assert!(db_path.is_dir());
        assert!(dir.is_new_database());
    }

    #[test]
    fn open_fails_if_not_exists_and_no_create() {
        let temp = tempdir().unwrap();
        let result = DatabaseDir::open(&temp.path().join("nonexistent"), false);
        assert!(result.is_err());
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("locked_db");

        let _dir1 = DatabaseDir::open(&db_path, true).unwrap();
        let result = DatabaseDir::open(&db_path, true);
        assert!(matches!(result, Err(CoreError::DatabaseLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("reopen_db");
        {
            let _dir = DatabaseDir::open(&db_path, true).unwrap();
        }
        let _dir2 = DatabaseDir::open(&db_path, true).unwrap();
    }

    #[test]
    fn manifest_is_saved_and_loaded() {
        let temp = tempdir().unwrap();
        let dir = DatabaseDir::open(temp.path(), true).unwrap();
        assert!(dir.load_manifest().unwrap().is_none());

        let mut manifest = Manifest::new();
        manifest.checkpoint = crate::types::Snapshot::new(3);
        dir.save_manifest(&manifest).unwrap();

        assert_eq!(dir.load_manifest().unwrap(), Some(manifest));
        assert!(!dir.is_new_database());
    }

    #[test]
    fn rename_moves_data_files_aside() {
        let temp = tempdir().unwrap();
        let dir = DatabaseDir::open(temp.path(), true).unwrap();
        fs::write(dir.wal_path(), b"garbage").unwrap();
        fs::write(dir.store_path(), b"garbage").unwrap();

        let moved = dir.discard_data_files(CorruptAction::Rename).unwrap();
        assert_eq!(moved.len(), 2);
        assert!(dir.is_new_database());
        assert!(moved.iter().all(|p| p.exists()));
    }

    #[test]
    fn delete_removes_data_files() {
        let temp = tempdir().unwrap();
        let dir = DatabaseDir::open(temp.path(), true).unwrap();
        fs::write(dir.wal_path(), b"garbage").unwrap();

        assert!(dir.discard_data_files(CorruptAction::Delete).unwrap().is_empty());
        assert!(dir.is_new_database());
        assert!(dir.discard_data_files(CorruptAction::Fail).is_ok());
    }
}
