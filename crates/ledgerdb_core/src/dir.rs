//! Database directory management.
//!
//! ```text
//! <db_path>/
//! ├─ LOCK              # Advisory lock; one process at a time
//! ├─ wal.log           # Write-ahead log
//! └─ snapshot.dat      # Appended snapshot images
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "wal.log";
const SNAPSHOT_FILE: &str = "snapshot.dat";

/// Holds an exclusive lock on a database directory.
///
/// The lock is released when the `DatabaseDir` is dropped.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens (or creates) a database directory and takes its lock.
    ///
    /// # Errors
    ///
    /// - the directory is missing and `create_if_missing` is false
    /// - another process holds the lock (`DatabaseLocked`)
    /// - I/O errors
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(CoreError::invalid_operation(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
            fs::create_dir_all(path)?;
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
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

        tracing::debug!(path = %path.display(), "database directory locked");
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

    /// Returns the path to the snapshot file.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE)
    }

    /// WAL path inside `dir`, for tools that read without taking the lock.
    #[must_use]
    pub fn wal_path_in(dir: &Path) -> PathBuf {
        dir.join(WAL_FILE)
    }

    /// Snapshot path inside `dir`, for tools that read without taking the lock.
    #[must_use]
    pub fn snapshot_path_in(dir: &Path) -> PathBuf {
        dir.join(SNAPSHOT_FILE)
    }
}
