//! CLI command implementations.

pub mod checkpoint;
pub mod dump_wal;
pub mod inspect;
pub mod verify;

use crate::error::{CliError, CliResult};
use ledgerdb_core::DatabaseDir;
use ledgerdb_storage::{FileBackend, StorageBackend};
use std::path::{Path, PathBuf};

/// The two files of a database directory, read without taking its lock.
pub struct DatabaseFiles {
    /// WAL path.
    pub wal_path: PathBuf,
    /// Snapshot path.
    pub snapshot_path: PathBuf,
}

impl DatabaseFiles {
    /// Locates the files under `path`; fails if neither exists.
    pub fn locate(path: &Path) -> CliResult<Self> {
        let files = Self {
            wal_path: DatabaseDir::wal_path_in(path),
            snapshot_path: DatabaseDir::snapshot_path_in(path),
        };
        if !files.wal_path.exists() && !files.snapshot_path.exists() {
            return Err(CliError::NotADatabase(path.to_path_buf()));
        }
        Ok(files)
    }

    /// Full WAL image; empty if the file is missing.
    pub fn read_wal(&self) -> CliResult<Vec<u8>> {
        read_if_exists(&self.wal_path)
    }

    /// Full snapshot file; empty if the file is missing.
    pub fn read_snapshots(&self) -> CliResult<Vec<u8>> {
        read_if_exists(&self.snapshot_path)
    }
}

fn read_if_exists(path: &Path) -> CliResult<Vec<u8>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(FileBackend::open(path)?.read_all()?)
}

/// Formats a byte count for text output.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use ledgerdb_codec::Value;
    use ledgerdb_core::{Database, IsolationLevel, Key};
    use std::path::Path;

    /// Creates a database at `path` with two committed accounts and one
    /// checkpoint, then a third commit left in the WAL.
    pub fn seed(path: &Path) {
        let db = Database::open(path).unwrap();
        db.recover().unwrap();
        db.transaction(IsolationLevel::Serializable, |db, txn| {
            db.write(txn, &Key::from("acct:A"), Value::Integer(1000))?;
            db.write(txn, &Key::from("acct:B"), Value::Integer(500))
        })
        .unwrap();
        db.checkpoint().unwrap();
        db.transaction(IsolationLevel::Serializable, |db, txn| {
            db.write(txn, &Key::from("acct:A"), Value::Integer(900))
        })
        .unwrap();
        db.close().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn locate_rejects_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            DatabaseFiles::locate(dir.path()),
            Err(CliError::NotADatabase(_))
        ));
    }
}
