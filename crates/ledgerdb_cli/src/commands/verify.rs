//! Verify command implementation.

use super::DatabaseFiles;
use crate::error::{CliError, CliResult};
use ledgerdb_core::wal::{LogReader, LogRecord};
use ledgerdb_core::{decode_image, scan_images, SequenceNumber};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// Verification result for one file.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of entries or images checked.
    pub checked: usize,
    /// Number that decoded cleanly.
    pub valid: usize,
    /// Problems that make the file unusable.
    pub errors: Vec<String>,
    /// Conditions recovery handles on its own.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, check_wal: bool, check_snapshots: bool) -> CliResult<()> {
    println!("Verifying database at {}", path.display());
    println!();

    let (wal, snapshots) = verify(path, check_wal, check_snapshots)?;
    if let Some(result) = &wal {
        print_result("WAL", result);
    }
    if let Some(result) = &snapshots {
        print_result("Snapshots", result);
    }

    let problems: usize = wal
        .iter()
        .chain(snapshots.iter())
        .map(|r| r.errors.len())
        .sum();

    println!();
    if problems == 0 {
        println!("✓ Database verification passed");
        Ok(())
    } else {
        println!("✗ Database verification failed");
        Err(CliError::VerificationFailed(problems))
    }
}

/// Checks the requested files, returning one result per checked file.
pub fn verify(
    path: &Path,
    check_wal: bool,
    check_snapshots: bool,
) -> CliResult<(Option<VerifyResult>, Option<VerifyResult>)> {
    info!("Verifying database files at {:?}", path);
    let files = DatabaseFiles::locate(path)?;

    let mut snapshot_covered = None;
    let snapshots = if check_snapshots {
        let (result, covered) = verify_snapshots(&files.read_snapshots()?);
        snapshot_covered = covered;
        Some(result)
    } else {
        None
    };

    let wal = if check_wal {
        let image = files.read_wal()?;
        let mut result = verify_wal(&image);
        if let (true, Some(marker)) = (check_snapshots, checkpoint_marker(&image)) {
            if !matches!(snapshot_covered, Some(covered) if covered >= marker) {
                result.errors.push(format!(
                    "log was checkpointed at {marker} but no snapshot covers it"
                ));
            }
        }
        Some(result)
    } else {
        None
    };

    Ok((wal, snapshots))
}

fn verify_wal(image: &[u8]) -> VerifyResult {
    let mut result = VerifyResult::default();
    let mut open = HashSet::new();
    let mut last_lsn = SequenceNumber::default();

    let mut reader = LogReader::new(image);
    for item in reader.by_ref() {
        result.checked += 1;
        let (offset, entry) = match item {
            Ok(pair) => pair,
            Err(err) => {
                result.errors.push(err.to_string());
                return result;
            }
        };
        result.valid += 1;

        if entry.lsn <= last_lsn {
            result.errors.push(format!(
                "sequence numbers go backwards at offset {offset}: {} after {last_lsn}",
                entry.lsn
            ));
        }
        last_lsn = entry.lsn;

        match entry.record {
            LogRecord::Write { txid, .. } => {
                open.insert(txid);
            }
            LogRecord::Commit { txid } | LogRecord::Abort { txid } => {
                open.remove(&txid);
            }
            LogRecord::Checkpoint { .. } => {}
        }
    }

    if reader.has_torn_tail() {
        result.warnings.push(format!(
            "torn tail of {} bytes after offset {}",
            image.len() as u64 - reader.valid_len(),
            reader.valid_len()
        ));
    }
    if !open.is_empty() {
        result.warnings.push(format!(
            "{} transaction(s) without an outcome will be discarded",
            open.len()
        ));
    }
    result
}

fn checkpoint_marker(image: &[u8]) -> Option<SequenceNumber> {
    LogReader::new(image)
        .filter_map(Result::ok)
        .filter_map(|(_, entry)| match entry.record {
            LogRecord::Checkpoint { covered } => Some(covered),
            _ => None,
        })
        .last()
}

fn verify_snapshots(file: &[u8]) -> (VerifyResult, Option<SequenceNumber>) {
    let mut result = VerifyResult::default();
    let (images, valid_len) = match scan_images(file) {
        Ok(scan) => scan,
        Err(err) => {
            result.errors.push(err.to_string());
            return (result, None);
        }
    };

    let mut covered = None;
    for info in &images {
        result.checked += 1;
        match decode_image(file, info) {
            Ok(snapshot) => {
                result.valid += 1;
                if snapshot.records.len() != info.records as usize {
                    result.errors.push(format!(
                        "image at offset {} declares {} records but holds {}",
                        info.offset,
                        info.records,
                        snapshot.records.len()
                    ));
                }
                covered = Some(snapshot.covered);
            }
            Err(err) => result
                .errors
                .push(format!("image at offset {}: {err}", info.offset)),
        }
    }

    if valid_len < file.len() as u64 {
        result.warnings.push(format!(
            "torn tail of {} bytes after offset {valid_len}",
            file.len() as u64 - valid_len
        ));
    }
    (result, covered)
}

fn print_result(name: &str, result: &VerifyResult) {
    println!(
        "  {name}: checked {}, valid {}, errors {}",
        result.checked,
        result.valid,
        result.errors.len()
    );
    for warning in &result.warnings {
        println!("    warning: {warning}");
    }
    for error in &result.errors {
        println!("    ERROR: {error}");
    }
    if result.is_ok() {
        println!("    ok");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::seed;

    #[test]
    fn clean_database_passes() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());

        let (wal, snapshots) = verify(dir.path(), true, true).unwrap();
        let wal = wal.unwrap();
        let snapshots = snapshots.unwrap();
        assert!(wal.is_ok(), "{:?}", wal.errors);
        assert!(wal.warnings.is_empty());
        assert_eq!(wal.valid, 3);
        assert!(snapshots.is_ok());
        assert_eq!(snapshots.valid, 1);
    }

    #[test]
    fn flipped_byte_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let wal = dir.path().join("wal.log");
        let mut bytes = std::fs::read(&wal).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&wal, bytes).unwrap();

        let (wal, _) = verify(dir.path(), true, false).unwrap();
        assert!(!wal.unwrap().is_ok());
    }

    #[test]
    fn missing_snapshot_for_marker_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        std::fs::write(dir.path().join("snapshot.dat"), b"").unwrap();

        let (wal, _) = verify(dir.path(), true, true).unwrap();
        assert_eq!(wal.unwrap().errors.len(), 1);
    }
}
