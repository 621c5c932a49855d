//! Checkpoint command implementation.

use crate::error::CliResult;
use ledgerdb_core::{CheckpointReport, Config, Database, RecoveryReport};
use std::path::Path;
use tracing::info;

/// Opens the database (taking its lock), recovers it and checkpoints.
pub fn checkpoint(path: &Path) -> CliResult<(RecoveryReport, CheckpointReport)> {
    info!("Checkpointing database at {:?}", path);
    let config = Config::default().create_if_missing(false);
    let db = Database::open_with_config(path, config)?;
    let recovery = db.recover()?;
    let report = db.checkpoint()?;
    info!(
        covered = report.covered.as_u64(),
        records = report.records,
        replayed = recovery.replayed_transactions,
        "checkpoint written"
    );
    db.close()?;
    Ok((recovery, report))
}

/// Runs the checkpoint command.
pub fn run(path: &Path) -> CliResult<()> {
    let (recovery, report) = checkpoint(path)?;

    println!("Recovered:");
    println!(
        "  Snapshot:     seq:{} ({} records)",
        recovery.snapshot_seq.as_u64(),
        recovery.snapshot_records
    );
    println!("  Replayed:     {} transactions", recovery.replayed_transactions);
    println!("  Discarded:    {} transactions", recovery.discarded_transactions);
    if recovery.truncated_bytes > 0 {
        println!("  Torn tail:    {} bytes cut", recovery.truncated_bytes);
    }
    println!();
    println!("Checkpoint:");
    println!("  Covers:       seq:{}", report.covered.as_u64());
    println!("  Records:      {}", report.records);
    println!("  Image size:   {} bytes", report.snapshot_bytes);
    Ok(())
}
