//! Inspect command implementation.

use super::{format_size, DatabaseFiles};
use crate::error::CliResult;
use crate::Format;
use ledgerdb_core::wal::{LogReader, LogRecord};
use ledgerdb_core::{scan_images, ImageInfo};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Database inspection result.
#[derive(Debug, Default, Serialize)]
pub struct InspectReport {
    /// Database path.
    pub path: String,
    /// WAL statistics.
    pub wal: WalSummary,
    /// Snapshot statistics.
    pub snapshots: SnapshotSummary,
}

/// What the WAL holds.
#[derive(Debug, Default, Serialize)]
pub struct WalSummary {
    /// File size in bytes.
    pub size: u64,
    /// Intact entries.
    pub entries: usize,
    /// Entries per kind.
    pub kinds: BTreeMap<&'static str, usize>,
    /// Transactions with a commit entry.
    pub commits: usize,
    /// Lowest and highest entry sequence numbers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lsn_range: Option<(u64, u64)>,
    /// Sequence number covered by the last checkpoint marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<u64>,
    /// Bytes after the last intact entry.
    pub torn_tail_bytes: u64,
    /// First corruption found, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corruption: Option<String>,
}

/// What the snapshot file holds.
#[derive(Debug, Default, Serialize)]
pub struct SnapshotSummary {
    /// File size in bytes.
    pub size: u64,
    /// Intact images.
    pub images: usize,
    /// Commit sequence covered by the newest image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub covered: Option<u64>,
    /// Records in the newest image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<u32>,
    /// Every image, oldest first (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<ImageRow>>,
    /// Bytes after the last intact image.
    pub torn_tail_bytes: u64,
    /// First corruption found, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corruption: Option<String>,
}

/// One snapshot image.
#[derive(Debug, Serialize)]
pub struct ImageRow {
    /// Byte offset in the file.
    pub offset: u64,
    /// Image length in bytes.
    pub len: u64,
    /// Commit sequence covered.
    pub covered: u64,
    /// Record count.
    pub records: u32,
}

impl From<&ImageInfo> for ImageRow {
    fn from(info: &ImageInfo) -> Self {
        Self {
            offset: info.offset,
            len: info.len,
            covered: info.covered.as_u64(),
            records: info.records,
        }
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, show_snapshots: bool, format: Format) -> CliResult<()> {
    let report = inspect(path, show_snapshots)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => print_text_output(&report),
    }
    Ok(())
}

/// Builds the inspection report for the database at `path`.
pub fn inspect(path: &Path, show_snapshots: bool) -> CliResult<InspectReport> {
    let files = DatabaseFiles::locate(path)?;
    Ok(InspectReport {
        path: path.display().to_string(),
        wal: summarize_wal(&files.read_wal()?),
        snapshots: summarize_snapshots(&files.read_snapshots()?, show_snapshots),
    })
}

fn summarize_wal(image: &[u8]) -> WalSummary {
    let mut summary = WalSummary {
        size: image.len() as u64,
        ..WalSummary::default()
    };

    let mut reader = LogReader::new(image);
    for item in reader.by_ref() {
        let entry = match item {
            Ok((_, entry)) => entry,
            Err(err) => {
                summary.corruption = Some(err.to_string());
                return summary;
            }
        };

        summary.entries += 1;
        *summary.kinds.entry(entry.record.kind().name()).or_default() += 1;
        let lsn = entry.lsn.as_u64();
        summary.lsn_range = Some(match summary.lsn_range {
            Some((lo, hi)) => (lo.min(lsn), hi.max(lsn)),
            None => (lsn, lsn),
        });
        match entry.record {
            LogRecord::Commit { .. } => summary.commits += 1,
            LogRecord::Checkpoint { covered } => summary.checkpoint = Some(covered.as_u64()),
            LogRecord::Write { .. } | LogRecord::Abort { .. } => {}
        }
    }
    summary.torn_tail_bytes = image.len() as u64 - reader.valid_len();
    summary
}

fn summarize_snapshots(file: &[u8], show_history: bool) -> SnapshotSummary {
    let mut summary = SnapshotSummary {
        size: file.len() as u64,
        ..SnapshotSummary::default()
    };

    match scan_images(file) {
        Ok((images, valid_len)) => {
            summary.images = images.len();
            summary.torn_tail_bytes = file.len() as u64 - valid_len;
            if let Some(latest) = images.last() {
                summary.covered = Some(latest.covered.as_u64());
                summary.records = Some(latest.records);
            }
            if show_history {
                summary.history = Some(images.iter().map(ImageRow::from).collect());
            }
        }
        Err(err) => summary.corruption = Some(err.to_string()),
    }
    summary
}

fn print_text_output(report: &InspectReport) {
    let wal = &report.wal;
    let snaps = &report.snapshots;

    println!("LedgerDB Database Inspection");
    println!("============================");
    println!();
    println!("Path: {}", report.path);
    println!();
    println!("WAL:");
    println!("  Size:       {}", format_size(wal.size));
    println!("  Entries:    {}", wal.entries);
    for (kind, count) in &wal.kinds {
        println!("    {kind:<11} {count}");
    }
    println!("  Commits:    {}", wal.commits);
    if let Some((lo, hi)) = wal.lsn_range {
        println!("  LSN range:  {lo}..={hi}");
    }
    if let Some(covered) = wal.checkpoint {
        println!("  Checkpoint: covers seq:{covered}");
    }
    if wal.torn_tail_bytes > 0 {
        println!("  Torn tail:  {} bytes", wal.torn_tail_bytes);
    }
    if let Some(err) = &wal.corruption {
        println!("  CORRUPT:    {err}");
    }

    println!();
    println!("Snapshots:");
    println!("  Size:       {}", format_size(snaps.size));
    println!("  Images:     {}", snaps.images);
    if let (Some(covered), Some(records)) = (snaps.covered, snaps.records) {
        println!("  Latest:     seq:{covered}, {records} records");
    }
    if let Some(history) = &snaps.history {
        for row in history {
            println!(
                "    @{:<8} {:>8} seq:{} ({} records)",
                row.offset,
                format_size(row.len),
                row.covered,
                row.records
            );
        }
    }
    if snaps.torn_tail_bytes > 0 {
        println!("  Torn tail:  {} bytes", snaps.torn_tail_bytes);
    }
    if let Some(err) = &snaps.corruption {
        println!("  CORRUPT:    {err}");
    }
}
