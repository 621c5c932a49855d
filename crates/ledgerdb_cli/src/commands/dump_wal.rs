//! Dump WAL command implementation.

use super::DatabaseFiles;
use crate::error::CliResult;
use crate::Format;
use ledgerdb_codec::Value;
use ledgerdb_core::wal::{LogEntry, LogReader, LogRecord};
use serde::Serialize;
use std::path::Path;

/// WAL entry representation for output.
#[derive(Debug, Serialize)]
pub struct WalEntryInfo {
    /// Offset in the WAL file.
    pub offset: u64,
    /// Entry sequence number.
    pub lsn: u64,
    /// Entry kind.
    pub kind: &'static str,
    /// Transaction ID (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<u64>,
    /// Key (write entries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Value before the write; `None` when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<Option<Value>>,
    /// Value after the write; `None` for a delete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<Option<Value>>,
    /// Sequence covered (checkpoint entries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub covered: Option<u64>,
}

impl WalEntryInfo {
    fn new(offset: u64, entry: LogEntry) -> Self {
        let mut info = Self {
            offset,
            lsn: entry.lsn.as_u64(),
            kind: entry.record.kind().name(),
            txid: entry.record.txid().map(|t| t.as_u64()),
            key: None,
            old: None,
            new: None,
            covered: None,
        };
        match entry.record {
            LogRecord::Write { key, old, new, .. } => {
                info.key = Some(key.as_str().to_string());
                info.old = Some(old);
                info.new = Some(new);
            }
            LogRecord::Checkpoint { covered } => info.covered = Some(covered.as_u64()),
            LogRecord::Commit { .. } | LogRecord::Abort { .. } => {}
        }
        info
    }
}

/// Runs the dump-wal command.
pub fn run(path: &Path, limit: Option<usize>, txid: Option<u64>, format: Format) -> CliResult<()> {
    let files = DatabaseFiles::locate(path)?;
    let image = files.read_wal()?;
    let (entries, stopped) = read_entries(&image, limit, txid);

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => print_text_output(&entries),
    }
    if let Some(reason) = stopped {
        eprintln!("stopped: {reason}");
    }
    Ok(())
}

/// Decodes entries until `limit` is reached or decoding stops, keeping
/// those of `txid` if given. Also returns why decoding stopped early.
pub fn read_entries(
    image: &[u8],
    limit: Option<usize>,
    txid: Option<u64>,
) -> (Vec<WalEntryInfo>, Option<String>) {
    let max = limit.unwrap_or(usize::MAX);
    let mut entries = Vec::new();
    let mut reader = LogReader::new(image);

    for item in reader.by_ref() {
        if entries.len() >= max {
            return (entries, None);
        }
        match item {
            Ok((offset, entry)) => {
                if txid.is_none_or(|t| entry.record.txid().map(|id| id.as_u64()) == Some(t)) {
                    entries.push(WalEntryInfo::new(offset, entry));
                }
            }
            Err(err) => return (entries, Some(err.to_string())),
        }
    }

    let stopped = reader.has_torn_tail().then(|| {
        format!(
            "torn tail of {} bytes",
            image.len() as u64 - reader.valid_len()
        )
    });
    (entries, stopped)
}

fn print_text_output(entries: &[WalEntryInfo]) {
    println!("{:<10} {:<8} {:<11} {:<10} DETAILS", "OFFSET", "LSN", "KIND", "TXN");
    println!("{}", "-".repeat(60));

    for e in entries {
        let txn = e.txid.map(|t| t.to_string()).unwrap_or_else(|| "-".into());
        let details = match (&e.key, &e.old, &e.new, e.covered) {
            (Some(key), Some(old), Some(new), _) => {
                format!("{key}: {} -> {}", show(old.as_ref()), show(new.as_ref()))
            }
            (_, _, _, Some(covered)) => format!("covers seq:{covered}"),
            _ => String::new(),
        };
        println!("{:<10} {:<8} {:<11} {:<10} {}", e.offset, e.lsn, e.kind, txn, details);
    }

    println!();
    println!("Total: {} entries", entries.len());
}

fn show(value: Option<&Value>) -> String {
    value.map_or_else(|| "<absent>".to_string(), ToString::to_string)
}
