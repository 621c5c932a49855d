//! Write-ahead log.
//!
//! Every committed change is in the log, ahead of the commit entry that
//! makes it durable, before the commit is acknowledged. Recovery replays
//! the log over the last snapshot to rebuild the committed state.
//!
//! ## Entry Format
//!
//! ```text
//! | magic "LWAL" (4) | version (2) | kind (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload starts with the entry's sequence number. Write entries carry
//! the transaction id, key, and the old and new values encoded by
//! `ledgerdb_codec`, so an absent value and an explicit null stay distinct.
//!
//! ## When Entries Are Written
//!
//! Write entries are produced at commit, in the order the surviving
//! mutations were made, immediately followed by the commit entry. Writes
//! undone by a savepoint rollback never reach the log. Abort entries are
//! buffered.
//!
//! ## Recovery Policy
//!
//! - A truncated tail entry is a clean end of log and is cut off.
//! - Bad magic, an unknown kind, a future version or a CRC mismatch is fatal.

mod iterator;
mod record;
mod writer;

pub use iterator::LogReader;
pub use record::{
    compute_crc32, EntryKind, LogEntry, LogRecord, HEADER_SIZE, TRAILER_SIZE, WAL_MAGIC,
    WAL_VERSION,
};
pub use writer::{WalManager, WalScan};
