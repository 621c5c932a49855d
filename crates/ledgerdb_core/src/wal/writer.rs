//! WAL writer.

use crate::error::{CoreError, CoreResult};
use crate::types::{SequenceNumber, TransactionId};
use crate::wal::iterator::LogReader;
use crate::wal::record::{LogEntry, LogRecord};
use ledgerdb_storage::StorageBackend;
use parking_lot::Mutex;

/// Result of scanning the log at startup.
#[derive(Debug, Default)]
pub struct WalScan {
    /// Every intact entry with its byte offset.
    pub entries: Vec<(u64, LogEntry)>,
    /// Bytes of torn tail that were cut off.
    pub truncated_bytes: u64,
}

struct WalInner {
    backend: Box<dyn StorageBackend>,
    /// Encoded entries not yet handed to the backend.
    pending: Vec<u8>,
    next_lsn: u64,
}

impl WalInner {
    fn take_lsn(&mut self) -> SequenceNumber {
        let lsn = SequenceNumber::new(self.next_lsn);
        self.next_lsn += 1;
        lsn
    }

    fn push(&mut self, record: LogRecord) -> CoreResult<SequenceNumber> {
        let lsn = self.take_lsn();
        let bytes = LogEntry::new(lsn, record).encode()?;
        self.pending.extend_from_slice(&bytes);
        Ok(lsn)
    }

    /// Hands all pending bytes to the backend, optionally flushing.
    ///
    /// On failure the backend is cut back to its size before the attempt
    /// and the pending bytes are returned to the caller untouched.
    fn write_out(&mut self, flush: bool) -> Result<u64, (CoreError, Vec<u8>)> {
        if self.pending.is_empty() {
            if flush {
                self.backend.flush().map_err(|e| (e.into(), Vec::new()))?;
            }
            return Ok(0);
        }

        let data = std::mem::take(&mut self.pending);
        let base = match self.backend.size() {
            Ok(size) => size,
            Err(e) => return Err((e.into(), data)),
        };

        let result = self.backend.append(&data).and_then(|_| {
            if flush {
                self.backend.flush()
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => Ok(data.len() as u64),
            Err(e) => {
                if let Err(cut) = self.backend.truncate(base) {
                    tracing::warn!(base, error = %cut, "could not cut back partial WAL append");
                }
                Err((e.into(), data))
            }
        }
    }
}

/// Manages appends to the write-ahead log.
///
/// A committing transaction hands over its write entries and commit entry
/// together; they are appended as one contiguous run under the log mutex,
/// so no other transaction's entries interleave with them. Abort entries
/// are buffered and written out lazily.
pub struct WalManager {
    inner: Mutex<WalInner>,
    sync_on_commit: bool,
    buffer_limit: usize,
}

impl WalManager {
    /// Creates a new WAL manager over `backend`.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_commit: bool, buffer_limit: usize) -> Self {
        Self {
            inner: Mutex::new(WalInner {
                backend,
                pending: Vec::new(),
                next_lsn: 1,
            }),
            sync_on_commit,
            buffer_limit,
        }
    }

    /// Appends `writes` followed by a commit entry for `txid`, then flushes.
    ///
    /// Returns the commit entry's sequence number and the bytes appended.
    /// If the commit cannot be made durable, the backend is cut back, the
    /// transaction's entries are dropped and an error is returned.
    pub fn commit(
        &self,
        txid: TransactionId,
        writes: impl IntoIterator<Item = LogRecord>,
    ) -> CoreResult<(SequenceNumber, u64)> {
        let mut inner = self.inner.lock();
        let mark = inner.pending.len();

        let pushed = writes
            .into_iter()
            .try_for_each(|record| inner.push(record).map(|_| ()))
            .and_then(|()| inner.push(LogRecord::Commit { txid }));
        let lsn = match pushed {
            Ok(lsn) => lsn,
            Err(e) => {
                inner.pending.truncate(mark);
                return Err(e);
            }
        };

        match inner.write_out(self.sync_on_commit) {
            Ok(bytes) => {
                tracing::trace!(%txid, %lsn, bytes, "commit appended");
                Ok((lsn, bytes))
            }
            Err((e, mut data)) => {
                // Entries buffered before this commit are kept for the next write-out.
                data.truncate(mark);
                inner.pending = data;
                Err(e)
            }
        }
    }

    /// Buffers an entry; writes the buffer out once it passes the limit.
    pub fn append(&self, record: LogRecord) -> CoreResult<SequenceNumber> {
        let mut inner = self.inner.lock();
        let lsn = inner.push(record)?;
        if inner.pending.len() >= self.buffer_limit {
            inner.write_out(true).map_err(|(e, data)| {
                inner.pending = data;
                e
            })?;
        }
        Ok(lsn)
    }

    /// Writes out and flushes everything buffered.
    pub fn flush(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.write_out(true).map_err(|(e, data)| {
            inner.pending = data;
            e
        })?;
        Ok(())
    }

    /// Appends a checkpoint marker and flushes it.
    pub fn mark_checkpoint(&self, covered: SequenceNumber) -> CoreResult<SequenceNumber> {
        let mut inner = self.inner.lock();
        let lsn = inner.push(LogRecord::Checkpoint { covered })?;
        inner.write_out(true).map_err(|(e, data)| {
            inner.pending = data;
            e
        })?;
        Ok(lsn)
    }

    /// Current log size, buffered bytes included.
    pub fn size(&self) -> CoreResult<u64> {
        let inner = self.inner.lock();
        Ok(inner.backend.size()? + inner.pending.len() as u64)
    }

    /// Number of buffered bytes not yet handed to the backend.
    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Sequence number the next entry will get.
    pub fn next_lsn(&self) -> SequenceNumber {
        SequenceNumber::new(self.inner.lock().next_lsn)
    }

    /// Raises the next sequence number to at least `lsn`.
    pub fn advance_lsn(&self, lsn: SequenceNumber) {
        let mut inner = self.inner.lock();
        inner.next_lsn = inner.next_lsn.max(lsn.as_u64());
    }

    /// Reads every intact entry from the backend and cuts off a torn tail,
    /// so later appends start on an entry boundary.
    pub fn scan(&self) -> CoreResult<WalScan> {
        let mut inner = self.inner.lock();
        let image = inner.backend.read_all()?;
        let mut reader = LogReader::new(&image);
        let entries = reader.by_ref().collect::<CoreResult<Vec<_>>>()?;

        let mut truncated_bytes = 0;
        if reader.has_torn_tail() {
            let valid = reader.valid_len();
            truncated_bytes = image.len() as u64 - valid;
            tracing::warn!(valid, truncated_bytes, "discarding torn WAL tail");
            inner.backend.truncate(valid)?;
        }

        Ok(WalScan {
            entries,
            truncated_bytes,
        })
    }

    /// Discards the whole log, buffered entries included.
    pub fn clear(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.pending.clear();
        inner.backend.truncate(0)?;
        Ok(())
    }
}
