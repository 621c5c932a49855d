//! Log entry types and their binary encoding.

use crate::error::{CoreError, CoreResult};
use crate::types::{Key, SequenceNumber, TransactionId};
use ledgerdb_codec::{Decode, Encode, Value};

/// Magic bytes opening every log entry.
pub const WAL_MAGIC: [u8; 4] = *b"LWAL";

/// Current log format version.
pub const WAL_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4).
pub const HEADER_SIZE: usize = 11;

/// Trailing crc32.
pub const TRAILER_SIZE: usize = 4;

/// Kind byte of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryKind {
    /// A key was written or deleted.
    Write = 1,
    /// A transaction committed.
    Commit = 2,
    /// A transaction aborted.
    Abort = 3,
    /// A snapshot covers everything up to a sequence number.
    Checkpoint = 4,
}

impl EntryKind {
    /// Converts a byte to an entry kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Write),
            2 => Some(Self::Commit),
            3 => Some(Self::Abort),
            4 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the entry kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Lowercase name, as printed by tooling.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Commit => "commit",
            Self::Abort => "abort",
            Self::Checkpoint => "checkpoint",
        }
    }
}

/// What a log entry records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A key changed from `old` to `new`. `None` means absent.
    Write {
        /// Writing transaction.
        txid: TransactionId,
        /// The key.
        key: Key,
        /// Value before the write.
        old: Option<Value>,
        /// Value after the write; `None` for a delete.
        new: Option<Value>,
    },
    /// The transaction committed; its writes precede this entry.
    Commit {
        /// Committing transaction.
        txid: TransactionId,
    },
    /// The transaction aborted. Also written after a commit whose flush failed.
    Abort {
        /// Aborting transaction.
        txid: TransactionId,
    },
    /// A snapshot image covers every commit up to `covered`.
    Checkpoint {
        /// Highest commit sequence in the snapshot.
        covered: SequenceNumber,
    },
}

impl LogRecord {
    /// Returns the entry kind.
    #[must_use]
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Write { .. } => EntryKind::Write,
            Self::Commit { .. } => EntryKind::Commit,
            Self::Abort { .. } => EntryKind::Abort,
            Self::Checkpoint { .. } => EntryKind::Checkpoint,
        }
    }

    /// Returns the transaction this entry belongs to, if any.
    #[must_use]
    pub fn txid(&self) -> Option<TransactionId> {
        match self {
            Self::Write { txid, .. } | Self::Commit { txid } | Self::Abort { txid } => Some(*txid),
            Self::Checkpoint { .. } => None,
        }
    }
}

/// A sequenced log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Sequence number of this entry.
    pub lsn: SequenceNumber,
    /// The recorded event.
    pub record: LogRecord,
}

impl LogEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(lsn: SequenceNumber, record: LogRecord) -> Self {
        Self { lsn, record }
    }

    /// Serializes the full entry, envelope included.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            CoreError::invalid_operation(format!("log entry too large: {} bytes", payload.len()))
        })?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
        buf.extend_from_slice(&WAL_MAGIC);
        buf.extend_from_slice(&WAL_VERSION.to_le_bytes());
        buf.push(self.record.kind().as_byte());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.lsn.as_u64().to_le_bytes());

        match &self.record {
            LogRecord::Write { txid, key, old, new } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                put_bytes(&mut buf, key.as_str().as_bytes())?;
                put_bytes(&mut buf, &old.encode()?)?;
                put_bytes(&mut buf, &new.encode()?)?;
            }
            LogRecord::Commit { txid } | LogRecord::Abort { txid } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
            }
            LogRecord::Checkpoint { covered } => {
                buf.extend_from_slice(&covered.as_u64().to_le_bytes());
            }
        }

        Ok(buf)
    }

    /// Deserializes an entry from its kind and payload.
    pub fn decode_payload(kind: EntryKind, payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader::new(payload);
        let lsn = SequenceNumber::new(reader.u64()?);

        let record = match kind {
            EntryKind::Write => {
                let txid = TransactionId::new(reader.u64()?);
                let key = std::str::from_utf8(reader.bytes()?)
                    .map_err(|_| CoreError::wal_corruption("key is not valid UTF-8"))?;
                let key = Key::from(key);
                let old = Option::<Value>::decode(reader.bytes()?)?;
                let new = Option::<Value>::decode(reader.bytes()?)?;
                LogRecord::Write { txid, key, old, new }
            }
            EntryKind::Commit => LogRecord::Commit {
                txid: TransactionId::new(reader.u64()?),
            },
            EntryKind::Abort => LogRecord::Abort {
                txid: TransactionId::new(reader.u64()?),
            },
            EntryKind::Checkpoint => LogRecord::Checkpoint {
                covered: SequenceNumber::new(reader.u64()?),
            },
        };

        reader.finish(kind)?;
        Ok(Self { lsn, record })
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> CoreResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| CoreError::invalid_operation("log field exceeds 4 GiB"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    cursor: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, cursor: 0 }
    }

    fn take(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(n)
            .filter(|end| *end <= self.payload.len())
            .ok_or_else(|| CoreError::wal_corruption("unexpected end of payload"))?;
        let slice = &self.payload[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn bytes(&mut self) -> CoreResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn finish(&self, kind: EntryKind) -> CoreResult<()> {
        if self.cursor != self.payload.len() {
            return Err(CoreError::wal_corruption(format!(
                "trailing bytes in {} entry: expected {} bytes, got {}",
                kind.name(),
                self.cursor,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}
