//! Decoding a run of log entries.
//!
//! A truncated entry at the tail (short header, or a length that runs past
//! the end) is the clean end of the log: it is what a crash mid-append
//! leaves behind. Bad magic, an unknown kind, a future version or a CRC
//! mismatch on a complete entry is corruption and stops the reader with
//! an error.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{
    compute_crc32, EntryKind, LogEntry, HEADER_SIZE, TRAILER_SIZE, WAL_MAGIC, WAL_VERSION,
};

/// Iterator over the entries in a byte image of the log.
///
/// Yields `(offset, entry)` pairs. After it returns `None`,
/// [`LogReader::valid_len`] is the length of the intact prefix.
#[derive(Debug)]
pub struct LogReader<'a> {
    bytes: &'a [u8],
    offset: usize,
    finished: bool,
}

impl<'a> LogReader<'a> {
    /// Creates a reader over a complete log image.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            finished: false,
        }
    }

    /// Bytes consumed by intact entries so far.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.offset as u64
    }

    /// Whether bytes remain past the last intact entry.
    #[must_use]
    pub fn has_torn_tail(&self) -> bool {
        self.offset < self.bytes.len()
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, LogEntry)>> {
        let start = self.offset;
        let rest = &self.bytes[start..];
        if rest.len() < HEADER_SIZE {
            return Ok(None);
        }

        if rest[0..4] != WAL_MAGIC {
            return Err(CoreError::wal_corruption(format!(
                "invalid magic at offset {start}"
            )));
        }

        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version > WAL_VERSION {
            return Err(CoreError::wal_corruption(format!(
                "unsupported version {version} at offset {start}"
            )));
        }

        let kind = EntryKind::from_byte(rest[6]).ok_or_else(|| {
            CoreError::wal_corruption(format!("unknown entry kind {} at offset {start}", rest[6]))
        })?;

        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_SIZE + len + TRAILER_SIZE;
        if rest.len() < total {
            return Ok(None);
        }

        let body = &rest[..HEADER_SIZE + len];
        let trailer = &rest[HEADER_SIZE + len..total];
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = compute_crc32(body);
        if stored != actual {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }

        let entry = LogEntry::decode_payload(kind, &body[HEADER_SIZE..])?;
        self.offset += total;
        Ok(Some((start as u64, entry)))
    }
}

impl Iterator for LogReader<'_> {
    type Item = CoreResult<(u64, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Key, SequenceNumber, TransactionId};
    use crate::wal::record::LogRecord;
    use ledgerdb_codec::Value;

    fn sample_log() -> (Vec<u8>, Vec<LogEntry>) {
        let entries = vec![
            LogEntry::new(
                SequenceNumber::new(1),
                LogRecord::Write {
                    txid: TransactionId::new(1),
                    key: Key::from("account:A"),
                    old: Some(Value::Integer(100)),
                    new: Some(Value::Integer(70)),
                },
            ),
            LogEntry::new(
                SequenceNumber::new(2),
                LogRecord::Commit {
                    txid: TransactionId::new(1),
                },
            ),
        ];
        let mut bytes = Vec::new();
        for entry in &entries {
            bytes.extend(entry.encode().unwrap());
        }
        (bytes, entries)
    }

    #[test]
    fn reads_all_entries_with_offsets() {
        let (bytes, entries) = sample_log();
        let mut reader = LogReader::new(&bytes);
        let read: Vec<_> = reader.by_ref().collect::<CoreResult<_>>().unwrap();

        assert_eq!(read.len(), 2);
        assert_eq!(read[0].0, 0);
        assert_eq!(read[0].1, entries[0]);
        assert_eq!(read[1].1, entries[1]);
        assert_eq!(reader.valid_len(), bytes.len() as u64);
        assert!(!reader.has_torn_tail());
    }

    #[test]
    fn torn_tail_is_clean_end() {
        let (bytes, _) = sample_log();
        for cut in 1..12 {
            let torn = &bytes[..bytes.len() - cut];
            let mut reader = LogReader::new(torn);
            let read: Vec<_> = reader.by_ref().collect::<CoreResult<_>>().unwrap();
            assert_eq!(read.len(), 1, "cut {cut}");
            assert!(reader.has_torn_tail());
        }
    }

    #[test]
    fn flipped_bit_is_checksum_error() {
        let (mut bytes, _) = sample_log();
        bytes[HEADER_SIZE + 2] ^= 0x40;
        let err = LogReader::new(&bytes).next().unwrap().unwrap_err();
        assert!(matches!(err, CoreError::ChecksumMismatch { .. }));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let (mut bytes, _) = sample_log();
        bytes[0] = b'X';
        let err = LogReader::new(&bytes).next().unwrap().unwrap_err();
        assert!(matches!(err, CoreError::WalCorruption { .. }));
    }

    #[test]
    fn future_version_is_corruption() {
        let (mut bytes, _) = sample_log();
        bytes[4] = 0xFF;
        let err = LogReader::new(&bytes).next().unwrap().unwrap_err();
        assert!(matches!(err, CoreError::WalCorruption { .. }));
    }

    #[test]
    fn empty_log_yields_nothing() {
        assert_eq!(LogReader::new(&[]).count(), 0);
    }

    proptest::proptest! {
        #[test]
        fn any_prefix_reads_whole_entries_only(cut_fraction in 0.0f64..=1.0) {
            let (bytes, entries) = sample_log();
            let cut = (bytes.len() as f64 * cut_fraction) as usize;
            let first_end = entries[0].encode().unwrap().len();
            let expected = match cut {
                c if c == bytes.len() => 2,
                c if c >= first_end => 1,
                _ => 0,
            };

            let mut reader = LogReader::new(&bytes[..cut]);
            let read: Vec<_> = reader.by_ref().collect::<CoreResult<_>>().unwrap();
            proptest::prop_assert_eq!(read.len(), expected);
            let on_boundary = cut == 0 || cut == first_end || cut == bytes.len();
            proptest::prop_assert_eq!(reader.has_torn_tail(), !on_boundary);
        }
    }
}
