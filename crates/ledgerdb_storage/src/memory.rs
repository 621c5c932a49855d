//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    /// Prefix of `data` that a flush has made durable.
    durable_len: usize,
}

/// An in-memory storage backend.
///
/// Clones share the same bytes, so a test can keep one clone, drop the
/// database that owns the other, and reopen on the survivor to simulate a
/// process restart. [`MemoryBackend::crash_image`] goes further and keeps only
/// the bytes that were flushed, which is what a power cut would leave behind.
///
/// # Example
///
/// ```rust
/// use ledgerdb_storage::{MemoryBackend, StorageBackend};
///
/// let mut backend = MemoryBackend::new();
/// backend.append(b"durable").unwrap();
/// backend.flush().unwrap();
/// backend.append(b"lost").unwrap();
///
/// let after_crash = backend.crash_image();
/// assert_eq!(after_crash.size().unwrap(), 7);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding `data`, all of it considered durable.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let durable_len = data.len();
        Self {
            state: Arc::new(RwLock::new(MemoryState { data, durable_len })),
        }
    }

    /// Returns a copy of every byte, flushed or not.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.state.read().data.clone()
    }

    /// Returns the number of bytes made durable by the last flush.
    #[must_use]
    pub fn durable_len(&self) -> usize {
        self.state.read().durable_len
    }

    /// Returns an independent backend holding only the flushed prefix.
    #[must_use]
    pub fn crash_image(&self) -> Self {
        let state = self.state.read();
        Self::with_data(state.data[..state.durable_len].to_vec())
    }

    /// Returns an independent backend holding the first `len` bytes, as if a
    /// write had been torn at that point.
    #[must_use]
    pub fn torn_image(&self, len: usize) -> Self {
        let state = self.state.read();
        let len = len.min(state.data.len());
        Self::with_data(state.data[..len].to_vec())
    }
}

impl StorageBackend for MemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let state = self.state.read();
        let size = state.data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(state.data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut state = self.state.write();
        let offset = state.data.len() as u64;
        state.data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        let mut state = self.state.write();
        state.durable_len = state.data.len();
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.state.read().data.len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        let size = state.data.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size,
            });
        }

        state.data.truncate(new_size as usize);
        state.durable_len = state.durable_len.min(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_offsets() {
        let mut backend = MemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn read_past_end_fails() {
        let mut backend = MemoryBackend::new();
        backend.append(b"hello").unwrap();

        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn clones_share_bytes() {
        let mut writer = MemoryBackend::new();
        let reader = writer.clone();

        writer.append(b"shared").unwrap();
        assert_eq!(reader.read_all().unwrap(), b"shared");
    }

    #[test]
    fn crash_image_keeps_only_flushed_prefix() {
        let mut backend = MemoryBackend::new();
        backend.append(b"abc").unwrap();
        backend.flush().unwrap();
        backend.append(b"def").unwrap();

        assert_eq!(backend.durable_len(), 3);
        let crashed = backend.crash_image();
        assert_eq!(crashed.read_all().unwrap(), b"abc");

        // the image is independent of the original
        backend.flush().unwrap();
        assert_eq!(crashed.size().unwrap(), 3);
    }

    #[test]
    fn torn_image_cuts_at_length() {
        let mut backend = MemoryBackend::new();
        backend.append(b"0123456789").unwrap();
        assert_eq!(backend.torn_image(4).read_all().unwrap(), b"0123");
        assert_eq!(backend.torn_image(99).size().unwrap(), 10);
    }

    #[test]
    fn truncate_clamps_durable_length() {
        let mut backend = MemoryBackend::new();
        backend.append(b"hello world").unwrap();
        backend.flush().unwrap();

        backend.truncate(5).unwrap();
        assert_eq!(backend.durable_len(), 5);
        assert_eq!(backend.read_all().unwrap(), b"hello");
    }

    #[test]
    fn truncate_cannot_grow() {
        let mut backend = MemoryBackend::new();
        backend.append(b"hello").unwrap();
        assert!(matches!(
            backend.truncate(100),
            Err(StorageError::TruncateBeyondEnd { .. })
        ));
    }
}
