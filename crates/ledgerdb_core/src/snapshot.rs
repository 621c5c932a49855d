//! Snapshot images of the committed table.
//!
//! Checkpoints append a full image of the committed records to the
//! snapshot file; recovery loads the last intact image and replays the WAL
//! on top of it. Images are only ever appended, so a crash while writing
//! one leaves the previous image untouched.
//!
//! ## Image Format
//!
//! ```text
//! | magic "LSNP" (4) | version (2) | covered seq (8) | next txid (8) |
//! | record count (4) | body length (8) | body (N) | crc32 (4) |
//! ```
//!
//! The body is `count` repetitions of `key len (4) | key | value len (4) | value`.

use crate::error::{CoreError, CoreResult};
use crate::types::{Key, SequenceNumber, TransactionId};
use crate::wal::compute_crc32;
use ledgerdb_codec::{Decode, Encode, Value};
use ledgerdb_storage::StorageBackend;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Magic bytes opening every snapshot image.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"LSNP";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 34;
const CRC_SIZE: usize = 4;

/// A decoded snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// Highest commit sequence reflected in `records`.
    pub covered: SequenceNumber,
    /// First transaction id not yet handed out when the image was taken.
    pub next_txid: TransactionId,
    /// Committed records.
    pub records: BTreeMap<Key, Value>,
}

/// Location and header of one intact image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    /// Byte offset of the image in the file.
    pub offset: u64,
    /// Total length of the image in bytes.
    pub len: u64,
    /// Highest commit sequence covered.
    pub covered: SequenceNumber,
    /// Next transaction id at capture time.
    pub next_txid: TransactionId,
    /// Number of records in the image.
    pub records: u32,
}

/// Encodes `snapshot` as one image.
pub fn encode_image(snapshot: &Snapshot) -> CoreResult<Vec<u8>> {
    let mut body = Vec::new();
    for (key, value) in &snapshot.records {
        let value = value.encode()?;
        for field in [key.as_str().as_bytes(), value.as_slice()] {
            let len = u32::try_from(field.len())
                .map_err(|_| CoreError::invalid_operation("snapshot field exceeds 4 GiB"))?;
            body.extend_from_slice(&len.to_le_bytes());
            body.extend_from_slice(field);
        }
    }

    let count = u32::try_from(snapshot.records.len())
        .map_err(|_| CoreError::invalid_operation("too many records for one snapshot"))?;

    let mut image = Vec::with_capacity(HEADER_SIZE + body.len() + CRC_SIZE);
    image.extend_from_slice(&SNAPSHOT_MAGIC);
    image.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    image.extend_from_slice(&snapshot.covered.as_u64().to_le_bytes());
    image.extend_from_slice(&snapshot.next_txid.as_u64().to_le_bytes());
    image.extend_from_slice(&count.to_le_bytes());
    image.extend_from_slice(&(body.len() as u64).to_le_bytes());
    image.extend_from_slice(&body);
    let crc = compute_crc32(&image);
    image.extend_from_slice(&crc.to_le_bytes());
    Ok(image)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

/// Walks the images in a snapshot file, checking each one's CRC.
///
/// Returns the intact images and the length of the intact prefix. A torn
/// image at the end stops the walk; a damaged complete image is an error.
pub fn scan_images(file: &[u8]) -> CoreResult<(Vec<ImageInfo>, u64)> {
    let mut images = Vec::new();
    let mut offset = 0usize;

    while file.len() - offset >= HEADER_SIZE {
        let rest = &file[offset..];
        if rest[0..4] != SNAPSHOT_MAGIC {
            return Err(CoreError::snapshot_corruption(format!(
                "invalid magic at offset {offset}"
            )));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version > SNAPSHOT_VERSION {
            return Err(CoreError::snapshot_corruption(format!(
                "unsupported version {version} at offset {offset}"
            )));
        }

        let body_len = le_u64(&rest[26..34]);
        let total = usize::try_from(body_len)
            .ok()
            .and_then(|b| b.checked_add(HEADER_SIZE + CRC_SIZE));
        let Some(total) = total.filter(|t| *t <= rest.len()) else {
            break;
        };

        let stored = le_u32(&rest[total - CRC_SIZE..total]);
        let actual = compute_crc32(&rest[..total - CRC_SIZE]);
        if stored != actual {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }

        images.push(ImageInfo {
            offset: offset as u64,
            len: total as u64,
            covered: SequenceNumber::new(le_u64(&rest[6..14])),
            next_txid: TransactionId::new(le_u64(&rest[14..22])),
            records: le_u32(&rest[22..26]),
        });
        offset += total;
    }

    Ok((images, offset as u64))
}

fn read_field<'a>(body: &'a [u8], cursor: &mut usize) -> CoreResult<&'a [u8]> {
    let truncated = || CoreError::snapshot_corruption("unexpected end of image body");
    let len_end = *cursor + 4;
    let len = body.get(*cursor..len_end).map(le_u32).ok_or_else(truncated)? as usize;
    let data = body.get(len_end..len_end + len).ok_or_else(truncated)?;
    *cursor = len_end + len;
    Ok(data)
}

/// Decodes the image described by `info` out of `file`.
pub fn decode_image(file: &[u8], info: &ImageInfo) -> CoreResult<Snapshot> {
    let start = info.offset as usize;
    let end = start + info.len as usize;
    let body = file
        .get(start + HEADER_SIZE..end - CRC_SIZE)
        .ok_or_else(|| CoreError::snapshot_corruption("image out of bounds"))?;

    let mut cursor = 0usize;
    let mut records = BTreeMap::new();
    for _ in 0..info.records {
        let key = std::str::from_utf8(read_field(body, &mut cursor)?)
            .map_err(|_| CoreError::snapshot_corruption("key is not valid UTF-8"))?
            .to_owned();
        let value = Value::decode(read_field(body, &mut cursor)?)?;
        records.insert(Key::from(key), value);
    }

    if cursor != body.len() {
        return Err(CoreError::snapshot_corruption(format!(
            "{} trailing bytes in image body",
            body.len() - cursor
        )));
    }

    Ok(Snapshot {
        covered: info.covered,
        next_txid: info.next_txid,
        records,
    })
}

/// Append-only store of snapshot images.
pub struct SnapshotStore {
    backend: Mutex<Box<dyn StorageBackend>>,
}

impl SnapshotStore {
    /// Creates a store over `backend`.
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    /// Appends an image of `snapshot` and syncs it. Returns the image size.
    pub fn write(&self, snapshot: &Snapshot) -> CoreResult<u64> {
        let image = encode_image(snapshot)?;
        let mut backend = self.backend.lock();
        backend.append(&image)?;
        backend.sync()?;
        tracing::debug!(
            covered = %snapshot.covered,
            records = snapshot.records.len(),
            bytes = image.len(),
            "snapshot image written"
        );
        // TODO: compact snapshot.dat by rewriting the latest image to a temp
        // file and renaming it over the old one once images accumulate.
        Ok(image.len() as u64)
    }

    /// Loads the last intact image, cutting off a torn tail so the next
    /// image starts on a boundary.
    pub fn load_latest(&self) -> CoreResult<Option<Snapshot>> {
        let mut backend = self.backend.lock();
        let file = backend.read_all()?;
        let (images, valid) = scan_images(&file)?;

        if valid < file.len() as u64 {
            tracing::warn!(
                valid,
                torn = file.len() as u64 - valid,
                "discarding torn snapshot image"
            );
            backend.truncate(valid)?;
        }

        images
            .last()
            .map(|info| decode_image(&file, info))
            .transpose()
    }

    /// Size of the snapshot file in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }
}
