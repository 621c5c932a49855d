//! # LedgerDB Codec
//!
//! The record [`Value`] type and the binary encoding used wherever LedgerDB
//! persists values: write-ahead log entries and committed-table snapshots.
//!
//! Encoding is CBOR via `ciborium`. Decoding is strict: a buffer must hold
//! exactly one value, trailing bytes are an error.
//!
//! ## Usage
//!
//! ```
//! use ledgerdb_codec::{from_bytes, to_bytes, Value};
//!
//! let bytes = to_bytes(&Some(Value::Integer(900))).unwrap();
//! let decoded: Option<Value> = from_bytes(&bytes).unwrap();
//! assert_eq!(decoded, Some(Value::Integer(900)));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod value;

pub use error::{CodecError, CodecResult};
pub use value::Value;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes any serializable value to CBOR bytes.
///
/// # Errors
///
/// Returns [`CodecError::EncodingFailed`] if serialization fails.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::encoding(e.to_string()))?;
    Ok(buf)
}

/// Decodes exactly one value from `bytes`.
///
/// # Errors
///
/// Returns [`CodecError::DecodingFailed`] for malformed input and
/// [`CodecError::TrailingBytes`] if input remains after the value.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    let mut reader = bytes;
    let value = ciborium::from_reader(&mut reader).map_err(|e| CodecError::decoding(e.to_string()))?;
    if !reader.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: reader.len(),
        });
    }
    Ok(value)
}

/// Types that encode themselves for persistence.
pub trait Encode {
    /// Encode to bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Types that decode themselves from persisted bytes.
pub trait Decode: Sized {
    /// Decode from bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl Encode for Value {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_bytes(self)
    }
}

impl Decode for Value {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_bytes(bytes)
    }
}

impl Encode for Option<Value> {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_bytes(self)
    }
}

impl Decode for Option<Value> {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_bytes(bytes)
    }
}
