//! # LedgerDB Storage
//!
//! Byte-store backends underneath the LedgerDB write-ahead log and snapshot
//! files. Backends are **opaque**: they never interpret the bytes handed to
//! them. Log framing, checksums and recovery all live in `ledgerdb_core`.
//!
//! ## Available Backends
//!
//! - [`MemoryBackend`] - Shareable in-memory store that tracks which bytes
//!   were flushed, so tests can simulate a crash and restart
//! - [`FileBackend`] - Persistent storage using OS file APIs
//! - [`FaultyBackend`] - Wrapper that injects I/O failures and torn writes
//!
//! ## Example
//!
//! ```rust
//! use ledgerdb_storage::{MemoryBackend, StorageBackend};
//!
//! let mut backend = MemoryBackend::new();
//! let offset = backend.append(b"commit").unwrap();
//! backend.flush().unwrap();
//! assert_eq!(backend.read_at(offset, 6).unwrap(), b"commit");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod faulty;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use faulty::{FaultPlan, FaultSwitch, FaultyBackend};
pub use file::FileBackend;
pub use memory::MemoryBackend;
