//! # LedgerDB Testkit
//!
//! Test utilities for LedgerDB.
//!
//! This crate provides:
//! - Test fixtures: in-memory, restartable and file-backed databases
//! - A crash-recovery harness built on fault-injecting backends
//! - Concurrency stress helpers (money-transfer workloads)
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ledgerdb_testkit::prelude::*;
//!
//! #[test]
//! fn transfer_conserves_money() {
//!     with_accounts(&[("acct:A", 1000), ("acct:B", 500)], |db| {
//!         transfer(db, "acct:A", "acct:B", 100).unwrap();
//!         assert_eq!(total_balance(db, "acct"), 1500);
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
