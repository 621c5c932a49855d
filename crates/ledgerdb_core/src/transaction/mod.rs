//! Transactions.
//!
//! Every transaction runs at one of four isolation levels enforced by
//! strict two-phase locking: exclusive key locks on write, held to the end;
//! shared key locks on read, held to the end from repeatable read upwards.
//! Writes are staged in the record store and logged at commit.

mod manager;
mod savepoint;
mod state;

pub use manager::{CheckpointReport, TransactionManager};
pub use savepoint::SavepointToken;
pub use state::{TransactionHandle, TransactionState};
