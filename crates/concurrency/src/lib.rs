//! Concurrency layer for stratalog
//!
//! This crate owns transaction bookkeeping:
//! - TransactionTable: live transactions, their LSN chains and states
//! - Transaction-control records (BEGIN, PREPARE, COMMIT, ABORT)
//! - Prepared-transaction snapshots for two-phase commit coordinators
//! - Outcome memory for resolved transactions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod table;

pub use table::{PreparedTransaction, Transaction, TransactionTable, TxnOutcome, TxnStats};
