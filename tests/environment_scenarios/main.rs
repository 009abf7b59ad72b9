//! Environment scenarios
//!
//! End-to-end behaviour of an environment across close, crash and reopen:
//! recovery, prepared-transaction resolution, replication and lifecycle.

#[path = "../common/mod.rs"]
mod common;

mod lifecycle;
mod prepared;
mod recovery;
mod replication;
