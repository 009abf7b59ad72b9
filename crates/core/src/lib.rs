//! Core types for stratalog
//!
//! This crate defines the foundational types shared by every layer:
//! - Lsn: position of a record in the log
//! - RecordType: record-type tags (transaction control and application types)
//! - TxnId / TxnState: transaction identity and lifecycle
//! - GlobalTxnId: XA global transaction identifier for two-phase commit
//! - EnvId: identity stamped into every log segment and checkpoint
//! - Error: error taxonomy used throughout the system

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod lsn;
pub mod types;
pub mod xid;

pub use error::{Error, Result};
pub use lsn::Lsn;
pub use types::{EnvId, RecordType, TxnId, TxnState, APPLICATION_TAG_BASE};
pub use xid::{GlobalTxnId, MAX_BQUAL_SIZE, MAX_GTRID_SIZE, XID_DATA_SIZE};
