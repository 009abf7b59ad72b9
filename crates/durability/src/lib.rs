//! Durability layer for stratalog
//!
//! This crate handles everything that touches disk:
//!
//! - Log: segmented, checksummed write-ahead log addressed by LSN
//! - Group commit: coalesced flushes up to a target LSN
//! - Log cursors: forward, backward and positioned reads
//! - Checkpoint file: atomic, checksummed recovery starting point
//! - Binary on-disk formats (segments, record frames, checkpoint)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;
pub mod log;

pub use format::{
    now_micros, Checkpoint, CheckpointError, CheckpointFile, LogRecord, RecordError,
    RECORD_OVERHEAD, SEGMENT_HEADER_SIZE,
};
pub use log::{
    CursorOp, LogConfig, LogConfigError, LogCursor, LogStats, LogStore, ScanReport, ScanStop,
    TxnChain,
};
