//! On-disk byte formats for the log and the checkpoint.
//!
//! Keeping serialization separate from operational logic (how segments are
//! appended, scanned and truncated) makes format evolution easier to manage.
//!
//! # Module Structure
//!
//! - `segment`: segment file naming and header format
//! - `record`: log record frame
//! - `checkpoint`: checkpoint file format and atomic replacement

pub mod checkpoint;
pub mod record;
pub mod segment;

pub use checkpoint::{
    now_micros, Checkpoint, CheckpointError, CheckpointFile, CHECKPOINT_FILE_NAME,
    CHECKPOINT_FORMAT_VERSION, CHECKPOINT_MAGIC, CHECKPOINT_SIZE,
};
pub use record::{
    frame_length, LogRecord, RecordError, RECORD_HEADER_SIZE, RECORD_OVERHEAD,
    RECORD_TRAILER_SIZE,
};
pub use segment::{
    create_segment, list_segments, open_segment, open_segment_append, parse_segment_name,
    read_header, segment_path, sync_dir, SegmentHeader, SEGMENT_FORMAT_VERSION,
    SEGMENT_HEADER_SIZE, SEGMENT_MAGIC,
};
