//! Log configuration.

use serde::{Deserialize, Serialize};

use crate::format::{RECORD_OVERHEAD, SEGMENT_HEADER_SIZE};

/// Log configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Maximum segment file size in bytes, header included (default: 10MB).
    ///
    /// A record that would push the active segment past this size starts a
    /// new segment.
    pub segment_size: u64,

    /// Largest accepted record payload in bytes (default: 1MB).
    pub max_record_size: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            segment_size: 10 * 1024 * 1024, // 10MB
            max_record_size: 1024 * 1024,   // 1MB
        }
    }
}

impl LogConfig {
    /// Create a new log configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set segment size (builder pattern).
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Set maximum payload size (builder pattern).
    pub fn with_max_record_size(mut self, bytes: u32) -> Self {
        self.max_record_size = bytes;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), LogConfigError> {
        if self.segment_size < 1024 {
            return Err(LogConfigError::SegmentSizeTooSmall);
        }
        // Record offsets are u32
        if self.segment_size > u32::MAX as u64 {
            return Err(LogConfigError::SegmentSizeTooLarge);
        }
        let largest_frame = self.max_record_size as u64 + RECORD_OVERHEAD as u64;
        if largest_frame + SEGMENT_HEADER_SIZE as u64 > self.segment_size {
            return Err(LogConfigError::RecordExceedsSegment);
        }
        Ok(())
    }

    /// Create a configuration optimized for testing (small segments).
    pub fn for_testing() -> Self {
        LogConfig {
            segment_size: 64 * 1024,   // 64KB for faster rotation in tests
            max_record_size: 16 * 1024, // 16KB
        }
    }
}

/// Log configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogConfigError {
    /// Segment size is too small (minimum 1KB).
    #[error("Segment size must be at least 1KB")]
    SegmentSizeTooSmall,

    /// Segment size does not fit a 32-bit record offset.
    #[error("Segment size must not exceed 4GB")]
    SegmentSizeTooLarge,

    /// The largest record would not fit in an empty segment.
    #[error("Maximum record size does not fit in a segment")]
    RecordExceedsSegment,
}

impl From<LogConfigError> for stratalog_core::Error {
    fn from(e: LogConfigError) -> Self {
        stratalog_core::Error::Config(e.to_string())
    }
}
