//! Log sequence numbers
//!
//! An [`Lsn`] names the physical position of a record: the segment file it
//! lives in and its byte offset inside that segment's record area. Ordering
//! is lexicographic on `(file, offset)`, so comparing two LSNs is the same
//! as comparing their positions in the log.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Log sequence number: `(segment file, offset within the record area)`.
///
/// Segment files are numbered from 1. `Lsn::ZERO` never addresses a record
/// and is used on disk to encode "no LSN".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn {
    /// Segment file number
    pub file: u32,
    /// Byte offset of the record inside the segment's record area
    pub offset: u32,
}

impl Lsn {
    /// The null LSN.
    pub const ZERO: Lsn = Lsn { file: 0, offset: 0 };

    /// Greatest representable LSN.
    pub const MAX: Lsn = Lsn {
        file: u32::MAX,
        offset: u32::MAX,
    };

    /// Create an LSN from its parts.
    pub const fn new(file: u32, offset: u32) -> Self {
        Lsn { file, offset }
    }

    /// Whether this is the null LSN.
    pub fn is_zero(&self) -> bool {
        *self == Lsn::ZERO
    }

    /// Pack into a single u64 preserving order (file in the high half).
    pub fn to_u64(self) -> u64 {
        ((self.file as u64) << 32) | self.offset as u64
    }

    /// Inverse of [`Lsn::to_u64`].
    pub fn from_u64(packed: u64) -> Self {
        Lsn {
            file: (packed >> 32) as u32,
            offset: packed as u32,
        }
    }

    /// First record position of the given segment file.
    pub const fn start_of(file: u32) -> Self {
        Lsn { file, offset: 0 }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file, self.offset)
    }
}
