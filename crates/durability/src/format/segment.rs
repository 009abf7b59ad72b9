//! Log segment files.
//!
//! Segments are named `log-NNNNNN.seg` where `NNNNNN` is the zero-padded
//! segment file number, starting at 1.
//!
//! # Segment Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment Header (32 bytes)          │
//! ├────────────────────────────────────┤
//! │ Record at offset 0                 │
//! ├────────────────────────────────────┤
//! │ Record at offset len(record 0)     │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! Record offsets (the `offset` half of an LSN) are relative to the end of
//! the header.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use stratalog_core::EnvId;

/// Magic bytes identifying a log segment file: "SLOG"
pub const SEGMENT_MAGIC: [u8; 4] = *b"SLOG";

/// Current segment format version
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of segment header in bytes
pub const SEGMENT_HEADER_SIZE: usize = 32;

const SEGMENT_PREFIX: &str = "log-";
const SEGMENT_SUFFIX: &str = ".seg";

/// Log segment header (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes: "SLOG"
    pub magic: [u8; 4],

    /// Format version for forward compatibility
    pub format_version: u32,

    /// Segment file number
    pub file_number: u32,

    /// Reserved, written as zero
    pub flags: u32,

    /// Environment the segment belongs to
    pub env_id: [u8; 16],
}

impl SegmentHeader {
    /// Create a new segment header.
    pub fn new(file_number: u32, env_id: EnvId) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            file_number,
            flags: 0,
            env_id: *env_id.as_bytes(),
        }
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        LittleEndian::write_u32(&mut bytes[4..8], self.format_version);
        LittleEndian::write_u32(&mut bytes[8..12], self.file_number);
        LittleEndian::write_u32(&mut bytes[12..16], self.flags);
        bytes[16..32].copy_from_slice(&self.env_id);
        bytes
    }

    /// Deserialize header from bytes.
    pub fn from_bytes(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let mut env_id = [0u8; 16];
        env_id.copy_from_slice(&bytes[16..32]);
        SegmentHeader {
            magic,
            format_version: LittleEndian::read_u32(&bytes[4..8]),
            file_number: LittleEndian::read_u32(&bytes[8..12]),
            flags: LittleEndian::read_u32(&bytes[12..16]),
            env_id,
        }
    }

    /// Validate magic bytes and format version.
    pub fn is_valid(&self) -> bool {
        self.magic == SEGMENT_MAGIC && self.format_version == SEGMENT_FORMAT_VERSION
    }

    /// Environment id stamped into the header.
    pub fn env(&self) -> EnvId {
        EnvId::from_bytes(self.env_id)
    }
}

/// Generate segment file path.
pub fn segment_path(dir: &Path, file_number: u32) -> PathBuf {
    dir.join(format!("{}{:06}{}", SEGMENT_PREFIX, file_number, SEGMENT_SUFFIX))
}

/// Parse a segment file number out of a file name.
pub fn parse_segment_name(name: &str) -> Option<u32> {
    let digits = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// List all segment file numbers in the directory, in order.
pub fn list_segments(dir: &Path) -> std::io::Result<Vec<u32>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(num) = parse_segment_name(&name) {
            segments.push(num);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// Create a new segment file, write its header and make it durable.
///
/// The returned handle is positioned at the start of the record area.
pub fn create_segment(dir: &Path, file_number: u32, env_id: EnvId) -> std::io::Result<File> {
    let path = segment_path(dir, file_number);
    let mut file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(&path)?;

    file.write_all(&SegmentHeader::new(file_number, env_id).to_bytes())?;
    file.sync_all()?;
    sync_dir(dir)?;
    Ok(file)
}

/// Open a segment for reading.
pub fn open_segment(dir: &Path, file_number: u32) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .open(segment_path(dir, file_number))
}

/// Open an existing segment for appending at `record_end`.
pub fn open_segment_append(dir: &Path, file_number: u32, record_end: u32) -> std::io::Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(segment_path(dir, file_number))?;
    file.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE as u64 + record_end as u64))?;
    Ok(file)
}

/// Read the header at the start of `file`.
///
/// Returns `Ok(None)` when the file is too short to hold one.
pub fn read_header(file: &mut File) -> std::io::Result<Option<SegmentHeader>> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
    match file.read_exact(&mut bytes) {
        Ok(()) => Ok(Some(SegmentHeader::from_bytes(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Sync a directory so that created, renamed and removed entries are durable.
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
