//! Log record frame.
//!
//! # Record Layout
//!
//! ```text
//! ┌────────────┬──────────┬───────────┬─────────────┬──────────────┬───────────┬──────────┬────────────┐
//! │ Length (4) │ Type (2) │ Flags (2) │ TxnId (8)   │ Back-link (8)│ Payload   │ CRC32 (4)│ Length (4) │
//! └────────────┴──────────┴───────────┴─────────────┴──────────────┴───────────┴──────────┴────────────┘
//! ```
//!
//! All integers are little endian. `Length` is the size of the whole frame
//! and appears twice: the leading copy drives forward scans, the trailing
//! copy lets a reader step backward from any record boundary. The CRC covers
//! every byte before it. The back-link is `(file, offset)` of the same
//! transaction's previous record, zero when there is none.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use stratalog_core::{Lsn, RecordType, TxnId};

/// Size of the fixed frame header (length, type, flags, txn id, back-link).
pub const RECORD_HEADER_SIZE: usize = 24;

/// Size of the frame trailer (CRC32 + trailing length).
pub const RECORD_TRAILER_SIZE: usize = 8;

/// Fixed bytes every record carries in addition to its payload.
pub const RECORD_OVERHEAD: usize = RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE;

/// Flag bit: the record belongs to a transaction.
const FLAG_HAS_TXN: u16 = 0x0001;

/// A log record as read back from the log.
///
/// Records are immutable once appended; the checksum has already been
/// verified for every `LogRecord` handed out by the store or a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Position of this record
    pub lsn: Lsn,
    /// Record-type tag
    pub record_type: RecordType,
    /// Owning transaction, `None` for non-transactional records
    pub txn_id: Option<TxnId>,
    /// Previous record written by the same transaction
    pub prev_lsn: Option<Lsn>,
    /// Opaque payload
    pub payload: Vec<u8>,
}

impl LogRecord {
    /// Encode a frame for the given fields.
    pub fn encode(
        record_type: RecordType,
        txn_id: Option<TxnId>,
        prev_lsn: Option<Lsn>,
        payload: &[u8],
    ) -> Vec<u8> {
        let total_len = RECORD_OVERHEAD + payload.len();
        let flags = if txn_id.is_some() { FLAG_HAS_TXN } else { 0 };
        let prev = prev_lsn.unwrap_or(Lsn::ZERO);

        let mut frame = Vec::with_capacity(total_len);
        frame.extend_from_slice(&(total_len as u32).to_le_bytes());
        frame.extend_from_slice(&record_type.tag().to_le_bytes());
        frame.extend_from_slice(&flags.to_le_bytes());
        frame.extend_from_slice(&txn_id.unwrap_or(0).to_le_bytes());
        frame.extend_from_slice(&prev.file.to_le_bytes());
        frame.extend_from_slice(&prev.offset.to_le_bytes());
        frame.extend_from_slice(payload);

        let crc = compute_crc(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&(total_len as u32).to_le_bytes());
        frame
    }

    /// Re-encode this record's frame, byte-identical to what is on disk.
    pub fn to_bytes(&self) -> Vec<u8> {
        Self::encode(self.record_type, self.txn_id, self.prev_lsn, &self.payload)
    }

    /// Size of this record's frame.
    pub fn frame_len(&self) -> usize {
        RECORD_OVERHEAD + self.payload.len()
    }

    /// Decode the frame at the start of `bytes`, assigning it `lsn`.
    ///
    /// Returns `(record, bytes_consumed)` on success.
    pub fn decode(lsn: Lsn, bytes: &[u8]) -> Result<(Self, usize), RecordError> {
        let total_len = frame_length(bytes)?;
        if bytes.len() < total_len {
            return Err(RecordError::InsufficientData);
        }
        let frame = &bytes[..total_len];

        let crc_pos = total_len - RECORD_TRAILER_SIZE;
        let stored_crc = LittleEndian::read_u32(&frame[crc_pos..crc_pos + 4]);
        let computed_crc = compute_crc(&frame[..crc_pos]);
        if stored_crc != computed_crc {
            return Err(RecordError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        let trailer = LittleEndian::read_u32(&frame[crc_pos + 4..]) as usize;
        if trailer != total_len {
            return Err(RecordError::TrailerMismatch {
                header: total_len as u32,
                trailer: trailer as u32,
            });
        }

        let tag = LittleEndian::read_u16(&frame[4..6]);
        let record_type = RecordType::from_tag(tag).ok_or(RecordError::UnknownType(tag))?;
        let flags = LittleEndian::read_u16(&frame[6..8]);
        let txn_raw = LittleEndian::read_u64(&frame[8..16]);
        let prev = Lsn::new(
            LittleEndian::read_u32(&frame[16..20]),
            LittleEndian::read_u32(&frame[20..24]),
        );

        let record = LogRecord {
            lsn,
            record_type,
            txn_id: (flags & FLAG_HAS_TXN != 0).then_some(txn_raw),
            prev_lsn: (!prev.is_zero()).then_some(prev),
            payload: frame[RECORD_HEADER_SIZE..crc_pos].to_vec(),
        };
        Ok((record, total_len))
    }
}

/// Read and sanity-check the leading length field of a frame.
pub fn frame_length(bytes: &[u8]) -> Result<usize, RecordError> {
    if bytes.len() < 4 {
        return Err(RecordError::InsufficientData);
    }
    let total_len = LittleEndian::read_u32(&bytes[0..4]);
    if (total_len as usize) < RECORD_OVERHEAD {
        return Err(RecordError::InvalidLength(total_len));
    }
    Ok(total_len as usize)
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Record parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Not enough data to parse the record (torn write at the tail)
    #[error("Insufficient data to parse record")]
    InsufficientData,

    /// Length field cannot describe a valid frame
    #[error("Invalid record length: {0}")]
    InvalidLength(u32),

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the record
        expected: u32,
        /// Checksum computed over the record
        computed: u32,
    },

    /// Leading and trailing length fields disagree
    #[error("Length mismatch: header {header}, trailer {trailer}")]
    TrailerMismatch {
        /// Leading length field
        header: u32,
        /// Trailing length field
        trailer: u32,
    },

    /// Record-type tag is not assigned
    #[error("Unknown record type tag: {0}")]
    UnknownType(u16),
}
