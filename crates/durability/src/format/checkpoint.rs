//! Checkpoint file format.
//!
//! The checkpoint lives in a single `CHECKPOINT` file next to the segments.
//! It is replaced atomically (temp file, fsync, rename, directory fsync), so
//! a reader sees either the previous checkpoint or the new one.
//!
//! # Layout
//!
//! ```text
//! ┌────────────┬─────────────┬──────────────┬─────────────┬─────────────┐
//! │ Magic (4)  │ Version (4) │ Env id (16)  │ Ckp LSN (8) │ End LSN (8) │
//! ├────────────┴──────┬──────┴──────────────┴──────┬──────┴─────────────┘
//! │ Next txn id (8)   │ Created at, micros (8)     │ CRC32 (4)
//! └───────────────────┴────────────────────────────┘
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use stratalog_core::{EnvId, Lsn, TxnId};

use super::segment::sync_dir;

/// Magic bytes identifying a checkpoint file: "SCKP"
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"SCKP";

/// Current checkpoint format version
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Encoded size of a checkpoint
pub const CHECKPOINT_SIZE: usize = 60;

/// Name of the checkpoint file inside the log directory
pub const CHECKPOINT_FILE_NAME: &str = "CHECKPOINT";

/// A recovery starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Environment the checkpoint belongs to
    pub env_id: EnvId,
    /// Earliest first-LSN of any transaction live when the checkpoint was taken
    pub lsn: Lsn,
    /// End of the log when the checkpoint was taken
    pub end_lsn: Lsn,
    /// Next transaction id to hand out
    pub next_txn_id: TxnId,
    /// Wall-clock creation time (microseconds since epoch)
    pub created_at_micros: u64,
}

impl Checkpoint {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; CHECKPOINT_SIZE] {
        let mut bytes = [0u8; CHECKPOINT_SIZE];
        bytes[0..4].copy_from_slice(&CHECKPOINT_MAGIC);
        LittleEndian::write_u32(&mut bytes[4..8], CHECKPOINT_FORMAT_VERSION);
        bytes[8..24].copy_from_slice(self.env_id.as_bytes());
        LittleEndian::write_u32(&mut bytes[24..28], self.lsn.file);
        LittleEndian::write_u32(&mut bytes[28..32], self.lsn.offset);
        LittleEndian::write_u32(&mut bytes[32..36], self.end_lsn.file);
        LittleEndian::write_u32(&mut bytes[36..40], self.end_lsn.offset);
        LittleEndian::write_u64(&mut bytes[40..48], self.next_txn_id);
        LittleEndian::write_u64(&mut bytes[48..56], self.created_at_micros);

        let mut hasher = Hasher::new();
        hasher.update(&bytes[..56]);
        LittleEndian::write_u32(&mut bytes[56..60], hasher.finalize());
        bytes
    }

    /// Deserialize and verify.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        if bytes.len() != CHECKPOINT_SIZE {
            return Err(CheckpointError::WrongSize(bytes.len()));
        }
        if bytes[0..4] != CHECKPOINT_MAGIC {
            return Err(CheckpointError::InvalidMagic);
        }
        let version = LittleEndian::read_u32(&bytes[4..8]);
        if version != CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion(version));
        }

        let stored = LittleEndian::read_u32(&bytes[56..60]);
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..56]);
        let computed = hasher.finalize();
        if stored != computed {
            return Err(CheckpointError::ChecksumMismatch {
                expected: stored,
                computed,
            });
        }

        let mut env = [0u8; 16];
        env.copy_from_slice(&bytes[8..24]);
        Ok(Checkpoint {
            env_id: EnvId::from_bytes(env),
            lsn: Lsn::new(
                LittleEndian::read_u32(&bytes[24..28]),
                LittleEndian::read_u32(&bytes[28..32]),
            ),
            end_lsn: Lsn::new(
                LittleEndian::read_u32(&bytes[32..36]),
                LittleEndian::read_u32(&bytes[36..40]),
            ),
            next_txn_id: LittleEndian::read_u64(&bytes[40..48]),
            created_at_micros: LittleEndian::read_u64(&bytes[48..56]),
        })
    }
}

/// Reads and atomically replaces the checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    /// Checkpoint file inside `dir`.
    pub fn new(dir: &Path) -> Self {
        CheckpointFile {
            path: dir.join(CHECKPOINT_FILE_NAME),
        }
    }

    /// Path of the checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint, `Ok(None)` when none has been written yet.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Checkpoint::from_bytes(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a checkpoint: write temp, fsync, rename, fsync directory.
    pub fn persist(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let temp_path = self.path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&checkpoint.to_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if parent.exists() {
                sync_dir(parent)?;
            }
        }
        Ok(())
    }

    /// Remove the checkpoint file if present.
    pub fn remove(&self) -> Result<(), CheckpointError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Current time in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Checkpoint file errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// I/O error reading or writing the checkpoint file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File has the wrong size
    #[error("Checkpoint file has wrong size: {0} bytes")]
    WrongSize(usize),

    /// Magic bytes do not match
    #[error("Invalid checkpoint magic")]
    InvalidMagic,

    /// Unsupported format version
    #[error("Unsupported checkpoint version: {0}")]
    UnsupportedVersion(u32),

    /// Checksum verification failed
    #[error("Checkpoint checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the file
        expected: u32,
        /// Checksum computed over the file
        computed: u32,
    },
}

impl From<CheckpointError> for stratalog_core::Error {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::Io(io) => stratalog_core::Error::Io(io),
            other => stratalog_core::Error::Serialization(other.to_string()),
        }
    }
}
