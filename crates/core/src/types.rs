//! Shared identifiers and tags
//!
//! - EnvId: identity of a log environment, stamped into segment headers
//! - TxnId / TxnState: transaction identity and lifecycle state
//! - RecordType: the record-type tag carried by every log record

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Transaction identifier, assigned by the transaction table.
pub type TxnId = u64;

/// Identity of a log environment.
///
/// Every segment header and checkpoint carries the environment id so that
/// files copied between environments are detected instead of replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvId(Uuid);

impl EnvId {
    /// Create a new random EnvId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an EnvId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw bytes of this EnvId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for EnvId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    /// Begun, accepting writes
    Active,
    /// Durably prepared, waiting for the coordinator's decision
    Prepared,
    /// Terminal: committed
    Committed,
    /// Terminal: aborted
    Aborted,
}

impl TxnState {
    /// Committed and aborted transactions accept no further operations.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }

    /// Upper-case name used in log messages and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnState::Active => "ACTIVE",
            TxnState::Prepared => "PREPARED",
            TxnState::Committed => "COMMITTED",
            TxnState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First tag available to application-defined record types.
///
/// Tags below this value are reserved for transaction control and the
/// built-in update record.
pub const APPLICATION_TAG_BASE: u16 = 0x0100;

/// Record-type tag.
///
/// On disk this is a `u16`. Tags `1..=5` are the built-in types; tags at or
/// above [`APPLICATION_TAG_BASE`] belong to the application and are routed to
/// its dispatch hook during replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordType {
    /// Transaction begin
    Begin,
    /// Transaction commit
    Commit,
    /// Transaction abort
    Abort,
    /// Two-phase-commit prepare; payload is the global transaction id
    Prepare,
    /// Opaque data change written by a transaction
    Update,
    /// Application-defined record type (tag >= `APPLICATION_TAG_BASE`)
    Application(u16),
}

impl RecordType {
    /// On-disk tag for this record type.
    pub fn tag(&self) -> u16 {
        match self {
            RecordType::Begin => 1,
            RecordType::Commit => 2,
            RecordType::Abort => 3,
            RecordType::Prepare => 4,
            RecordType::Update => 5,
            RecordType::Application(tag) => *tag,
        }
    }

    /// Parse an on-disk tag. Returns `None` for reserved, unassigned tags.
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(RecordType::Begin),
            2 => Some(RecordType::Commit),
            3 => Some(RecordType::Abort),
            4 => Some(RecordType::Prepare),
            5 => Some(RecordType::Update),
            t if t >= APPLICATION_TAG_BASE => Some(RecordType::Application(t)),
            _ => None,
        }
    }

    /// Whether the value survives an encode/decode of its tag.
    ///
    /// `Application(t)` with `t` below the application range is not valid.
    pub fn is_valid(&self) -> bool {
        RecordType::from_tag(self.tag()) == Some(*self)
    }

    /// Transaction-control metadata (begin, commit, abort, prepare).
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            RecordType::Begin | RecordType::Commit | RecordType::Abort | RecordType::Prepare
        )
    }

    /// Application-defined record type.
    pub fn is_application(&self) -> bool {
        matches!(self, RecordType::Application(_))
    }

    /// Record types a transaction may write through `write`.
    pub fn is_data(&self) -> bool {
        matches!(self, RecordType::Update | RecordType::Application(_))
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Begin => f.write_str("BEGIN"),
            RecordType::Commit => f.write_str("COMMIT"),
            RecordType::Abort => f.write_str("ABORT"),
            RecordType::Prepare => f.write_str("PREPARE"),
            RecordType::Update => f.write_str("UPDATE"),
            RecordType::Application(tag) => write!(f, "APP({:#06x})", tag),
        }
    }
}
