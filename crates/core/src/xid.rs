//! XA global transaction identifiers
//!
//! A [`GlobalTxnId`] correlates a local prepared transaction with the
//! distributed transaction an external coordinator is driving. It carries a
//! format id, a global transaction id (gtrid) and a branch qualifier (bqual),
//! each id part at most 64 bytes, 128 bytes of id data in total.
//!
//! # Encoding
//!
//! ```text
//! ┌────────────────┬─────────────┬─────────────┬──────────┬──────────┐
//! │ format_id (4)  │ gtrid_len(1)│ bqual_len(1)│ gtrid    │ bqual    │
//! └────────────────┴─────────────┴─────────────┴──────────┴──────────┘
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of the global transaction id part.
pub const MAX_GTRID_SIZE: usize = 64;

/// Maximum length of the branch qualifier part.
pub const MAX_BQUAL_SIZE: usize = 64;

/// Size of the fixed XA data area (gtrid followed by bqual).
pub const XID_DATA_SIZE: usize = MAX_GTRID_SIZE + MAX_BQUAL_SIZE;

const XID_PREFIX_SIZE: usize = 6;

/// Global transaction id as used by XA-style coordinators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalTxnId {
    format_id: i32,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
}

impl GlobalTxnId {
    /// Build a global transaction id, rejecting oversized parts.
    pub fn new(format_id: i32, gtrid: impl Into<Vec<u8>>, bqual: impl Into<Vec<u8>>) -> Result<Self> {
        let gtrid = gtrid.into();
        let bqual = bqual.into();
        if gtrid.is_empty() {
            return Err(Error::InvalidArgument("gtrid must not be empty".into()));
        }
        if gtrid.len() > MAX_GTRID_SIZE {
            return Err(Error::InvalidArgument(format!(
                "gtrid is {} bytes, limit is {}",
                gtrid.len(),
                MAX_GTRID_SIZE
            )));
        }
        if bqual.len() > MAX_BQUAL_SIZE {
            return Err(Error::InvalidArgument(format!(
                "bqual is {} bytes, limit is {}",
                bqual.len(),
                MAX_BQUAL_SIZE
            )));
        }
        Ok(GlobalTxnId {
            format_id,
            gtrid,
            bqual,
        })
    }

    /// Format identifier chosen by the coordinator.
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Global transaction id bytes.
    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    /// Branch qualifier bytes.
    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }

    /// The XA data area: gtrid then bqual, zero padded to `XID_DATA_SIZE`.
    pub fn data(&self) -> [u8; XID_DATA_SIZE] {
        let mut data = [0u8; XID_DATA_SIZE];
        data[..self.gtrid.len()].copy_from_slice(&self.gtrid);
        data[self.gtrid.len()..self.gtrid.len() + self.bqual.len()].copy_from_slice(&self.bqual);
        data
    }

    /// Serialize for a PREPARE record payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(XID_PREFIX_SIZE + self.gtrid.len() + self.bqual.len());
        out.extend_from_slice(&self.format_id.to_le_bytes());
        out.push(self.gtrid.len() as u8);
        out.push(self.bqual.len() as u8);
        out.extend_from_slice(&self.gtrid);
        out.extend_from_slice(&self.bqual);
        out
    }

    /// Parse the output of [`GlobalTxnId::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < XID_PREFIX_SIZE {
            return Err(Error::Serialization(format!(
                "global transaction id needs {} bytes, got {}",
                XID_PREFIX_SIZE,
                bytes.len()
            )));
        }
        let format_id = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let gtrid_len = bytes[4] as usize;
        let bqual_len = bytes[5] as usize;
        if bytes.len() != XID_PREFIX_SIZE + gtrid_len + bqual_len {
            return Err(Error::Serialization(format!(
                "global transaction id length mismatch: header says {}, have {}",
                XID_PREFIX_SIZE + gtrid_len + bqual_len,
                bytes.len()
            )));
        }
        let gtrid = bytes[XID_PREFIX_SIZE..XID_PREFIX_SIZE + gtrid_len].to_vec();
        let bqual = bytes[XID_PREFIX_SIZE + gtrid_len..].to_vec();
        GlobalTxnId::new(format_id, gtrid, bqual).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl fmt::Display for GlobalTxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for b in &self.gtrid {
            write!(f, "{:02x}", b)?;
        }
        f.write_str(":")?;
        for b in &self.bqual {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
