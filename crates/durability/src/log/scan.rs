//! Open-time scan of the segment directory.
//!
//! Every segment is read in order and every record is checksum-verified.
//! The scan stops at the first damage it finds: a torn record at the tail,
//! a checksum or length failure, a bad segment header, or a missing segment
//! file. Everything from that point on lies past the valid end of the log.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use stratalog_core::{EnvId, Lsn, Result};
use tracing::warn;

use crate::format::{
    list_segments, open_segment, read_header, segment_path, LogRecord, RecordError,
};

/// Reason the scan stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStop {
    /// Every segment was read to its end
    EndOfData,
    /// Incomplete record at the tail (expected after a crash mid-append)
    PartialRecord {
        /// Where the incomplete record starts
        lsn: Lsn,
    },
    /// Record or segment failed validation
    Corrupt {
        /// Where the damage starts
        lsn: Lsn,
        /// What failed to validate
        reason: String,
    },
}

impl ScanStop {
    /// Position of the damage, if any.
    pub fn damage_lsn(&self) -> Option<Lsn> {
        match self {
            ScanStop::EndOfData => None,
            ScanStop::PartialRecord { lsn } | ScanStop::Corrupt { lsn, .. } => Some(*lsn),
        }
    }
}

/// Result of the open-time scan.
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// First record position of the oldest segment
    pub first_lsn: Lsn,
    /// Position just past the last valid record
    pub valid_end: Lsn,
    /// Why the scan stopped
    pub stop: ScanStop,
    /// Number of valid records found
    pub records: u64,
    /// Bytes on disk past the valid end (damaged tail and later segments)
    pub bytes_past_valid_end: u64,
}

/// Damage that must be cut off before the log accepts appends.
#[derive(Debug, Clone)]
pub(crate) struct TailDamage {
    pub(crate) lsn: Lsn,
    /// The segment file at `lsn.file` is unusable and must be recreated
    pub(crate) rebuild_segment: bool,
    /// Torn append rather than corruption
    pub(crate) partial: bool,
    pub(crate) reason: String,
}

pub(crate) struct ScanOutcome {
    pub(crate) env_id: Option<EnvId>,
    /// Segment number -> valid end of its record area
    pub(crate) segments: BTreeMap<u32, u32>,
    pub(crate) damage: Option<TailDamage>,
    pub(crate) report: ScanReport,
}

pub(crate) fn scan_log(dir: &Path) -> Result<ScanOutcome> {
    let numbers = list_segments(dir)?;

    let mut env_id: Option<EnvId> = None;
    let mut segments = BTreeMap::new();
    let mut damage: Option<TailDamage> = None;
    let mut records = 0u64;
    let mut bytes_past = 0u64;
    let mut previous: Option<u32> = None;

    for (idx, &number) in numbers.iter().enumerate() {
        if let Some(prev) = previous {
            if number != prev + 1 {
                damage = Some(TailDamage {
                    lsn: Lsn::start_of(prev + 1),
                    rebuild_segment: true,
                    partial: false,
                    reason: format!("segment {} is missing", prev + 1),
                });
                bytes_past += files_size(dir, &numbers[idx..]);
                break;
            }
        }
        previous = Some(number);

        let mut file = open_segment(dir, number)?;
        let header_problem = match read_header(&mut file)? {
            None => Some("segment header is truncated".to_string()),
            Some(h) if !h.is_valid() => Some("segment header is invalid".to_string()),
            Some(h) if h.file_number != number => Some(format!(
                "segment header names file {}, expected {}",
                h.file_number, number
            )),
            Some(h) => match env_id {
                Some(env) if env != h.env() => {
                    Some(format!("segment belongs to environment {}", h.env()))
                }
                _ => {
                    env_id = Some(h.env());
                    None
                }
            },
        };
        if let Some(reason) = header_problem {
            damage = Some(TailDamage {
                lsn: Lsn::start_of(number),
                rebuild_segment: true,
                partial: false,
                reason,
            });
            bytes_past += files_size(dir, &numbers[idx..]);
            break;
        }

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let mut offset = 0usize;
        while offset < buffer.len() {
            let lsn = Lsn::new(number, offset as u32);
            match LogRecord::decode(lsn, &buffer[offset..]) {
                Ok((_, consumed)) => {
                    records += 1;
                    offset += consumed;
                }
                Err(RecordError::InsufficientData) => {
                    damage = Some(TailDamage {
                        lsn,
                        rebuild_segment: false,
                        partial: true,
                        reason: RecordError::InsufficientData.to_string(),
                    });
                    break;
                }
                Err(e) => {
                    warn!(
                        target: "stratalog::log",
                        lsn = %lsn,
                        error = %e,
                        "Corrupt log record, truncating effective log"
                    );
                    damage = Some(TailDamage {
                        lsn,
                        rebuild_segment: false,
                        partial: false,
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }

        segments.insert(number, offset as u32);
        if damage.is_some() {
            bytes_past += (buffer.len() - offset) as u64;
            bytes_past += files_size(dir, &numbers[idx + 1..]);
            break;
        }
    }

    let first_lsn = numbers
        .first()
        .map(|n| Lsn::start_of(*n))
        .unwrap_or(Lsn::start_of(1));
    let valid_end = match &damage {
        Some(d) => d.lsn,
        None => segments
            .iter()
            .next_back()
            .map(|(n, end)| Lsn::new(*n, *end))
            .unwrap_or(Lsn::start_of(1)),
    };
    let stop = match &damage {
        None => ScanStop::EndOfData,
        Some(d) if d.partial => ScanStop::PartialRecord { lsn: d.lsn },
        Some(d) => ScanStop::Corrupt {
            lsn: d.lsn,
            reason: d.reason.clone(),
        },
    };

    Ok(ScanOutcome {
        env_id,
        segments,
        damage,
        report: ScanReport {
            first_lsn,
            valid_end,
            stop,
            records,
            bytes_past_valid_end: bytes_past,
        },
    })
}

fn files_size(dir: &Path, numbers: &[u32]) -> u64 {
    numbers
        .iter()
        .filter_map(|n| std::fs::metadata(segment_path(dir, *n)).ok())
        .map(|m| m.len())
        .sum()
}
