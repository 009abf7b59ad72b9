//! Log record store.
//!
//! The store owns the segment directory. Appends are serialized by a single
//! writer lock that assigns LSNs in increasing order; reads never take that
//! lock. Appended records reach the OS immediately but are durable only after
//! [`LogStore::flush`] covers them.
//!
//! # Group commit
//!
//! `flush(upto)` first checks the published durable watermark. A caller whose
//! target is already covered returns without touching the device. Otherwise
//! it queues on the flush lock; whoever holds it syncs everything appended so
//! far, so callers that were waiting behind it usually find their target
//! covered on the recheck. fsync runs without the writer lock held, so
//! appends continue while a flush is in flight.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use stratalog_core::{EnvId, Error, Lsn, RecordType, Result, TxnId};
use tracing::{debug, error, info, warn};

use super::config::LogConfig;
use super::scan::{scan_log, ScanReport, TailDamage};
use crate::format::{
    create_segment, frame_length, list_segments, open_segment, open_segment_append, segment_path,
    sync_dir, LogRecord, RECORD_OVERHEAD, SEGMENT_HEADER_SIZE,
};

/// Cumulative log counters.
///
/// These counters accumulate over the lifetime of the store and are never
/// reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Records appended
    pub appends: u64,
    /// Bytes appended (frames, not payloads)
    pub bytes_written: u64,
    /// fsync calls issued by flushes and segment rotation
    pub sync_calls: u64,
    /// Nanoseconds spent in fsync
    pub sync_nanos: u64,
    /// Calls to `flush`
    pub flush_requests: u64,
    /// Flush requests satisfied by another caller's fsync
    pub flushes_coalesced: u64,
    /// Segment rotations
    pub rotations: u64,
    /// First record position of the oldest segment
    pub first_lsn: Lsn,
    /// Next append position
    pub end_lsn: Lsn,
    /// Everything before this position is durable
    pub flushed_lsn: Lsn,
    /// Number of segment files
    pub segments: usize,
}

#[derive(Default)]
struct LogCounters {
    appends: AtomicU64,
    bytes_written: AtomicU64,
    sync_calls: AtomicU64,
    sync_nanos: AtomicU64,
    flush_requests: AtomicU64,
    flushes_coalesced: AtomicU64,
    rotations: AtomicU64,
}

impl LogCounters {
    fn record_sync(&self, started: Instant) {
        self.sync_calls.fetch_add(1, Ordering::Relaxed);
        self.sync_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}

/// The segment currently receiving appends.
struct ActiveSegment {
    file: Arc<File>,
    number: u32,
    /// End of the record area (next append offset)
    end: u32,
}

struct WriteFailure {
    error: Error,
    /// The segment could not be restored to its pre-append length
    poisoned: bool,
}

/// Append-only, segmented, checksummed log.
pub struct LogStore {
    dir: PathBuf,
    env_id: EnvId,
    config: LogConfig,

    /// Single append-serialization point. `None` while the tail is damaged
    /// or after close.
    writer: Mutex<Option<ActiveSegment>>,

    /// Segment number -> end of its record area
    segments: RwLock<BTreeMap<u32, u32>>,

    /// Next append position (packed LSN)
    end_lsn: AtomicU64,

    /// Durable watermark: every byte before this position is on stable storage
    flushed_lsn: AtomicU64,

    flush_lock: Mutex<()>,
    damage: Mutex<Option<TailDamage>>,
    scan: ScanReport,
    closed: AtomicBool,
    counters: LogCounters,
    /// Test seam: the next fsync reports an I/O error
    fail_next_sync: AtomicBool,
}

impl LogStore {
    /// Open (or create) the log in `dir`.
    ///
    /// Every existing record is verified. If the scan finds damage, reads are
    /// bounded by the last valid record and appends are refused until
    /// [`LogStore::truncate_tail`] has cut the damaged tail off.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> Result<Self> {
        Self::open_for_env(dir, config, None)
    }

    /// Open the log, falling back to `known` for the environment id when no
    /// segment header can supply it (for example a damaged first header).
    ///
    /// A fresh id is generated only when neither source has one.
    pub fn open_for_env(
        dir: impl AsRef<Path>,
        config: LogConfig,
        known: Option<EnvId>,
    ) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let outcome = scan_log(&dir)?;
        let env_id = match (outcome.env_id, known) {
            (Some(scanned), Some(known)) if scanned != known => {
                warn!(
                    target: "stratalog::log",
                    log_env = %scanned,
                    expected_env = %known,
                    "Log segments belong to a different environment than expected"
                );
                scanned
            }
            (Some(scanned), _) => scanned,
            (None, Some(known)) => known,
            (None, None) => {
                let fresh = EnvId::new();
                if outcome.damage.is_some() {
                    warn!(
                        target: "stratalog::log",
                        env_id = %fresh,
                        "No readable segment header; log adopts a new environment id"
                    );
                }
                fresh
            }
        };
        let mut segments = outcome.segments;

        let (writer, end) = match &outcome.damage {
            Some(damage) => {
                warn!(
                    target: "stratalog::log",
                    lsn = %damage.lsn,
                    reason = %damage.reason,
                    bytes_past_valid_end = outcome.report.bytes_past_valid_end,
                    "Log tail is damaged; appends disabled until truncation"
                );
                (None, damage.lsn)
            }
            None => match segments.iter().next_back().map(|(n, e)| (*n, *e)) {
                Some((number, end)) => {
                    let file = open_segment_append(&dir, number, end)?;
                    file.sync_data()?;
                    let active = ActiveSegment {
                        file: Arc::new(file),
                        number,
                        end,
                    };
                    (Some(active), Lsn::new(number, end))
                }
                None => {
                    let file = create_segment(&dir, 1, env_id)?;
                    segments.insert(1, 0);
                    let active = ActiveSegment {
                        file: Arc::new(file),
                        number: 1,
                        end: 0,
                    };
                    (Some(active), Lsn::start_of(1))
                }
            },
        };

        info!(
            target: "stratalog::log",
            dir = ?dir,
            env_id = %env_id,
            first_lsn = %outcome.report.first_lsn,
            end_lsn = %end,
            records = outcome.report.records,
            segments = segments.len(),
            "Log opened"
        );

        Ok(LogStore {
            dir,
            env_id,
            config,
            writer: Mutex::new(writer),
            segments: RwLock::new(segments),
            end_lsn: AtomicU64::new(end.to_u64()),
            flushed_lsn: AtomicU64::new(end.to_u64()),
            flush_lock: Mutex::new(()),
            damage: Mutex::new(outcome.damage),
            scan: outcome.report,
            closed: AtomicBool::new(false),
            counters: LogCounters::default(),
            fail_next_sync: AtomicBool::new(false),
        })
    }

    /// Append a record without a back-link.
    pub fn append(
        &self,
        txn_id: Option<TxnId>,
        record_type: RecordType,
        payload: &[u8],
    ) -> Result<Lsn> {
        self.append_linked(txn_id, record_type, None, payload)
    }

    /// Append a record whose back-link points at the same transaction's
    /// previous record.
    ///
    /// The record reaches the OS before this returns; it is durable only
    /// once a [`LogStore::flush`] covers its LSN.
    pub fn append_linked(
        &self,
        txn_id: Option<TxnId>,
        record_type: RecordType,
        prev_lsn: Option<Lsn>,
        payload: &[u8],
    ) -> Result<Lsn> {
        if !record_type.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "record type tag {:#06x} is reserved",
                record_type.tag()
            )));
        }
        if payload.len() > self.config.max_record_size as usize {
            return Err(Error::InvalidArgument(format!(
                "payload is {} bytes, limit is {}",
                payload.len(),
                self.config.max_record_size
            )));
        }
        if prev_lsn.is_some() && txn_id.is_none() {
            return Err(Error::InvalidArgument(
                "back-link requires a transaction id".into(),
            ));
        }

        let frame = LogRecord::encode(record_type, txn_id, prev_lsn, payload);

        let mut guard = self.writer.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::invalid_state("log store is closed"));
        }
        let active = match guard.as_mut() {
            Some(active) => active,
            None => {
                return Err(Error::invalid_state(
                    "log tail is damaged; truncate it before appending",
                ))
            }
        };

        let would_end = SEGMENT_HEADER_SIZE as u64 + active.end as u64 + frame.len() as u64;
        if active.end > 0 && would_end > self.config.segment_size {
            self.rotate(active)?;
        }

        match self.write_frame(active, &frame) {
            Ok(lsn) => Ok(lsn),
            Err(failure) => {
                if failure.poisoned {
                    let lsn = Lsn::new(active.number, active.end);
                    error!(
                        target: "stratalog::log",
                        lsn = %lsn,
                        error = %failure.error,
                        "Failed append could not be rolled back; log tail marked damaged"
                    );
                    *self.damage.lock() = Some(TailDamage {
                        lsn,
                        rebuild_segment: false,
                        partial: true,
                        reason: format!("failed append: {}", failure.error),
                    });
                    *guard = None;
                }
                Err(failure.error)
            }
        }
    }

    fn write_frame(
        &self,
        active: &mut ActiveSegment,
        frame: &[u8],
    ) -> std::result::Result<Lsn, WriteFailure> {
        let lsn = Lsn::new(active.number, active.end);
        if let Err(e) = (&*active.file).write_all(frame) {
            let restore = SEGMENT_HEADER_SIZE as u64 + active.end as u64;
            let rolled_back = active
                .file
                .set_len(restore)
                .and_then(|_| (&*active.file).seek(SeekFrom::Start(restore)).map(|_| ()));
            return Err(WriteFailure {
                error: e.into(),
                poisoned: rolled_back.is_err(),
            });
        }

        active.end += frame.len() as u32;
        self.segments.write().insert(active.number, active.end);
        self.end_lsn.store(
            Lsn::new(active.number, active.end).to_u64(),
            Ordering::Release,
        );
        self.counters.appends.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(lsn)
    }

    /// Close the active segment (durably) and start the next one.
    fn rotate(&self, active: &mut ActiveSegment) -> Result<()> {
        let started = Instant::now();
        active.file.sync_data()?;
        self.counters.record_sync(started);

        let next = active
            .number
            .checked_add(1)
            .ok_or_else(|| Error::invalid_state("segment numbers exhausted"))?;
        let file = create_segment(&self.dir, next, self.env_id)?;

        self.flushed_lsn
            .fetch_max(Lsn::start_of(next).to_u64(), Ordering::AcqRel);
        self.segments.write().insert(next, 0);
        *active = ActiveSegment {
            file: Arc::new(file),
            number: next,
            end: 0,
        };
        self.end_lsn
            .store(Lsn::start_of(next).to_u64(), Ordering::Release);
        self.counters.rotations.fetch_add(1, Ordering::Relaxed);

        debug!(target: "stratalog::log", segment = next, "Rotated log segment");
        Ok(())
    }

    /// Force every record up to and including `upto` to stable storage.
    ///
    /// Concurrent requests for the same or a lower target are coalesced into
    /// a single fsync. Failures are returned as-is; the store never retries.
    pub fn flush(&self, upto: Lsn) -> Result<()> {
        self.counters.flush_requests.fetch_add(1, Ordering::Relaxed);

        let end = self.end_lsn();
        let needed = upto.to_u64().saturating_add(1).min(end.to_u64());
        if self.flushed_lsn.load(Ordering::Acquire) >= needed {
            self.counters
                .flushes_coalesced
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let _leader = self.flush_lock.lock();
        if self.flushed_lsn.load(Ordering::Acquire) >= needed {
            self.counters
                .flushes_coalesced
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let (file, target) = {
            let guard = self.writer.lock();
            match guard.as_ref() {
                Some(active) => (
                    Arc::clone(&active.file),
                    Lsn::new(active.number, active.end),
                ),
                None => {
                    return Err(Error::invalid_state(
                        "log has no active segment to flush",
                    ))
                }
            }
        };

        if self.fail_next_sync.swap(false, Ordering::AcqRel) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected sync failure",
            )));
        }

        let started = Instant::now();
        file.sync_data()?;
        self.counters.record_sync(started);
        self.flushed_lsn
            .fetch_max(target.to_u64(), Ordering::AcqRel);
        Ok(())
    }

    /// Make the next fsync issued by [`LogStore::flush`] fail.
    #[doc(hidden)]
    pub fn fail_next_sync(&self) {
        self.fail_next_sync.store(true, Ordering::Release);
    }

    /// Flush everything appended so far.
    pub fn flush_all(&self) -> Result<()> {
        self.flush(self.end_lsn())
    }

    /// Read the record at `lsn`.
    ///
    /// Fails with `NotFound` when no record exists at that position and with
    /// `CorruptRecord` when the bytes there fail validation.
    pub fn read(&self, lsn: Lsn) -> Result<LogRecord> {
        if let Some(damage) = self.damage.lock().as_ref() {
            if damage.lsn == lsn {
                return Err(Error::corrupt(lsn, damage.reason.clone()));
            }
        }
        let segment_end = self
            .segment_end(lsn.file)
            .filter(|end| lsn.offset < *end)
            .ok_or_else(|| Error::not_found(format!("no record at {}", lsn)))?;
        let mut file = open_segment(&self.dir, lsn.file).map_err(|e| open_error(lsn.file, e))?;
        read_frame(&mut file, lsn, segment_end)
    }

    /// Iterate a transaction's records newest-first by following back-links.
    pub fn txn_chain(&self, last_lsn: Lsn) -> TxnChain<'_> {
        TxnChain {
            store: self,
            next: Some(last_lsn),
            handles: SegmentHandles::new(self.dir.clone()),
        }
    }

    /// Cut off the damaged tail found at open (or left by a failed append).
    ///
    /// Removes every byte past the valid end, including later segments, and
    /// re-enables appends. Returns the number of bytes removed.
    pub fn truncate_tail(&self) -> Result<u64> {
        let mut guard = self.writer.lock();
        let damage = match self.damage.lock().clone() {
            Some(damage) => damage,
            None => return Ok(0),
        };
        let mut segments = self.segments.write();
        *guard = None;

        let number = damage.lsn.file;
        let mut removed = 0u64;
        for later in list_segments(&self.dir)?.into_iter().filter(|n| *n > number) {
            let path = segment_path(&self.dir, later);
            removed += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            std::fs::remove_file(&path)?;
            segments.remove(&later);
        }

        let path = segment_path(&self.dir, number);
        let file = if damage.rebuild_segment {
            if path.exists() {
                removed += std::fs::metadata(&path)?.len();
                std::fs::remove_file(&path)?;
            }
            create_segment(&self.dir, number, self.env_id)?
        } else {
            let file = open_segment_append(&self.dir, number, damage.lsn.offset)?;
            let keep = SEGMENT_HEADER_SIZE as u64 + damage.lsn.offset as u64;
            removed += file.metadata()?.len().saturating_sub(keep);
            file.set_len(keep)?;
            file.sync_all()?;
            file
        };
        sync_dir(&self.dir)?;

        segments.insert(number, damage.lsn.offset);
        *guard = Some(ActiveSegment {
            file: Arc::new(file),
            number,
            end: damage.lsn.offset,
        });
        self.end_lsn.store(damage.lsn.to_u64(), Ordering::Release);
        self.flushed_lsn.store(damage.lsn.to_u64(), Ordering::Release);
        *self.damage.lock() = None;

        info!(
            target: "stratalog::log",
            lsn = %damage.lsn,
            bytes = removed,
            reason = %damage.reason,
            "Truncated damaged log tail"
        );
        Ok(removed)
    }

    /// Whether appends are blocked on a damaged tail.
    pub fn has_damaged_tail(&self) -> bool {
        self.damage.lock().is_some()
    }

    /// Paths of segments lying entirely below `before` (never the active one).
    pub fn archivable(&self, before: Lsn) -> Vec<PathBuf> {
        let active = self.writer.lock().as_ref().map(|a| a.number);
        self.segments
            .read()
            .keys()
            .filter(|n| **n < before.file && Some(**n) != active)
            .map(|n| segment_path(&self.dir, *n))
            .collect()
    }

    /// Delete segments lying entirely below `before`. Returns removed paths.
    pub fn remove_segments_before(&self, before: Lsn) -> Result<Vec<PathBuf>> {
        let guard = self.writer.lock();
        let active = guard.as_ref().map(|a| a.number);
        let mut segments = self.segments.write();

        let doomed: Vec<u32> = segments
            .keys()
            .copied()
            .filter(|n| *n < before.file && Some(*n) != active)
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for number in doomed {
            let path = segment_path(&self.dir, number);
            std::fs::remove_file(&path)?;
            segments.remove(&number);
            removed.push(path);
        }
        if !removed.is_empty() {
            sync_dir(&self.dir)?;
            info!(
                target: "stratalog::log",
                count = removed.len(),
                before = %before,
                "Removed archived log segments"
            );
        }
        Ok(removed)
    }

    /// Flush and stop accepting appends.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.writer.lock().is_some() {
            self.flush_all()?;
        }
        self.closed.store(true, Ordering::Release);
        *self.writer.lock() = None;
        Ok(())
    }

    /// Whether [`LogStore::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// First record position of the oldest segment.
    pub fn first_lsn(&self) -> Lsn {
        self.segments
            .read()
            .keys()
            .next()
            .map(|n| Lsn::start_of(*n))
            .unwrap_or_else(|| self.end_lsn())
    }

    /// Next append position.
    pub fn end_lsn(&self) -> Lsn {
        Lsn::from_u64(self.end_lsn.load(Ordering::Acquire))
    }

    /// Every record before this position is durable.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn::from_u64(self.flushed_lsn.load(Ordering::Acquire))
    }

    /// File holding the record at `lsn`.
    pub fn segment_path(&self, lsn: Lsn) -> PathBuf {
        segment_path(&self.dir, lsn.file)
    }

    /// Segment numbers currently on disk, oldest first.
    pub fn segment_numbers(&self) -> Vec<u32> {
        self.segments.read().keys().copied().collect()
    }

    /// Log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Environment the segments belong to.
    pub fn env_id(&self) -> EnvId {
        self.env_id
    }

    /// Active configuration.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// What the open-time scan found.
    pub fn scan_report(&self) -> &ScanReport {
        &self.scan
    }

    /// Snapshot of the cumulative counters.
    pub fn stats(&self) -> LogStats {
        let c = &self.counters;
        LogStats {
            appends: c.appends.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            sync_calls: c.sync_calls.load(Ordering::Relaxed),
            sync_nanos: c.sync_nanos.load(Ordering::Relaxed),
            flush_requests: c.flush_requests.load(Ordering::Relaxed),
            flushes_coalesced: c.flushes_coalesced.load(Ordering::Relaxed),
            rotations: c.rotations.load(Ordering::Relaxed),
            first_lsn: self.first_lsn(),
            end_lsn: self.end_lsn(),
            flushed_lsn: self.flushed_lsn(),
            segments: self.segments.read().len(),
        }
    }

    pub(crate) fn segment_end(&self, number: u32) -> Option<u32> {
        self.segments.read().get(&number).copied()
    }

    /// First record position at or after `pos`, skipping empty segments.
    pub(crate) fn record_at_or_after(&self, mut pos: Lsn) -> Option<Lsn> {
        let end = self.end_lsn();
        let segments = self.segments.read();
        loop {
            if pos >= end {
                return None;
            }
            if let Some(seg_end) = segments.get(&pos.file) {
                if pos.offset < *seg_end {
                    return Some(pos);
                }
            }
            let next = pos.file.checked_add(1)?;
            let (number, _) = segments.range(next..).next()?;
            pos = Lsn::start_of(*number);
        }
    }

    /// Boundary at which the record preceding `pos` ends.
    ///
    /// The returned position is either `pos` itself (the previous record is
    /// in the same segment) or the end of an earlier non-empty segment.
    pub(crate) fn boundary_before(&self, pos: Lsn) -> Option<Lsn> {
        let pos = pos.min(self.end_lsn());
        let segments = self.segments.read();
        if pos.offset > 0 && segments.contains_key(&pos.file) {
            return Some(pos);
        }
        segments
            .range(..pos.file)
            .rev()
            .find(|(_, end)| **end > 0)
            .map(|(number, end)| Lsn::new(*number, *end))
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        if let Some(active) = self.writer.get_mut().as_ref() {
            let _ = active.file.sync_data();
        }
    }
}

/// Lazily opened read handles, one per segment.
///
/// Readers own their handles so they never contend with the writer or with
/// each other.
pub(crate) struct SegmentHandles {
    dir: PathBuf,
    files: HashMap<u32, File>,
}

const MAX_OPEN_SEGMENTS: usize = 8;

impl SegmentHandles {
    pub(crate) fn new(dir: PathBuf) -> Self {
        SegmentHandles {
            dir,
            files: HashMap::new(),
        }
    }

    pub(crate) fn get(&mut self, number: u32) -> Result<&mut File> {
        if !self.files.contains_key(&number) {
            if self.files.len() >= MAX_OPEN_SEGMENTS {
                self.files.clear();
            }
            let file = open_segment(&self.dir, number).map_err(|e| open_error(number, e))?;
            self.files.insert(number, file);
        }
        self.files
            .get_mut(&number)
            .ok_or_else(|| Error::not_found(format!("segment {} handle", number)))
    }

    pub(crate) fn release(&mut self) {
        self.files.clear();
    }
}

fn open_error(number: u32, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::not_found(format!("segment {} has been removed", number))
    } else {
        e.into()
    }
}

fn eof_as_corrupt(lsn: Lsn, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::corrupt(lsn, "segment ends inside the record")
    } else {
        e.into()
    }
}

/// Read and verify the frame starting at `lsn`.
pub(crate) fn read_frame(file: &mut File, lsn: Lsn, segment_end: u32) -> Result<LogRecord> {
    file.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE as u64 + lsn.offset as u64))?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)
        .map_err(|e| eof_as_corrupt(lsn, e))?;
    let total_len = frame_length(&len_buf).map_err(|e| Error::corrupt(lsn, e.to_string()))?;
    if lsn.offset as u64 + total_len as u64 > segment_end as u64 {
        return Err(Error::corrupt(
            lsn,
            format!("record of {} bytes runs past the segment end", total_len),
        ));
    }

    let mut frame = vec![0u8; total_len];
    frame[..4].copy_from_slice(&len_buf);
    file.read_exact(&mut frame[4..])
        .map_err(|e| eof_as_corrupt(lsn, e))?;
    LogRecord::decode(lsn, &frame)
        .map(|(record, _)| record)
        .map_err(|e| Error::corrupt(lsn, e.to_string()))
}

/// Start of the record that ends at `boundary` (read from its trailer).
pub(crate) fn record_ending_at(file: &mut File, boundary: Lsn) -> Result<Lsn> {
    if (boundary.offset as usize) < RECORD_OVERHEAD {
        return Err(Error::corrupt(boundary, "no room for a record before this offset"));
    }
    file.seek(SeekFrom::Start(
        SEGMENT_HEADER_SIZE as u64 + boundary.offset as u64 - 4,
    ))?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)
        .map_err(|e| eof_as_corrupt(boundary, e))?;
    let total_len = LittleEndian::read_u32(&len_buf);
    if (total_len as usize) < RECORD_OVERHEAD || total_len > boundary.offset {
        return Err(Error::corrupt(
            boundary,
            format!("trailing length {} is invalid", total_len),
        ));
    }
    Ok(Lsn::new(boundary.file, boundary.offset - total_len))
}

/// Iterator over one transaction's records, newest first.
pub struct TxnChain<'a> {
    store: &'a LogStore,
    next: Option<Lsn>,
    handles: SegmentHandles,
}

impl Iterator for TxnChain<'_> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let lsn = self.next.take()?;
        let result = self
            .store
            .segment_end(lsn.file)
            .filter(|end| lsn.offset < *end)
            .ok_or_else(|| Error::not_found(format!("no record at {}", lsn)))
            .and_then(|end| {
                let file = self.handles.get(lsn.file)?;
                read_frame(file, lsn, end)
            });
        if let Ok(record) = &result {
            self.next = record.prev_lsn;
        }
        Some(result)
    }
}
