//! Log cursor.
//!
//! A cursor is a stateful reader positioned on a record. It owns its own
//! segment handles, so any number of cursors can run alongside each other
//! and alongside appends; none of them take the writer lock. Handles are
//! released by [`LogCursor::close`] or, failing that, when the cursor is
//! dropped.

use std::sync::Arc;

use stratalog_core::{Error, Lsn, Result};

use super::store::{read_frame, record_ending_at, LogStore, SegmentHandles};
use crate::format::LogRecord;

/// Positioning request for [`LogCursor::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// The record at exactly this LSN
    Set(Lsn),
    /// The record after the current one (`First` when unpositioned)
    Next,
    /// The record before the current one (`Last` when unpositioned)
    Prev,
    /// The oldest record in the log
    First,
    /// The newest record in the log
    Last,
    /// The first record whose LSN is at or after this LSN
    SetRange(Lsn),
    /// Re-read the current record
    Current,
}

/// Positioned reader over a [`LogStore`].
pub struct LogCursor {
    store: Arc<LogStore>,
    handles: Option<SegmentHandles>,
    /// Current record and its frame length
    position: Option<(Lsn, u32)>,
}

impl LogCursor {
    /// Open an unpositioned cursor.
    pub fn new(store: Arc<LogStore>) -> Self {
        let handles = SegmentHandles::new(store.dir().to_path_buf());
        LogCursor {
            store,
            handles: Some(handles),
            position: None,
        }
    }

    /// Position the cursor and return the record there.
    ///
    /// Fails with `NotFound` when no record satisfies the request; the
    /// cursor then keeps its previous position. Fails with `InvalidState`
    /// once the cursor has been closed.
    pub fn get(&mut self, op: CursorOp) -> Result<LogRecord> {
        if self.handles.is_none() {
            return Err(Error::invalid_state("log cursor is closed"));
        }
        let target = self.resolve(op)?;
        let record = match self.read_at(target) {
            Err(e) if e.is_corrupt() && matches!(op, CursorOp::Set(_)) => {
                // A bad frame at a position that is not a record boundary
                // means the caller asked for a record that does not exist.
                if self.first_at_or_after(target).ok() != Some(target) {
                    return Err(Error::not_found(format!("no record at {}", target)));
                }
                return Err(e);
            }
            other => other?,
        };
        self.position = Some((record.lsn, record.frame_len() as u32));
        Ok(record)
    }

    /// LSN of the current record.
    pub fn position(&self) -> Option<Lsn> {
        self.position.map(|(lsn, _)| lsn)
    }

    /// Release the cursor's file handles. Every later call fails with
    /// `InvalidState`, including a second `close`.
    pub fn close(&mut self) -> Result<()> {
        match self.handles.take() {
            Some(mut handles) => {
                handles.release();
                self.position = None;
                Ok(())
            }
            None => Err(Error::invalid_state("log cursor is already closed")),
        }
    }

    /// Whether [`LogCursor::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.handles.is_none()
    }

    fn resolve(&mut self, op: CursorOp) -> Result<Lsn> {
        match op {
            CursorOp::First => self
                .store
                .record_at_or_after(self.store.first_lsn())
                .ok_or_else(|| Error::not_found("log is empty")),
            CursorOp::Last => self.record_before(self.store.end_lsn()),
            CursorOp::Next => match self.position {
                None => self.resolve(CursorOp::First),
                Some((lsn, len)) => self
                    .store
                    .record_at_or_after(Lsn::new(lsn.file, lsn.offset + len))
                    .ok_or_else(|| Error::not_found(format!("no record after {}", lsn))),
            },
            CursorOp::Prev => match self.position {
                None => self.resolve(CursorOp::Last),
                Some((lsn, _)) => self.record_before(lsn),
            },
            CursorOp::Current => self
                .position
                .map(|(lsn, _)| lsn)
                .ok_or_else(|| Error::not_found("cursor is not positioned")),
            CursorOp::Set(lsn) => {
                if lsn < self.store.first_lsn() || lsn >= self.store.end_lsn() {
                    return Err(Error::not_found(format!("no record at {}", lsn)));
                }
                Ok(lsn)
            }
            CursorOp::SetRange(lsn) => self.first_at_or_after(lsn),
        }
    }

    /// The record immediately preceding `pos`.
    fn record_before(&mut self, pos: Lsn) -> Result<Lsn> {
        let boundary = self
            .store
            .boundary_before(pos)
            .ok_or_else(|| Error::not_found(format!("no record before {}", pos)))?;
        let file = self.handles_mut()?.get(boundary.file)?;
        record_ending_at(file, boundary)
    }

    /// Walk the record boundaries of `lsn`'s segment until reaching `lsn`.
    fn first_at_or_after(&mut self, lsn: Lsn) -> Result<Lsn> {
        let first = self.store.first_lsn();
        let not_found = || Error::not_found(format!("no record at or after {}", lsn));
        if lsn <= first {
            return self.store.record_at_or_after(first).ok_or_else(not_found);
        }
        if lsn >= self.store.end_lsn() {
            return Err(not_found());
        }
        let segment_end = match self.store.segment_end(lsn.file) {
            Some(end) => end,
            None => {
                return self
                    .store
                    .record_at_or_after(Lsn::start_of(lsn.file))
                    .ok_or_else(not_found)
            }
        };

        let mut offset = 0u32;
        while offset < lsn.offset && offset < segment_end {
            let file = self.handles_mut()?.get(lsn.file)?;
            let record = read_frame(file, Lsn::new(lsn.file, offset), segment_end)?;
            offset += record.frame_len() as u32;
        }
        self.store
            .record_at_or_after(Lsn::new(lsn.file, offset))
            .ok_or_else(not_found)
    }

    fn read_at(&mut self, lsn: Lsn) -> Result<LogRecord> {
        let segment_end = self
            .store
            .segment_end(lsn.file)
            .filter(|end| lsn.offset < *end)
            .ok_or_else(|| Error::not_found(format!("no record at {}", lsn)))?;
        let file = self.handles_mut()?.get(lsn.file)?;
        read_frame(file, lsn, segment_end)
    }

    fn handles_mut(&mut self) -> Result<&mut SegmentHandles> {
        self.handles
            .as_mut()
            .ok_or_else(|| Error::invalid_state("log cursor is closed"))
    }
}

impl Drop for LogCursor {
    fn drop(&mut self) {
        if let Some(mut handles) = self.handles.take() {
            handles.release();
        }
    }
}

impl LogStore {
    /// Open a cursor over this store.
    pub fn cursor(self: &Arc<Self>) -> LogCursor {
        LogCursor::new(Arc::clone(self))
    }
}
