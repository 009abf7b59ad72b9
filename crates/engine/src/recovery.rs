//! Recovery engine
//!
//! Rebuilds transaction state from the log after a restart and coordinates
//! the resolution of transactions left PREPARED.
//!
//! ## States
//!
//! ```text
//! Scanning ──backward pass──► Pass1Complete ──► Replaying ──forward pass──┐
//!                                                                          │
//!        Done ◄──last resolution── PreparedPending ◄──prepared left?──yes─┤
//!          ▲                                                               │
//!          └──────────────────────────────────────────────────────no──────┘
//! ```
//!
//! ## Passes
//!
//! 1. Backward pass (LAST → PREV down to the checkpoint LSN): collects the
//!    transactions in the window, their last record type, the highest id,
//!    and which of them have no BEGIN inside the window.
//! 2. Forward pass (SET_RANGE(checkpoint) → NEXT): rebuilds the transaction
//!    table and dispatches every record with [`RecoveryOp::ForwardRoll`].
//! 3. The damaged tail (if any) is cut off, and transactions that are
//!    neither resolved nor prepared are rolled back through their
//!    back-links and closed with an ABORT record.
//!
//! Corruption before the checkpoint LSN is fatal: the records there are
//! needed to reconstruct transactions assumed to be live. Corruption after
//! it only ends the log early.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use stratalog_concurrency::{PreparedTransaction, TransactionTable};
use stratalog_core::{Error, Lsn, RecordType, Result, TxnId, TxnState};
use stratalog_durability::{Checkpoint, CursorOp, LogRecord, LogStore, ScanStop};
use tracing::{info, warn};

use crate::dispatch::{DispatchOutcome, DispatchTable, EnvInfo, RecoveryOp};

/// Recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryState {
    /// Reading the log backward from its tail
    Scanning,
    /// Backward pass finished; replay window known
    Pass1Complete,
    /// Forward replay in progress
    Replaying,
    /// Replay finished; prepared transactions await resolution
    PreparedPending,
    /// Every transaction is resolved
    Done,
}

/// Where a `txn_recover` batch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverPosition {
    /// Restart from the oldest pending transaction
    First,
    /// Continue after the last entry returned
    Next,
}

/// Coordinator decision for a prepared transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Make the transaction's effects permanent
    Commit,
    /// Undo the transaction
    Abort,
}

/// What recovery found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// LSN of the checkpoint used, if one was valid
    pub checkpoint_lsn: Option<Lsn>,
    /// First position replayed
    pub start_lsn: Lsn,
    /// End of the valid log at startup
    pub end_lsn: Lsn,
    /// Records read by the backward pass
    pub records_scanned: u64,
    /// Records a handler or the hook applied during the forward pass
    pub records_replayed: u64,
    /// Records skipped during the forward pass
    pub records_ignored: u64,
    /// Distinct transactions seen in the replay window
    pub transactions_seen: usize,
    /// COMMIT records replayed
    pub committed: u64,
    /// ABORT records replayed
    pub aborted: u64,
    /// Unresolved transactions rolled back
    pub rolled_back: u64,
    /// Transactions left PREPARED
    pub prepared: usize,
    /// Transactions with records in the window but no BEGIN there
    pub begun_before_checkpoint: usize,
    /// Bytes of damaged tail removed
    pub bytes_truncated: u64,
}

#[derive(Debug, Default)]
struct WindowTxn {
    last_type: Option<RecordType>,
    saw_begin: bool,
}

struct Pending {
    /// Oldest first
    entries: Vec<PreparedTransaction>,
    /// Sort key of the last entry handed out by `txn_recover`
    position: Option<(Lsn, TxnId)>,
}

/// Replays the log and owns the prepared-transaction list.
pub struct RecoveryEngine {
    log: Arc<LogStore>,
    table: Arc<TransactionTable>,
    dispatch: Arc<DispatchTable>,
    env: EnvInfo,
    state: Mutex<RecoveryState>,
    pending: Mutex<Pending>,
    report: Mutex<Option<RecoveryReport>>,
}

impl RecoveryEngine {
    /// Create an engine in the `Scanning` state.
    pub fn new(
        log: Arc<LogStore>,
        table: Arc<TransactionTable>,
        dispatch: Arc<DispatchTable>,
        env: EnvInfo,
    ) -> Self {
        RecoveryEngine {
            log,
            table,
            dispatch,
            env,
            state: Mutex::new(RecoveryState::Scanning),
            pending: Mutex::new(Pending {
                entries: Vec::new(),
                position: None,
            }),
            report: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> RecoveryState {
        *self.state.lock()
    }

    /// Report of the completed scan, once it has run.
    pub fn report(&self) -> Option<RecoveryReport> {
        self.report.lock().clone()
    }

    fn set_state(&self, state: RecoveryState) {
        *self.state.lock() = state;
        info!(target: "stratalog::recovery", state = ?state, "Recovery state changed");
    }

    /// Run recovery from `checkpoint` (or the start of the log).
    ///
    /// Must run before any client touches the log or the table.
    pub fn recover(&self, checkpoint: Option<&Checkpoint>) -> Result<RecoveryReport> {
        if self.state() != RecoveryState::Scanning {
            return Err(Error::invalid_state("recovery has already run"));
        }

        let start = self.replay_start(checkpoint)?;
        let mut report = RecoveryReport {
            checkpoint_lsn: checkpoint.map(|c| c.lsn),
            start_lsn: start,
            end_lsn: self.log.end_lsn(),
            ..RecoveryReport::default()
        };
        if let Some(ckp) = checkpoint {
            self.table.advance_txn_ids(ckp.next_txn_id);
        }

        info!(
            target: "stratalog::recovery",
            start = %start,
            end = %report.end_lsn,
            checkpoint = ?report.checkpoint_lsn,
            "Recovery started"
        );

        // Pass 1: backward
        let window = self.backward_pass(start, &mut report)?;
        report.transactions_seen = window.len();
        report.begun_before_checkpoint = window.values().filter(|t| !t.saw_begin).count();
        if let Some(max) = window.keys().max() {
            self.table.advance_txn_ids(max.saturating_add(1));
        }
        self.set_state(RecoveryState::Pass1Complete);

        // Pass 2: forward
        self.set_state(RecoveryState::Replaying);
        self.forward_pass(start, &mut report)?;

        if self.log.has_damaged_tail() {
            report.bytes_truncated = self.log.truncate_tail()?;
        }

        // Losers: neither resolved nor prepared
        for txn in self.table.live() {
            if txn.state != TxnState::Active {
                continue;
            }
            let undone = self
                .dispatch
                .undo_chain(&self.env, &self.log, txn.last_lsn, RecoveryOp::BackwardRoll)?;
            self.table.abort(txn.id)?;
            report.rolled_back += 1;
            info!(
                target: "stratalog::recovery",
                txn_id = txn.id,
                records_undone = undone,
                "Rolled back unresolved transaction"
            );
        }

        for (id, scanned) in &window {
            if scanned.last_type == Some(RecordType::Prepare)
                && self.table.state(*id) != Some(TxnState::Prepared)
            {
                warn!(
                    target: "stratalog::recovery",
                    txn_id = id,
                    "Backward and forward passes disagree on a prepared transaction"
                );
            }
        }

        let prepared = self.table.prepared();
        report.prepared = prepared.len();
        {
            let mut pending = self.pending.lock();
            pending.entries = prepared;
            pending.position = None;
        }
        *self.report.lock() = Some(report.clone());

        info!(
            target: "stratalog::recovery",
            records_replayed = report.records_replayed,
            committed = report.committed,
            aborted = report.aborted,
            rolled_back = report.rolled_back,
            prepared = report.prepared,
            bytes_truncated = report.bytes_truncated,
            "Recovery replay complete"
        );

        if report.prepared > 0 {
            self.set_state(RecoveryState::PreparedPending);
        } else {
            self.set_state(RecoveryState::Done);
        }
        Ok(report)
    }

    /// Validate the checkpoint against the log and pick the replay start.
    fn replay_start(&self, checkpoint: Option<&Checkpoint>) -> Result<Lsn> {
        let first = self.log.first_lsn();
        let end = self.log.end_lsn();
        let ckp = match checkpoint {
            Some(ckp) => ckp,
            None => return Ok(first),
        };

        if let Some(damage) = self.log.scan_report().stop.damage_lsn() {
            if damage < ckp.lsn {
                let reason = match &self.log.scan_report().stop {
                    ScanStop::Corrupt { reason, .. } => reason.clone(),
                    _ => "incomplete record".to_string(),
                };
                return Err(Error::recovery_failed(format!(
                    "log is damaged at {} ({}), before checkpoint {}",
                    damage, reason, ckp.lsn
                )));
            }
        }
        if ckp.lsn < first {
            return Err(Error::recovery_failed(format!(
                "checkpoint {} precedes the first available record {}",
                ckp.lsn, first
            )));
        }
        if ckp.lsn > end {
            return Err(Error::recovery_failed(format!(
                "checkpoint {} lies beyond the end of the log {}",
                ckp.lsn, end
            )));
        }
        if ckp.end_lsn > end {
            warn!(
                target: "stratalog::recovery",
                checkpoint_end = %ckp.end_lsn,
                log_end = %end,
                "Log ends before the position recorded at checkpoint time"
            );
        }
        Ok(ckp.lsn)
    }

    fn backward_pass(
        &self,
        start: Lsn,
        report: &mut RecoveryReport,
    ) -> Result<HashMap<TxnId, WindowTxn>> {
        let mut window: HashMap<TxnId, WindowTxn> = HashMap::new();
        let mut cursor = self.log.cursor();
        let mut next = cursor.get(CursorOp::Last);
        loop {
            let record = match next {
                Ok(record) if record.lsn >= start => record,
                Ok(_) => break,
                Err(e) if e.is_not_found() => break,
                Err(e) => {
                    return Err(Error::recovery_failed(format!(
                        "backward pass failed: {}",
                        e
                    )))
                }
            };
            report.records_scanned += 1;
            if let Some(id) = record.txn_id {
                let entry = window.entry(id).or_default();
                if entry.last_type.is_none() {
                    entry.last_type = Some(record.record_type);
                }
                if record.record_type == RecordType::Begin {
                    entry.saw_begin = true;
                }
            }
            if record.lsn == start {
                break;
            }
            next = cursor.get(CursorOp::Prev);
        }
        Ok(window)
    }

    fn forward_pass(&self, start: Lsn, report: &mut RecoveryReport) -> Result<()> {
        let mut cursor = self.log.cursor();
        let mut next = cursor.get(CursorOp::SetRange(start));
        loop {
            let record = match next {
                Ok(record) => record,
                Err(e) if e.is_not_found() => break,
                Err(Error::CorruptRecord { lsn, reason }) => {
                    warn!(
                        target: "stratalog::recovery",
                        lsn = %lsn,
                        reason = %reason,
                        "Corrupt record during replay; treating as end of log"
                    );
                    break;
                }
                Err(e) => {
                    return Err(Error::recovery_failed(format!(
                        "forward pass failed: {}",
                        e
                    )))
                }
            };

            self.table.replay_record(&record).map_err(|e| {
                Error::recovery_failed(format!("record {} cannot be replayed: {}", record.lsn, e))
            })?;
            match record.record_type {
                RecordType::Commit => report.committed += 1,
                RecordType::Abort => report.aborted += 1,
                _ => {}
            }
            self.replay_one(&record, report)?;
            next = cursor.get(CursorOp::Next);
        }
        Ok(())
    }

    fn replay_one(&self, record: &LogRecord, report: &mut RecoveryReport) -> Result<()> {
        match self.dispatch.dispatch(&self.env, record, RecoveryOp::ForwardRoll) {
            Ok(DispatchOutcome::Applied) => report.records_replayed += 1,
            Ok(DispatchOutcome::Ignored) => report.records_ignored += 1,
            Ok(DispatchOutcome::Error(msg)) => {
                return Err(Error::recovery_failed(format!(
                    "dispatch of record {} failed: {}",
                    record.lsn, msg
                )))
            }
            Err(e) => {
                return Err(Error::recovery_failed(format!(
                    "handler for record {} failed: {}",
                    record.lsn, e
                )))
            }
        }
        Ok(())
    }

    fn ensure_scanned(&self) -> Result<()> {
        match self.state() {
            RecoveryState::PreparedPending | RecoveryState::Done => Ok(()),
            state => Err(Error::invalid_state(format!(
                "recovery scan has not completed (state {:?})",
                state
            ))),
        }
    }

    /// Every prepared transaction still awaiting resolution, oldest first.
    pub fn prepared(&self) -> Result<Vec<PreparedTransaction>> {
        self.ensure_scanned()?;
        Ok(self.pending.lock().entries.clone())
    }

    /// Return up to `count` pending prepared transactions.
    ///
    /// `First` restarts from the oldest entry; `Next` continues after the
    /// last entry returned. An empty batch means the list is exhausted.
    pub fn txn_recover(
        &self,
        count: usize,
        position: RecoverPosition,
    ) -> Result<Vec<PreparedTransaction>> {
        self.ensure_scanned()?;
        if count == 0 {
            return Err(Error::InvalidArgument(
                "txn_recover batch size must be at least 1".into(),
            ));
        }
        let mut pending = self.pending.lock();
        if position == RecoverPosition::First {
            pending.position = None;
        }
        let after = pending.position;
        let batch: Vec<PreparedTransaction> = pending
            .entries
            .iter()
            .filter(|p| after.map_or(true, |key| (p.first_lsn, p.txn_id) > key))
            .take(count)
            .cloned()
            .collect();
        if let Some(last) = batch.last() {
            pending.position = Some((last.first_lsn, last.txn_id));
        }
        Ok(batch)
    }

    /// Whether `txn_id` is a recovered prepared transaction awaiting
    /// resolution.
    pub fn is_pending(&self, txn_id: TxnId) -> bool {
        self.pending
            .lock()
            .entries
            .iter()
            .any(|p| p.txn_id == txn_id)
    }

    /// First LSN of the oldest pending prepared transaction. Segments at or
    /// above it must not be archived.
    pub fn pending_min_first_lsn(&self) -> Option<Lsn> {
        self.pending.lock().entries.iter().map(|p| p.first_lsn).min()
    }

    /// Apply the coordinator's decision to a recovered prepared transaction.
    ///
    /// Returns the LSN of the COMMIT or ABORT record. When the last pending
    /// transaction is resolved the engine reaches `Done`.
    pub fn resolve(&self, txn_id: TxnId, resolution: Resolution) -> Result<Lsn> {
        self.ensure_scanned()?;
        let entry = self
            .pending
            .lock()
            .entries
            .iter()
            .find(|p| p.txn_id == txn_id)
            .cloned();
        let entry = match entry {
            Some(entry) => entry,
            None => {
                let actual = self
                    .table
                    .state(txn_id)
                    .map(|s| s.as_str())
                    .unwrap_or("UNKNOWN");
                return Err(Error::txn_state(txn_id, "PREPARED (recovered)", actual));
            }
        };

        let lsn = match resolution {
            Resolution::Commit => self.table.commit(txn_id)?,
            Resolution::Abort => {
                self.dispatch
                    .undo_chain(&self.env, &self.log, entry.last_lsn, RecoveryOp::Abort)?;
                self.table.abort(txn_id)?
            }
        };

        let remaining = {
            let mut pending = self.pending.lock();
            pending.entries.retain(|p| p.txn_id != txn_id);
            pending.entries.len()
        };
        info!(
            target: "stratalog::recovery",
            txn_id,
            gid = %entry.gid,
            resolution = ?resolution,
            remaining,
            "Resolved prepared transaction"
        );
        if remaining == 0 {
            self.set_state(RecoveryState::Done);
        }
        Ok(lsn)
    }
}
