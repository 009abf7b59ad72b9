//! Transaction table
//!
//! Tracks every live transaction (ACTIVE or PREPARED) and its LSN chain, and
//! writes the transaction-control records for it:
//!
//! ```text
//! begin ──► ACTIVE ──prepare──► PREPARED
//!             │                    │
//!             ├──commit/abort──────┤
//!             ▼                    ▼
//!        (outcome remembered, entry released)
//! ```
//!
//! Every transactional record is back-linked to the same transaction's
//! previous record, so `last_lsn` is the head of a chain that can be walked
//! newest-first with [`LogStore::txn_chain`].
//!
//! Entries live in a sharded map. Each entry is mutated only by the client
//! that owns the transaction (or by recovery), under its shard lock; log
//! flushes always happen after that lock is released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use stratalog_core::{Error, GlobalTxnId, Lsn, RecordType, Result, TxnId, TxnState};
use stratalog_durability::{now_micros, LogRecord, LogStore};
use tracing::{debug, warn};

/// Snapshot of a live transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Transaction id
    pub id: TxnId,
    /// Current state
    pub state: TxnState,
    /// LSN of the transaction's first record
    pub first_lsn: Lsn,
    /// LSN of the transaction's most recent record
    pub last_lsn: Lsn,
    /// Global id assigned at prepare
    pub gid: Option<GlobalTxnId>,
}

/// A prepared transaction awaiting the coordinator's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedTransaction {
    /// Local transaction id
    pub txn_id: TxnId,
    /// Global id supplied at prepare
    pub gid: GlobalTxnId,
    /// LSN of the transaction's first record
    pub first_lsn: Lsn,
    /// LSN of the PREPARE record
    pub last_lsn: Lsn,
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TxnOutcome {
    /// `Committed` or `Aborted`
    pub state: TxnState,
    /// LSN of the COMMIT or ABORT record
    pub lsn: Lsn,
}

/// Transaction counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TxnStats {
    /// Transactions begun (including those found by recovery)
    pub begun: u64,
    /// Transactions committed
    pub committed: u64,
    /// Transactions aborted
    pub aborted: u64,
    /// Transactions that entered PREPARED
    pub prepared_total: u64,
    /// Currently ACTIVE
    pub active: usize,
    /// Currently PREPARED
    pub prepared: usize,
    /// Most transactions live at once
    pub max_live: usize,
    /// Id the next `begin` will hand out
    pub next_txn_id: TxnId,
    /// Earliest first LSN of any live transaction
    pub oldest_live_lsn: Option<Lsn>,
}

#[derive(Default)]
struct TableCounters {
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    prepared_total: AtomicU64,
    max_live: AtomicU64,
}

/// Live transactions and the outcomes of resolved ones.
pub struct TransactionTable {
    log: Arc<LogStore>,
    live: DashMap<TxnId, Transaction>,
    outcomes: DashMap<TxnId, TxnOutcome>,
    next_txn_id: AtomicU64,
    counters: TableCounters,
}

impl TransactionTable {
    /// Create an empty table writing to `log`; ids start at `next_txn_id`.
    pub fn new(log: Arc<LogStore>, next_txn_id: TxnId) -> Self {
        TransactionTable {
            log,
            live: DashMap::new(),
            outcomes: DashMap::new(),
            next_txn_id: AtomicU64::new(next_txn_id.max(1)),
            counters: TableCounters::default(),
        }
    }

    /// The log this table writes to.
    pub fn log(&self) -> &Arc<LogStore> {
        &self.log
    }

    /// Start a transaction. Appends a BEGIN record carrying a timestamp.
    pub fn begin(&self) -> Result<TxnId> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let lsn = self
            .log
            .append(Some(id), RecordType::Begin, &now_micros().to_le_bytes())?;
        self.live.insert(
            id,
            Transaction {
                id,
                state: TxnState::Active,
                first_lsn: lsn,
                last_lsn: lsn,
                gid: None,
            },
        );
        self.counters.begun.fetch_add(1, Ordering::Relaxed);
        self.note_live_count();
        debug!(target: "stratalog::txn", txn_id = id, lsn = %lsn, "Transaction begun");
        Ok(id)
    }

    /// Append a data record (`Update` or an application type) for an ACTIVE
    /// transaction.
    pub fn write(&self, txn_id: TxnId, record_type: RecordType, payload: &[u8]) -> Result<Lsn> {
        if !record_type.is_data() {
            return Err(Error::InvalidArgument(format!(
                "{} records are written by the transaction table, not by clients",
                record_type
            )));
        }
        let mut entry = self
            .live
            .get_mut(&txn_id)
            .ok_or_else(|| self.missing(txn_id, "ACTIVE"))?;
        if entry.state != TxnState::Active {
            return Err(Error::txn_state(txn_id, "ACTIVE", entry.state.as_str()));
        }
        let lsn = self
            .log
            .append_linked(Some(txn_id), record_type, Some(entry.last_lsn), payload)?;
        entry.last_lsn = lsn;
        Ok(lsn)
    }

    /// ACTIVE → PREPARED. The PREPARE record carries the global id and is
    /// durable when this returns.
    pub fn prepare(&self, txn_id: TxnId, gid: GlobalTxnId) -> Result<Lsn> {
        if let Some(other) = self
            .live
            .iter()
            .find(|t| t.id != txn_id && t.gid.as_ref() == Some(&gid))
        {
            return Err(Error::InvalidArgument(format!(
                "global id {} is already prepared by transaction {}",
                gid, other.id
            )));
        }

        let lsn = {
            let mut entry = self
                .live
                .get_mut(&txn_id)
                .ok_or_else(|| self.missing(txn_id, "ACTIVE"))?;
            if entry.state != TxnState::Active {
                return Err(Error::txn_state(txn_id, "ACTIVE", entry.state.as_str()));
            }
            let lsn = self.log.append_linked(
                Some(txn_id),
                RecordType::Prepare,
                Some(entry.last_lsn),
                &gid.to_bytes(),
            )?;
            entry.last_lsn = lsn;
            lsn
        };

        self.log.flush(lsn)?;

        if let Some(mut entry) = self.live.get_mut(&txn_id) {
            entry.state = TxnState::Prepared;
            entry.gid = Some(gid);
        }
        self.counters.prepared_total.fetch_add(1, Ordering::Relaxed);
        debug!(target: "stratalog::txn", txn_id, lsn = %lsn, "Transaction prepared");
        Ok(lsn)
    }

    /// Commit an ACTIVE or PREPARED transaction. Returns the LSN of the
    /// COMMIT record, which is durable when this returns.
    pub fn commit(&self, txn_id: TxnId) -> Result<Lsn> {
        self.resolve(txn_id, TxnState::Committed)
    }

    /// Abort an ACTIVE or PREPARED transaction. Undo of its updates is the
    /// caller's job and must happen before this is called.
    pub fn abort(&self, txn_id: TxnId) -> Result<Lsn> {
        self.resolve(txn_id, TxnState::Aborted)
    }

    fn resolve(&self, txn_id: TxnId, outcome: TxnState) -> Result<Lsn> {
        let record_type = match outcome {
            TxnState::Committed => RecordType::Commit,
            _ => RecordType::Abort,
        };

        let lsn = {
            let mut entry = self
                .live
                .get_mut(&txn_id)
                .ok_or_else(|| self.missing(txn_id, "ACTIVE or PREPARED"))?;
            if entry.state.is_terminal() {
                return Err(Error::txn_state(
                    txn_id,
                    "ACTIVE or PREPARED",
                    entry.state.as_str(),
                ));
            }
            let lsn = self.log.append_linked(
                Some(txn_id),
                record_type,
                Some(entry.last_lsn),
                &now_micros().to_le_bytes(),
            )?;
            entry.last_lsn = lsn;
            lsn
        };

        // The entry keeps its live state until the record is durable, so a
        // failed flush leaves the transaction resolvable.
        if let Err(e) = self.log.flush(lsn) {
            warn!(
                target: "stratalog::txn",
                txn_id,
                lsn = %lsn,
                error = %e,
                "Flush of {} record failed; outcome is not durable",
                record_type
            );
            return Err(e);
        }

        self.finish(txn_id, outcome, lsn);
        Ok(lsn)
    }

    fn finish(&self, txn_id: TxnId, state: TxnState, lsn: Lsn) {
        self.live.remove(&txn_id);
        self.outcomes.insert(txn_id, TxnOutcome { state, lsn });
        match state {
            TxnState::Committed => self.counters.committed.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.aborted.fetch_add(1, Ordering::Relaxed),
        };
        debug!(target: "stratalog::txn", txn_id, lsn = %lsn, state = %state, "Transaction resolved");
    }

    fn missing(&self, txn_id: TxnId, expected: &str) -> Error {
        match self.outcomes.get(&txn_id) {
            Some(outcome) => Error::txn_state(txn_id, expected, outcome.state.as_str()),
            None => Error::txn_state(txn_id, expected, "UNKNOWN"),
        }
    }

    fn note_live_count(&self) {
        self.counters
            .max_live
            .fetch_max(self.live.len() as u64, Ordering::Relaxed);
    }

    /// Snapshot of a live transaction.
    pub fn get(&self, txn_id: TxnId) -> Option<Transaction> {
        self.live.get(&txn_id).map(|t| t.clone())
    }

    /// State of a transaction, live or resolved.
    pub fn state(&self, txn_id: TxnId) -> Option<TxnState> {
        self.live
            .get(&txn_id)
            .map(|t| t.state)
            .or_else(|| self.outcomes.get(&txn_id).map(|o| o.state))
    }

    /// All live transactions, oldest first.
    pub fn live(&self) -> Vec<Transaction> {
        let mut txns: Vec<Transaction> = self.live.iter().map(|t| t.clone()).collect();
        txns.sort_by_key(|t| (t.first_lsn, t.id));
        txns
    }

    /// Prepared transactions, oldest first.
    pub fn prepared(&self) -> Vec<PreparedTransaction> {
        let mut prepared: Vec<PreparedTransaction> = self
            .live
            .iter()
            .filter(|t| t.state == TxnState::Prepared)
            .filter_map(|t| {
                t.gid.clone().map(|gid| PreparedTransaction {
                    txn_id: t.id,
                    gid,
                    first_lsn: t.first_lsn,
                    last_lsn: t.last_lsn,
                })
            })
            .collect();
        prepared.sort_by_key(|p| (p.first_lsn, p.txn_id));
        prepared
    }

    /// Earliest first LSN of any live (ACTIVE or PREPARED) transaction.
    pub fn live_min_first_lsn(&self) -> Option<Lsn> {
        self.live.iter().map(|t| t.first_lsn).min()
    }

    /// How a resolved transaction ended.
    pub fn outcome(&self, txn_id: TxnId) -> Option<TxnOutcome> {
        self.outcomes.get(&txn_id).map(|o| *o)
    }

    /// Number of remembered outcomes.
    pub fn outcome_count(&self) -> usize {
        self.outcomes.len()
    }

    /// Drop remembered outcomes whose COMMIT/ABORT record lies before `lsn`.
    pub fn forget_outcomes_before(&self, lsn: Lsn) -> usize {
        let before = self.outcomes.len();
        self.outcomes.retain(|_, outcome| outcome.lsn >= lsn);
        before - self.outcomes.len()
    }

    /// Id the next `begin` will hand out.
    pub fn next_txn_id(&self) -> TxnId {
        self.next_txn_id.load(Ordering::SeqCst)
    }

    /// Make sure future ids are at least `next`.
    pub fn advance_txn_ids(&self, next: TxnId) {
        self.next_txn_id.fetch_max(next, Ordering::SeqCst);
    }

    /// Apply a record found in the log to the table (recovery bookkeeping).
    ///
    /// BEGIN creates an ACTIVE entry, PREPARE moves it to PREPARED with the
    /// global id from the payload, COMMIT/ABORT release it and remember the
    /// outcome. Any other transactional record advances `last_lsn`; a
    /// transaction first seen through such a record began before the scan
    /// window and gets that record as its first LSN.
    pub fn replay_record(&self, record: &LogRecord) -> Result<()> {
        let txn_id = match record.txn_id {
            Some(id) => id,
            None => return Ok(()),
        };
        self.advance_txn_ids(txn_id.saturating_add(1));

        match record.record_type {
            RecordType::Commit | RecordType::Abort => {
                let state = if record.record_type == RecordType::Commit {
                    TxnState::Committed
                } else {
                    TxnState::Aborted
                };
                self.finish(txn_id, state, record.lsn);
                return Ok(());
            }
            RecordType::Begin => {
                self.counters.begun.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        let gid = if record.record_type == RecordType::Prepare {
            let gid = GlobalTxnId::from_bytes(&record.payload).map_err(|e| {
                Error::corrupt(record.lsn, format!("PREPARE payload is not a global id: {}", e))
            })?;
            self.counters.prepared_total.fetch_add(1, Ordering::Relaxed);
            Some(gid)
        } else {
            None
        };

        let mut entry = self.live.entry(txn_id).or_insert_with(|| Transaction {
            id: txn_id,
            state: TxnState::Active,
            first_lsn: record.lsn,
            last_lsn: record.lsn,
            gid: None,
        });
        entry.last_lsn = record.lsn;
        if gid.is_some() {
            entry.state = TxnState::Prepared;
            entry.gid = gid;
        }
        drop(entry);
        self.note_live_count();
        Ok(())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TxnStats {
        let (mut active, mut prepared) = (0, 0);
        for txn in self.live.iter() {
            match txn.state {
                TxnState::Prepared => prepared += 1,
                _ => active += 1,
            }
        }
        TxnStats {
            begun: self.counters.begun.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            prepared_total: self.counters.prepared_total.load(Ordering::Relaxed),
            active,
            prepared,
            max_live: self.counters.max_live.load(Ordering::Relaxed) as usize,
            next_txn_id: self.next_txn_id(),
            oldest_live_lsn: self.live_min_first_lsn(),
        }
    }
}
