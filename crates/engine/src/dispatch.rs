//! Per-record-type dispatch
//!
//! Recovery replay, undo, and replicated apply all route records through one
//! [`DispatchTable`]: a map from record-type tag to [`RecordHandler`], plus an
//! optional [`AppDispatch`] hook that intercepts application-defined record
//! types before the map is consulted.
//!
//! ```text
//! record ──► application type and hook installed? ──yes──► hook outcome
//!                       │ no
//!                       ▼
//!            handler registered for tag? ──yes──► handler outcome
//!                       │ no
//!                       ▼
//!                    Ignored
//! ```
//!
//! Handlers are registered before or after the environment opens; replay
//! only ever sees the table as it stands when a record is dispatched.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use stratalog_core::{EnvId, Error, Lsn, RecordType, Result};
use stratalog_durability::{LogRecord, LogStore};
use tracing::{debug, info};

/// Identifier of a replication site.
pub type SiteId = u32;

/// Environment context handed to callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    /// Identity stamped into every segment and checkpoint
    pub env_id: EnvId,
    /// Environment directory
    pub dir: PathBuf,
    /// This site's replication id
    pub site_id: SiteId,
}

/// Why a record is being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryOp {
    /// Redo during the recovery forward pass
    ForwardRoll,
    /// Undo of a transaction that recovery is rolling back
    BackwardRoll,
    /// Redo of a record received from another site (live pass)
    Apply,
    /// Undo of a transaction aborted by its owner or coordinator
    Abort,
}

impl RecoveryOp {
    /// Redo operations move state forward.
    pub fn is_redo(&self) -> bool {
        matches!(self, RecoveryOp::ForwardRoll | RecoveryOp::Apply)
    }

    /// Undo operations reverse a record's effect.
    pub fn is_undo(&self) -> bool {
        !self.is_redo()
    }
}

impl fmt::Display for RecoveryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryOp::ForwardRoll => "forward-roll",
            RecoveryOp::BackwardRoll => "backward-roll",
            RecoveryOp::Apply => "apply",
            RecoveryOp::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// Result of dispatching one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The record's effect was applied (or reversed)
    Applied,
    /// The record was skipped
    Ignored,
    /// The callback failed; the operation driving the dispatch must stop
    Error(String),
}

/// Application hook for application-defined record types.
///
/// Called once per record; the `Lsn` argument is the record's position.
pub trait AppDispatch: Send + Sync {
    /// Handle one record.
    fn dispatch(&self, env: &EnvInfo, record: &LogRecord, lsn: Lsn, op: RecoveryOp)
        -> DispatchOutcome;
}

impl<F> AppDispatch for F
where
    F: Fn(&EnvInfo, &LogRecord, Lsn, RecoveryOp) -> DispatchOutcome + Send + Sync,
{
    fn dispatch(
        &self,
        env: &EnvInfo,
        record: &LogRecord,
        lsn: Lsn,
        op: RecoveryOp,
    ) -> DispatchOutcome {
        self(env, record, lsn, op)
    }
}

/// Handler registered for one record type.
pub trait RecordHandler: Send + Sync {
    /// Handle one record.
    fn handle(&self, record: &LogRecord, op: RecoveryOp) -> Result<DispatchOutcome>;
}

impl<F> RecordHandler for F
where
    F: Fn(&LogRecord, RecoveryOp) -> Result<DispatchOutcome> + Send + Sync,
{
    fn handle(&self, record: &LogRecord, op: RecoveryOp) -> Result<DispatchOutcome> {
        self(record, op)
    }
}

/// Record-type tag → handler map with an optional application hook.
#[derive(Default)]
pub struct DispatchTable {
    handlers: RwLock<HashMap<u16, Arc<dyn RecordHandler>>>,
    app: RwLock<Option<Arc<dyn AppDispatch>>>,
}

impl DispatchTable {
    /// Empty table: every record is ignored.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `record_type`, replacing any previous one.
    pub fn register(&self, record_type: RecordType, handler: Arc<dyn RecordHandler>) {
        let replaced = self
            .handlers
            .write()
            .insert(record_type.tag(), handler)
            .is_some();
        info!(
            target: "stratalog::dispatch",
            record_type = %record_type,
            replaced,
            "Registered record handler"
        );
    }

    /// Remove the handler for `record_type`.
    pub fn unregister(&self, record_type: RecordType) -> bool {
        let removed = self.handlers.write().remove(&record_type.tag()).is_some();
        if removed {
            info!(target: "stratalog::dispatch", record_type = %record_type, "Unregistered record handler");
        }
        removed
    }

    /// Install the application hook.
    pub fn set_app_dispatch(&self, hook: Arc<dyn AppDispatch>) {
        *self.app.write() = Some(hook);
    }

    /// Whether an application hook is installed.
    pub fn has_app_dispatch(&self) -> bool {
        self.app.read().is_some()
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Route one record.
    ///
    /// Application types go to the hook when one is installed, and its
    /// answer is final. Everything else goes to the handler registered for
    /// the record's tag; records with no handler are ignored. `Err` is
    /// returned only when a handler itself fails.
    pub fn dispatch(
        &self,
        env: &EnvInfo,
        record: &LogRecord,
        op: RecoveryOp,
    ) -> Result<DispatchOutcome> {
        if record.record_type.is_application() {
            let hook = self.app.read().clone();
            if let Some(hook) = hook {
                return Ok(hook.dispatch(env, record, record.lsn, op));
            }
        }

        let handler = self.handlers.read().get(&record.record_type.tag()).cloned();
        match handler {
            Some(handler) => handler.handle(record, op),
            None => Ok(DispatchOutcome::Ignored),
        }
    }

    /// Undo a transaction by walking its records newest-first from
    /// `last_lsn` and dispatching every data record with `op`.
    ///
    /// Returns the number of records dispatched. A callback error stops the
    /// walk and is reported as `RecoveryFailed`.
    pub fn undo_chain(
        &self,
        env: &EnvInfo,
        log: &LogStore,
        last_lsn: Lsn,
        op: RecoveryOp,
    ) -> Result<usize> {
        let mut undone = 0;
        for record in log.txn_chain(last_lsn) {
            let record = match record {
                Ok(record) => record,
                // Chain runs into segments that were already archived
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            };
            if !record.record_type.is_data() {
                continue;
            }
            match self.dispatch(env, &record, op) {
                Ok(DispatchOutcome::Error(msg)) => {
                    return Err(Error::recovery_failed(format!(
                        "{} of record {} failed: {}",
                        op, record.lsn, msg
                    )))
                }
                Ok(_) => undone += 1,
                Err(e) => {
                    return Err(Error::recovery_failed(format!(
                        "{} of record {} failed: {}",
                        op, record.lsn, e
                    )))
                }
            }
        }
        debug!(target: "stratalog::dispatch", last_lsn = %last_lsn, op = %op, undone, "Undo walk complete");
        Ok(undone)
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<u16> = self.handlers.read().keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("DispatchTable")
            .field("handlers", &tags)
            .field("app_dispatch", &self.has_app_dispatch())
            .finish()
    }
}
