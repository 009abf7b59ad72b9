//! Environment: the init/teardown owner of a log directory
//!
//! Opening an environment
//! 1. takes an exclusive lock on the directory,
//! 2. loads `stratalog.toml` (or the configuration given to the builder),
//! 3. opens and verifies the log,
//! 4. runs recovery from the last valid checkpoint,
//! 5. starts the log shipper when a replication transport is installed.
//!
//! No handle exists until recovery has finished, so recovery always owns
//! the log exclusively. Everything after that goes through the methods
//! here: transactions, checkpoints, archival, cursors, statistics.
//!
//! # Example
//!
//! ```ignore
//! use stratalog_engine::Environment;
//!
//! let env = Environment::builder()
//!     .dir("/data/env")
//!     .handler(RecordType::Update, Arc::new(apply_update))
//!     .open()?;
//!
//! let tx = env.begin()?;
//! env.write(tx, RecordType::Update, b"payload")?;
//! env.commit(tx)?;
//! env.close()?;
//! ```

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use stratalog_concurrency::{PreparedTransaction, TransactionTable, TxnStats};
use stratalog_core::{Error, GlobalTxnId, Lsn, RecordType, Result, TxnId};
use stratalog_durability::{
    now_micros, Checkpoint, CheckpointFile, LogCursor, LogStats, LogStore,
};
use tracing::{error, info, warn};

use crate::config::{EnvConfig, CONFIG_FILE_NAME};
use crate::dispatch::{AppDispatch, DispatchTable, EnvInfo, RecordHandler, RecoveryOp, SiteId};
use crate::recovery::{
    RecoverPosition, RecoveryEngine, RecoveryReport, RecoveryState, Resolution,
};
use crate::replication::{
    LogShipper, ReceiveOutcome, ReplicationDispatcher, ReplicationTransport, ShipperStats,
    SiteStats,
};

/// Lock file taken for the lifetime of an open environment.
pub const LOCK_FILE_NAME: &str = ".lock";

/// Subdirectory holding the log segments.
pub const LOG_DIR_NAME: &str = "log";

/// Builder for [`Environment`].
///
/// Callbacks are injected here and are in place before recovery runs.
#[derive(Default)]
pub struct EnvironmentBuilder {
    dir: Option<PathBuf>,
    config: Option<EnvConfig>,
    handlers: Vec<(RecordType, Arc<dyn RecordHandler>)>,
    app_dispatch: Option<Arc<dyn AppDispatch>>,
    transport: Option<Arc<dyn ReplicationTransport>>,
}

impl EnvironmentBuilder {
    /// Create new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the environment directory (required).
    pub fn dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Use `config` instead of `stratalog.toml`.
    pub fn config(mut self, config: EnvConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register a handler for `record_type`.
    pub fn handler(mut self, record_type: RecordType, handler: Arc<dyn RecordHandler>) -> Self {
        self.handlers.push((record_type, handler));
        self
    }

    /// Install the application dispatch hook.
    pub fn app_dispatch(mut self, hook: Arc<dyn AppDispatch>) -> Self {
        self.app_dispatch = Some(hook);
        self
    }

    /// Install the replication transport.
    pub fn transport(mut self, transport: Arc<dyn ReplicationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Open the environment, running recovery.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if no directory was set
    /// - `InvalidState` if another process holds the environment
    /// - `Config` if the configuration is invalid
    /// - `RecoveryFailed` if the log cannot be recovered
    pub fn open(self) -> Result<Environment> {
        let dir = self.dir.ok_or_else(|| {
            Error::InvalidArgument("EnvironmentBuilder::open() requires a directory".into())
        })?;
        std::fs::create_dir_all(&dir)?;
        let dir = dir.canonicalize()?;

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(dir.join(LOCK_FILE_NAME))?;
        fs2::FileExt::try_lock_exclusive(&lock_file).map_err(|_| {
            Error::invalid_state(format!(
                "environment at '{}' is already open",
                dir.display()
            ))
        })?;

        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => {
                let path = dir.join(CONFIG_FILE_NAME);
                EnvConfig::write_default_if_missing(&path)?;
                EnvConfig::from_file(&path)?
            }
        };

        let log_dir = dir.join(LOG_DIR_NAME);
        let checkpoint_file = CheckpointFile::new(&log_dir);
        let stored = load_checkpoint(&checkpoint_file);
        let log = Arc::new(LogStore::open_for_env(
            &log_dir,
            config.log.clone(),
            stored.as_ref().map(|ckp| ckp.env_id),
        )?);
        let checkpoint = stored.and_then(|ckp| {
            if ckp.env_id == log.env_id() {
                return Some(ckp);
            }
            warn!(
                target: "stratalog::env",
                checkpoint_env = %ckp.env_id,
                log_env = %log.env_id(),
                "Checkpoint belongs to another environment; recovering from the start of the log"
            );
            None
        });

        let info = EnvInfo {
            env_id: log.env_id(),
            dir: dir.clone(),
            site_id: config.replication.site_id,
        };

        let dispatch = Arc::new(DispatchTable::new());
        for (record_type, handler) in self.handlers {
            dispatch.register(record_type, handler);
        }
        if let Some(hook) = self.app_dispatch {
            dispatch.set_app_dispatch(hook);
        }

        let table = Arc::new(TransactionTable::new(
            Arc::clone(&log),
            checkpoint.map_or(1, |c| c.next_txn_id),
        ));
        let recovery = RecoveryEngine::new(
            Arc::clone(&log),
            Arc::clone(&table),
            Arc::clone(&dispatch),
            info.clone(),
        );
        recovery.recover(checkpoint.as_ref())?;

        let replication = Arc::new(ReplicationDispatcher::new(
            info.clone(),
            self.transport,
            Arc::clone(&dispatch),
        ));
        for site in &config.replication.sites {
            replication.add_site(*site)?;
        }
        replication.load_progress(&dir)?;
        let shipper = if replication.has_transport() {
            let from = shipping_start(&log, replication.shipped_through());
            Some(LogShipper::start(
                Arc::clone(&replication),
                Arc::clone(&log),
                from,
            )?)
        } else {
            None
        };

        info!(
            target: "stratalog::env",
            dir = ?dir,
            env_id = %info.env_id,
            site_id = info.site_id,
            recovery_state = ?recovery.state(),
            end_lsn = %log.end_lsn(),
            "Environment opened"
        );

        Ok(Environment {
            info,
            config,
            log,
            table,
            dispatch,
            recovery,
            replication,
            shipper,
            checkpoint_file,
            mark: Mutex::new(CheckpointMark {
                checkpoint,
                taken_at: Instant::now(),
                bytes_written: 0,
            }),
            closed: AtomicBool::new(false),
            _lock_file: lock_file,
        })
    }
}

/// Where the shipper resumes: the saved position when the log still holds
/// it, otherwise the current end of the log.
fn shipping_start(log: &LogStore, saved: Option<Lsn>) -> Lsn {
    let first = log.first_lsn();
    let end = log.end_lsn();
    match saved {
        Some(lsn) if lsn >= first && lsn <= end => lsn,
        Some(lsn) if lsn < first => {
            warn!(
                target: "stratalog::env",
                saved = %lsn,
                first_lsn = %first,
                "Unshipped log segments were archived; shipping resumes at the oldest segment"
            );
            first
        }
        Some(lsn) => {
            warn!(
                target: "stratalog::env",
                saved = %lsn,
                end_lsn = %end,
                "Saved shipping position is past the end of the log"
            );
            end
        }
        None => end,
    }
}

fn load_checkpoint(file: &CheckpointFile) -> Option<Checkpoint> {
    match file.load() {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            warn!(
                target: "stratalog::env",
                path = ?file.path(),
                error = %e,
                "Checkpoint file is invalid; recovering from the start of the log"
            );
            None
        }
    }
}

struct CheckpointMark {
    checkpoint: Option<Checkpoint>,
    taken_at: Instant,
    /// Log bytes written (since open) when the checkpoint was taken
    bytes_written: u64,
}

/// Aggregated counters.
#[derive(Debug, Clone)]
pub struct EnvStats {
    /// Log counters
    pub log: LogStats,
    /// Transaction counters
    pub txn: TxnStats,
    /// Per-site replication counters
    pub sites: Vec<(SiteId, SiteStats)>,
    /// Log shipper counters, when a transport is installed
    pub shipper: Option<ShipperStats>,
    /// Recovery state
    pub recovery_state: RecoveryState,
    /// LSN of the last checkpoint
    pub last_checkpoint: Option<Lsn>,
}

/// An open environment.
pub struct Environment {
    info: EnvInfo,
    config: EnvConfig,
    log: Arc<LogStore>,
    table: Arc<TransactionTable>,
    dispatch: Arc<DispatchTable>,
    recovery: RecoveryEngine,
    replication: Arc<ReplicationDispatcher>,
    shipper: Option<LogShipper>,
    checkpoint_file: CheckpointFile,
    mark: Mutex<CheckpointMark>,
    closed: AtomicBool,
    _lock_file: File,
}

impl Environment {
    /// Builder for configuring callbacks before open.
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    /// Open `dir` with defaults and no callbacks.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        EnvironmentBuilder::new().dir(dir.as_ref()).open()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::invalid_state("environment is closed"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Start a transaction.
    pub fn begin(&self) -> Result<TxnId> {
        self.ensure_open()?;
        self.table.begin()
    }

    /// Append a data record for an ACTIVE transaction.
    pub fn write(&self, txn_id: TxnId, record_type: RecordType, payload: &[u8]) -> Result<Lsn> {
        self.ensure_open()?;
        self.table.write(txn_id, record_type, payload)
    }

    /// Durably prepare a transaction under a global id.
    pub fn prepare(&self, txn_id: TxnId, gid: GlobalTxnId) -> Result<Lsn> {
        self.ensure_open()?;
        self.table.prepare(txn_id, gid)
    }

    /// Commit a transaction; durable on return. The log shipper is woken
    /// to ship it, which never delays the commit.
    ///
    /// Committing a recovered prepared transaction resolves it.
    pub fn commit(&self, txn_id: TxnId) -> Result<Lsn> {
        self.ensure_open()?;
        let lsn = if self.recovery.is_pending(txn_id) {
            self.recovery.resolve(txn_id, Resolution::Commit)?
        } else {
            self.table.commit(txn_id)?
        };
        self.wake_shipper();
        Ok(lsn)
    }

    /// Undo a transaction's records through the dispatch table, then abort
    /// it; durable on return.
    ///
    /// Aborting a recovered prepared transaction resolves it.
    pub fn abort(&self, txn_id: TxnId) -> Result<Lsn> {
        self.ensure_open()?;
        if self.recovery.is_pending(txn_id) {
            return self.recovery.resolve(txn_id, Resolution::Abort);
        }
        if let Some(txn) = self.table.get(txn_id) {
            if !txn.state.is_terminal() {
                self.dispatch
                    .undo_chain(&self.info, &self.log, txn.last_lsn, RecoveryOp::Abort)?;
            }
        }
        self.table.abort(txn_id)
    }

    fn wake_shipper(&self) {
        if let Some(shipper) = &self.shipper {
            shipper.notify();
        }
    }

    // ------------------------------------------------------------------
    // Prepared-transaction recovery
    // ------------------------------------------------------------------

    /// Batch of recovered prepared transactions awaiting resolution.
    pub fn txn_recover(
        &self,
        count: usize,
        position: RecoverPosition,
    ) -> Result<Vec<PreparedTransaction>> {
        self.ensure_open()?;
        self.recovery.txn_recover(count, position)
    }

    /// Every recovered prepared transaction awaiting resolution.
    pub fn prepared(&self) -> Result<Vec<PreparedTransaction>> {
        self.ensure_open()?;
        self.recovery.prepared()
    }

    /// Apply a coordinator decision to a recovered prepared transaction.
    pub fn resolve(&self, txn_id: TxnId, resolution: Resolution) -> Result<Lsn> {
        self.ensure_open()?;
        let lsn = self.recovery.resolve(txn_id, resolution)?;
        if resolution == Resolution::Commit {
            self.wake_shipper();
        }
        Ok(lsn)
    }

    /// Recovery state.
    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    /// What recovery found at open.
    pub fn recovery_report(&self) -> Option<RecoveryReport> {
        self.recovery.report()
    }

    // ------------------------------------------------------------------
    // Checkpoints and archival
    // ------------------------------------------------------------------

    /// Take a checkpoint now.
    ///
    /// The checkpoint LSN is the first LSN of the oldest live transaction,
    /// or the end of the log when none is live. Outcomes of transactions
    /// resolved before it are forgotten and replica progress is saved.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        self.ensure_open()?;
        let mut mark = self.mark.lock();

        self.log.flush_all()?;
        let end = self.log.end_lsn();
        let lsn = self.table.live_min_first_lsn().map_or(end, |l| l.min(end));
        let checkpoint = Checkpoint {
            env_id: self.info.env_id,
            lsn,
            end_lsn: end,
            next_txn_id: self.table.next_txn_id(),
            created_at_micros: now_micros(),
        };
        self.checkpoint_file.persist(&checkpoint)?;
        let forgotten = self.table.forget_outcomes_before(lsn);
        self.replication.save_progress(&self.info.dir)?;

        *mark = CheckpointMark {
            checkpoint: Some(checkpoint),
            taken_at: Instant::now(),
            bytes_written: self.log.stats().bytes_written,
        };
        info!(
            target: "stratalog::env",
            lsn = %lsn,
            end_lsn = %end,
            next_txn_id = checkpoint.next_txn_id,
            outcomes_forgotten = forgotten,
            "Checkpoint taken"
        );
        Ok(checkpoint)
    }

    /// Take a checkpoint if a configured threshold has been reached and the
    /// log has grown since the last one.
    pub fn checkpoint_if_needed(&self) -> Result<Option<Checkpoint>> {
        self.ensure_open()?;
        let due = {
            let mark = self.mark.lock();
            let grown = mark
                .checkpoint
                .map_or(true, |c| self.log.end_lsn() != c.end_lsn);
            let thresholds = self.config.checkpoint;
            let written = self.log.stats().bytes_written.saturating_sub(mark.bytes_written);
            let by_size = thresholds.kbytes > 0 && written >= thresholds.kbytes * 1024;
            let by_time = thresholds.minutes > 0
                && mark.taken_at.elapsed() >= Duration::from_secs(thresholds.minutes * 60);
            let always = thresholds.kbytes == 0 && thresholds.minutes == 0;
            grown && (always || by_size || by_time)
        };
        if due {
            self.checkpoint().map(Some)
        } else {
            Ok(None)
        }
    }

    /// The most recent checkpoint.
    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.mark.lock().checkpoint
    }

    /// Everything before this position may be archived.
    ///
    /// When shipping, waits for the shipper to catch up with the flushed
    /// log first. Transactions still live at that point are covered by the
    /// live bound taken before the wait.
    fn archive_bound(&self) -> Option<Lsn> {
        let mut bound = self.mark.lock().checkpoint?.lsn;
        if let Some(live) = self.table.live_min_first_lsn() {
            bound = bound.min(live);
        }
        if let Some(pending) = self.recovery.pending_min_first_lsn() {
            bound = bound.min(pending);
        }
        if let Some(shipper) = &self.shipper {
            shipper.drain();
            bound = bound.min(shipper.position());
        }
        Some(bound)
    }

    /// Segments no longer needed: wholly below the last checkpoint, below
    /// every live or pending transaction and already shipped.
    pub fn archivable_segments(&self) -> Result<Vec<PathBuf>> {
        self.ensure_open()?;
        Ok(self
            .archive_bound()
            .map(|bound| self.log.archivable(bound))
            .unwrap_or_default())
    }

    /// Remove the segments [`archivable_segments`](Self::archivable_segments)
    /// lists. Returns the removed paths.
    pub fn archive(&self) -> Result<Vec<PathBuf>> {
        self.ensure_open()?;
        match self.archive_bound() {
            Some(bound) => self.log.remove_segments_before(bound),
            None => Ok(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Log access
    // ------------------------------------------------------------------

    /// Open a cursor over the log.
    pub fn log_cursor(&self) -> Result<LogCursor> {
        self.ensure_open()?;
        Ok(self.log.cursor())
    }

    /// Segment file holding `lsn`.
    pub fn log_file(&self, lsn: Lsn) -> PathBuf {
        self.log.segment_path(lsn)
    }

    /// Force the log to stable storage up to `lsn`.
    pub fn flush(&self, lsn: Lsn) -> Result<()> {
        self.ensure_open()?;
        self.log.flush(lsn)
    }

    /// The underlying log.
    pub fn log(&self) -> &Arc<LogStore> {
        &self.log
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Apply a record shipped from `from_site`.
    pub fn receive(&self, control: &[u8], record: &[u8], from_site: SiteId) -> Result<ReceiveOutcome> {
        self.ensure_open()?;
        self.replication.receive(control, record, from_site)
    }

    /// The replication dispatcher.
    pub fn replication(&self) -> &Arc<ReplicationDispatcher> {
        &self.replication
    }

    /// Start shipping to `site`. It receives every commit the shipper has
    /// not passed yet.
    pub fn add_site(&self, site: SiteId) -> Result<()> {
        self.ensure_open()?;
        if self.shipper.is_none() {
            return Err(Error::invalid_state(
                "no replication transport was installed at open",
            ));
        }
        self.replication.add_site(site)
    }

    /// Stop shipping to `site`. Returns whether it was a shipping target.
    pub fn remove_site(&self, site: SiteId) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.replication.remove_site(site))
    }

    /// Block until every flushed COMMIT has been handed to the transport.
    pub fn drain_shipping(&self) {
        if let Some(shipper) = &self.shipper {
            shipper.drain();
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Environment context handed to callbacks.
    pub fn info(&self) -> &EnvInfo {
        &self.info
    }

    /// Effective configuration.
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// The dispatch table, for registering handlers after open.
    pub fn dispatch(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    /// The transaction table.
    pub fn transactions(&self) -> &Arc<TransactionTable> {
        &self.table
    }

    /// Counter snapshot.
    pub fn stats(&self) -> EnvStats {
        EnvStats {
            log: self.log.stats(),
            txn: self.table.stats(),
            sites: self.replication.stats(),
            shipper: self.shipper.as_ref().map(|s| s.stats()),
            recovery_state: self.recovery.state(),
            last_checkpoint: self.mark.lock().checkpoint.map(|c| c.lsn),
        }
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Ship what is flushed, save replication progress, flush and close the
    /// log.
    /// Every later call fails with `InvalidState`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::invalid_state("environment is already closed"));
        }
        if let Some(shipper) = &self.shipper {
            shipper.shutdown();
        }
        let live = self.table.live().len();
        if live > 0 {
            warn!(
                target: "stratalog::env",
                live,
                "Closing with unresolved transactions; recovery will handle them"
            );
        }
        self.replication.save_progress(&self.info.dir)?;
        self.log.close()?;
        info!(target: "stratalog::env", dir = ?self.info.dir, "Environment closed");
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                error!(target: "stratalog::env", error = %e, "Close on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("dir", &self.info.dir)
            .field("env_id", &self.info.env_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
