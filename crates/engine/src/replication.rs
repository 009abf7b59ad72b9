//! Replication dispatcher
//!
//! Ships committed transactions to remote sites through an injected
//! [`ReplicationTransport`] and applies records received from other sites
//! through the same [`DispatchTable`] recovery uses.
//!
//! Each shipped record travels as two blobs:
//! - control: a MessagePack-encoded [`ReplicationControl`]
//! - record: the exact on-disk frame, so the receiver re-verifies its CRC
//!
//! A non-zero transport status fails that site for the rest of the batch
//! and nothing else; the local commit never waits on a site.
//!
//! Shipping runs on the [`LogShipper`] worker thread, which reads the log
//! forward and ships each committed transaction when it reaches the COMMIT.
//! Batches therefore leave in commit-LSN order, even when the records of
//! one transaction interleave with another's. Every record carries an
//! [`ApplyPosition`] (its batch's COMMIT LSN, then its own LSN) and the
//! receiver drops anything at or below the last position it applied from
//! the sending site, which makes at-least-once delivery safe.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::ops::BitOr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use stratalog_core::{EnvId, Error, Lsn, RecordType, Result, TxnId};
use stratalog_durability::{CursorOp, LogRecord, LogStore};
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchOutcome, DispatchTable, EnvInfo, RecoveryOp, SiteId};

/// Version of the control blob layout.
pub const CONTROL_VERSION: u32 = 1;

/// File holding the last position applied from each site and the local
/// shipping position.
pub const PROGRESS_FILE_NAME: &str = "replica-progress.json";

/// Flags passed to the transport with each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SendFlags(u32);

impl SendFlags {
    /// No flags
    pub const NONE: SendFlags = SendFlags(0);
    /// The record must reach stable storage at the site (COMMIT, PREPARE)
    pub const PERMANENT: SendFlags = SendFlags(0x1);
    /// The record is the last of its batch
    pub const LAST_IN_BATCH: SendFlags = SendFlags(0x2);

    /// Raw bit value.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub fn contains(&self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

/// Transport capability: deliver one record to one site.
///
/// Returns 0 when the site accepted the record; any other value is a
/// site-level failure.
pub trait ReplicationTransport: Send + Sync {
    /// Send one record.
    fn send(
        &self,
        env: &EnvInfo,
        control: &[u8],
        record: &[u8],
        flags: SendFlags,
        site: SiteId,
    ) -> i32;
}

impl<F> ReplicationTransport for F
where
    F: Fn(&EnvInfo, &[u8], &[u8], SendFlags, SiteId) -> i32 + Send + Sync,
{
    fn send(
        &self,
        env: &EnvInfo,
        control: &[u8],
        record: &[u8],
        flags: SendFlags,
        site: SiteId,
    ) -> i32 {
        self(env, control, record, flags, site)
    }
}

/// Metadata travelling with every shipped record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationControl {
    /// Layout version
    pub version: u32,
    /// Sending environment
    pub env_id: EnvId,
    /// Record position at the sender
    pub lsn: Lsn,
    /// COMMIT that released the record's batch
    pub commit_lsn: Lsn,
    /// Record type tag
    pub record_type: u16,
    /// Owning transaction
    pub txn_id: Option<TxnId>,
}

impl ReplicationControl {
    /// Control blob for `record`, part of the batch released by the COMMIT
    /// at `commit_lsn`, shipped from `env_id`.
    pub fn for_record(env_id: EnvId, record: &LogRecord, commit_lsn: Lsn) -> Self {
        ReplicationControl {
            version: CONTROL_VERSION,
            env_id,
            lsn: record.lsn,
            commit_lsn,
            record_type: record.record_type.tag(),
            txn_id: record.txn_id,
        }
    }

    /// Encode as MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode from MessagePack.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Where the record sits in the sender's commit order.
    pub fn position(&self) -> ApplyPosition {
        ApplyPosition {
            commit_lsn: self.commit_lsn,
            lsn: self.lsn,
        }
    }
}

/// Order in which a receiver applies records from one site: by the COMMIT
/// that released the batch, then by record LSN within it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ApplyPosition {
    /// COMMIT LSN of the batch
    pub commit_lsn: Lsn,
    /// Record LSN
    pub lsn: Lsn,
}

impl ApplyPosition {
    /// Whether nothing has been applied yet.
    pub fn is_zero(&self) -> bool {
        self.commit_lsn.is_zero()
    }
}

impl fmt::Display for ApplyPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (commit {})", self.lsn, self.commit_lsn)
    }
}

/// Result of shipping one batch to one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteShipResult {
    /// Destination
    pub site: SiteId,
    /// 0, or the transport status that stopped the batch
    pub status: i32,
    /// Records the site accepted
    pub records_sent: usize,
    /// Record the site rejected
    pub failed_at: Option<Lsn>,
}

impl SiteShipResult {
    /// Whether the whole batch reached the site.
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// What `receive` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Dispatched and applied
    Applied,
    /// Dispatched and skipped by its handler or the hook
    Ignored,
    /// At or below the last position applied from the site; nothing done
    Duplicate,
}

/// Per-site counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SiteStats {
    /// Batches shipped to the site
    pub batches: u64,
    /// Records the site accepted
    pub records_sent: u64,
    /// Batches the site failed
    pub failures: u64,
    /// Status of the most recent failure
    pub last_failure_code: i32,
    /// Records received from the site
    pub received: u64,
    /// Received records dropped as duplicates
    pub duplicates: u64,
    /// Received records applied
    pub applied: u64,
    /// Received records skipped by dispatch
    pub ignored: u64,
    /// Last position applied from the site
    pub last_applied: Option<ApplyPosition>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReplicaProgress {
    version: u32,
    sites: BTreeMap<SiteId, ApplyPosition>,
    /// Local log position every earlier COMMIT has been shipped from
    #[serde(default)]
    shipped_through: Option<Lsn>,
}

/// Ships local commits and applies remote records.
pub struct ReplicationDispatcher {
    env: EnvInfo,
    transport: Option<Arc<dyn ReplicationTransport>>,
    sites: RwLock<Vec<SiteId>>,
    dispatch: Arc<DispatchTable>,
    stats: DashMap<SiteId, SiteStats>,
    /// Last position applied from each site; the entry lock serializes
    /// applies from one site
    applied: DashMap<SiteId, ApplyPosition>,
    shipped_through: Mutex<Option<Lsn>>,
}

impl ReplicationDispatcher {
    /// Dispatcher for `env`; without a transport `ship` does nothing.
    pub fn new(
        env: EnvInfo,
        transport: Option<Arc<dyn ReplicationTransport>>,
        dispatch: Arc<DispatchTable>,
    ) -> Self {
        ReplicationDispatcher {
            env,
            transport,
            sites: RwLock::new(Vec::new()),
            dispatch,
            stats: DashMap::new(),
            applied: DashMap::new(),
            shipped_through: Mutex::new(None),
        }
    }

    /// Whether a transport was installed.
    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Whether commits have anywhere to go.
    pub fn is_shipping(&self) -> bool {
        self.transport.is_some() && !self.sites.read().is_empty()
    }

    /// Add a remote site. The local site id is refused.
    pub fn add_site(&self, site: SiteId) -> Result<()> {
        if site == self.env.site_id {
            return Err(Error::InvalidArgument(format!(
                "site {} is the local site",
                site
            )));
        }
        let mut sites = self.sites.write();
        if !sites.contains(&site) {
            sites.push(site);
            sites.sort_unstable();
            info!(target: "stratalog::repl", site, "Added replication site");
        }
        Ok(())
    }

    /// Stop shipping to `site`. Returns whether it was a shipping target.
    pub fn remove_site(&self, site: SiteId) -> bool {
        let mut sites = self.sites.write();
        let before = sites.len();
        sites.retain(|s| *s != site);
        let removed = before != sites.len();
        if removed {
            info!(target: "stratalog::repl", site, "Removed replication site");
        }
        removed
    }

    /// Remote sites, ascending.
    pub fn sites(&self) -> Vec<SiteId> {
        self.sites.read().clone()
    }

    /// Send `batch` (oldest record first) to every remote site.
    ///
    /// The batch ends with the record that released it, normally the
    /// transaction's COMMIT. A site that fails a record receives nothing
    /// more from this batch; other sites are unaffected.
    pub fn ship(&self, batch: &[LogRecord]) -> Result<Vec<SiteShipResult>> {
        let transport = match &self.transport {
            Some(transport) => transport,
            None => return Ok(Vec::new()),
        };
        let commit_lsn = match batch.last() {
            Some(last) => last.lsn,
            None => return Ok(Vec::new()),
        };

        let mut encoded = Vec::with_capacity(batch.len());
        for (i, record) in batch.iter().enumerate() {
            let control =
                ReplicationControl::for_record(self.env.env_id, record, commit_lsn).to_bytes()?;
            let mut flags = SendFlags::NONE;
            if matches!(record.record_type, RecordType::Commit | RecordType::Prepare) {
                flags = flags | SendFlags::PERMANENT;
            }
            if i + 1 == batch.len() {
                flags = flags | SendFlags::LAST_IN_BATCH;
            }
            encoded.push((record.lsn, control, record.to_bytes(), flags));
        }

        let sites = self.sites();
        let mut results = Vec::with_capacity(sites.len());
        for site in sites {
            let mut result = SiteShipResult {
                site,
                status: 0,
                records_sent: 0,
                failed_at: None,
            };
            for (lsn, control, frame, flags) in &encoded {
                let status = transport.send(&self.env, control, frame, *flags, site);
                if status != 0 {
                    result.status = status;
                    result.failed_at = Some(*lsn);
                    break;
                }
                result.records_sent += 1;
            }

            let mut stats = self.stats.entry(site).or_default();
            stats.batches += 1;
            stats.records_sent += result.records_sent as u64;
            if !result.is_ok() {
                stats.failures += 1;
                stats.last_failure_code = result.status;
                warn!(
                    target: "stratalog::repl",
                    site,
                    status = result.status,
                    lsn = ?result.failed_at,
                    sent = result.records_sent,
                    "Replication site rejected record"
                );
            }
            results.push(result);
        }
        debug!(target: "stratalog::repl", records = batch.len(), "Shipped batch");
        Ok(results)
    }

    /// Apply a record received from `from_site`.
    ///
    /// Malformed blobs fail with `CorruptRecord`; a handler or hook failure
    /// fails with `ReplicationFailed`. Records at or below the last
    /// [`ApplyPosition`] applied from the site are dropped.
    pub fn receive(&self, control: &[u8], record: &[u8], from_site: SiteId) -> Result<ReceiveOutcome> {
        let control = ReplicationControl::from_bytes(control)
            .map_err(|e| Error::corrupt(Lsn::ZERO, format!("malformed control blob: {}", e)))?;
        if control.version != CONTROL_VERSION {
            return Err(Error::corrupt(
                control.lsn,
                format!("unsupported control version {}", control.version),
            ));
        }
        let (decoded, consumed) = LogRecord::decode(control.lsn, record)
            .map_err(|e| Error::corrupt(control.lsn, e.to_string()))?;
        if consumed != record.len() {
            return Err(Error::corrupt(
                control.lsn,
                format!("{} trailing bytes after record frame", record.len() - consumed),
            ));
        }
        if decoded.record_type.tag() != control.record_type || decoded.txn_id != control.txn_id {
            return Err(Error::corrupt(
                control.lsn,
                "control blob does not describe the record",
            ));
        }
        if control.commit_lsn < control.lsn {
            return Err(Error::corrupt(
                control.lsn,
                format!("record follows its batch's commit at {}", control.commit_lsn),
            ));
        }

        let position = control.position();
        let mut last = self.applied.entry(from_site).or_default();
        self.stats.entry(from_site).or_default().received += 1;
        if position <= *last {
            self.stats.entry(from_site).or_default().duplicates += 1;
            debug!(
                target: "stratalog::repl",
                site = from_site,
                position = %position,
                last_applied = %*last,
                "Dropped duplicate record"
            );
            return Ok(ReceiveOutcome::Duplicate);
        }

        let outcome = match self.dispatch.dispatch(&self.env, &decoded, RecoveryOp::Apply) {
            Ok(DispatchOutcome::Applied) => ReceiveOutcome::Applied,
            Ok(DispatchOutcome::Ignored) => ReceiveOutcome::Ignored,
            Ok(DispatchOutcome::Error(msg)) => {
                return Err(Error::ReplicationFailed(format!(
                    "apply of {} from site {} failed: {}",
                    decoded.lsn, from_site, msg
                )))
            }
            Err(e) => {
                return Err(Error::ReplicationFailed(format!(
                    "apply of {} from site {} failed: {}",
                    decoded.lsn, from_site, e
                )))
            }
        };

        *last = position;
        let mut stats = self.stats.entry(from_site).or_default();
        match outcome {
            ReceiveOutcome::Applied => stats.applied += 1,
            _ => stats.ignored += 1,
        }
        stats.last_applied = Some(position);
        Ok(outcome)
    }

    /// Last position applied from `site`.
    pub fn last_applied(&self, site: SiteId) -> Option<ApplyPosition> {
        self.applied.get(&site).map(|p| *p).filter(|p| !p.is_zero())
    }

    /// Local log position every earlier COMMIT has been shipped from, as
    /// last recorded by the shipper or restored from the progress file.
    pub fn shipped_through(&self) -> Option<Lsn> {
        *self.shipped_through.lock()
    }

    fn note_shipped(&self, lsn: Lsn) {
        let mut shipped = self.shipped_through.lock();
        if shipped.map_or(true, |current| lsn > current) {
            *shipped = Some(lsn);
        }
    }

    /// Counters for one site.
    pub fn site_stats(&self, site: SiteId) -> SiteStats {
        self.stats.get(&site).map(|s| s.clone()).unwrap_or_default()
    }

    /// Counters for every site seen, ascending by site.
    pub fn stats(&self) -> Vec<(SiteId, SiteStats)> {
        let mut all: Vec<(SiteId, SiteStats)> = self
            .stats
            .iter()
            .map(|s| (*s.key(), s.value().clone()))
            .collect();
        all.sort_by_key(|(site, _)| *site);
        all
    }

    /// Persist per-site applied positions and the shipping position to
    /// `dir` (temp file, fsync, rename).
    pub fn save_progress(&self, dir: &Path) -> Result<()> {
        let progress = ReplicaProgress {
            version: CONTROL_VERSION,
            sites: self
                .applied
                .iter()
                .filter(|e| !e.value().is_zero())
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            shipped_through: self.shipped_through(),
        };
        let json = serde_json::to_vec_pretty(&progress)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let path = dir.join(PROGRESS_FILE_NAME);
        let temp_path = path.with_extension("json.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Reload what [`save_progress`](Self::save_progress) wrote. Returns
    /// the number of sites restored.
    pub fn load_progress(&self, dir: &Path) -> Result<usize> {
        let path = dir.join(PROGRESS_FILE_NAME);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let progress: ReplicaProgress = serde_json::from_slice(&bytes).map_err(|e| {
            Error::Serialization(format!("{}: {}", path.display(), e))
        })?;
        for (site, position) in &progress.sites {
            let mut entry = self.applied.entry(*site).or_default();
            if *position > *entry {
                *entry = *position;
            }
            self.stats.entry(*site).or_default().last_applied = Some(*entry);
        }
        if let Some(lsn) = progress.shipped_through {
            self.note_shipped(lsn);
        }
        Ok(progress.sites.len())
    }
}

impl fmt::Debug for ReplicationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationDispatcher")
            .field("site_id", &self.env.site_id)
            .field("sites", &self.sites())
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

// ============================================================================
// Asynchronous shipping
// ============================================================================

/// Shipper counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShipperStats {
    /// Committed transactions handed to the dispatcher
    pub shipped: u64,
    /// Log position every earlier COMMIT has been shipped from
    pub shipped_through: Lsn,
    /// Passes cut short by a log read error
    pub read_errors: u64,
}

struct ShipState {
    /// Every COMMIT before this position has been shipped
    position: Lsn,
    requested: bool,
    stopped: bool,
}

struct ShipperInner {
    log: Arc<LogStore>,
    dispatcher: Arc<ReplicationDispatcher>,
    state: Mutex<ShipState>,
    work_ready: Condvar,
    progress: Condvar,
    shutdown: AtomicBool,
    shipped: AtomicU64,
    read_errors: AtomicU64,
}

/// Single worker thread that follows the flushed log and ships every
/// committed transaction in commit-LSN order.
///
/// Commits only wake the worker; what gets shipped is decided by reading
/// the log, so a slow transport never blocks or drops a commit.
pub struct LogShipper {
    inner: Arc<ShipperInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogShipper {
    /// Start the worker. COMMIT records at or after `from` will be shipped.
    pub fn start(
        dispatcher: Arc<ReplicationDispatcher>,
        log: Arc<LogStore>,
        from: Lsn,
    ) -> Result<Self> {
        let inner = Arc::new(ShipperInner {
            log,
            dispatcher,
            state: Mutex::new(ShipState {
                position: from,
                requested: true,
                stopped: false,
            }),
            work_ready: Condvar::new(),
            progress: Condvar::new(),
            shutdown: AtomicBool::new(false),
            shipped: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
        });
        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("stratalog-ship".to_string())
            .spawn(move || ship_loop(&worker_inner))?;
        debug!(target: "stratalog::repl", from = %from, "Log shipper started");
        Ok(LogShipper {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Wake the worker; called after a commit becomes durable.
    pub fn notify(&self) {
        let mut state = self.inner.state.lock();
        state.requested = true;
        self.inner.work_ready.notify_one();
    }

    /// Block until every COMMIT flushed before this call has been shipped.
    pub fn drain(&self) {
        let target = self.inner.log.flushed_lsn();
        let mut state = self.inner.state.lock();
        if state.position >= target {
            return;
        }
        state.requested = true;
        self.inner.work_ready.notify_one();
        while state.position < target && !state.stopped {
            self.inner.progress.wait(&mut state);
        }
    }

    /// Every COMMIT before this position has been shipped.
    pub fn position(&self) -> Lsn {
        self.inner.state.lock().position
    }

    /// Ship what is already flushed, then stop the worker.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _state = self.inner.state.lock();
            self.inner.work_ready.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(target: "stratalog::repl", "Ship worker panicked");
            }
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ShipperStats {
        ShipperStats {
            shipped: self.inner.shipped.load(Ordering::Relaxed),
            shipped_through: self.position(),
            read_errors: self.inner.read_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for LogShipper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for LogShipper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogShipper")
            .field("position", &self.position())
            .finish()
    }
}

fn ship_loop(inner: &ShipperInner) {
    loop {
        let from = {
            let mut state = inner.state.lock();
            while !state.requested && !inner.shutdown.load(Ordering::Acquire) {
                inner.work_ready.wait(&mut state);
            }
            state.requested = false;
            state.position
        };

        let upto = inner.log.flushed_lsn();
        let reached = ship_range(inner, from, upto);

        let mut state = inner.state.lock();
        if reached > state.position {
            state.position = reached;
            inner.dispatcher.note_shipped(reached);
        }
        if inner.shutdown.load(Ordering::Acquire) {
            state.stopped = true;
            inner.progress.notify_all();
            return;
        }
        inner.progress.notify_all();
    }
}

/// Ship every committed transaction whose COMMIT lies in `[from, upto)`.
/// Returns how far the log was read.
fn ship_range(inner: &ShipperInner, from: Lsn, upto: Lsn) -> Lsn {
    if from >= upto {
        return from;
    }
    let mut cursor = inner.log.cursor();
    let mut next = cursor.get(CursorOp::SetRange(from));
    let mut resume = from;
    loop {
        let record = match next {
            Ok(record) if record.lsn < upto => record,
            Ok(_) => return upto,
            Err(e) if e.is_not_found() => return upto,
            Err(e) => {
                inner.read_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: "stratalog::repl",
                    lsn = %resume,
                    error = %e,
                    "Log read failed while shipping; retrying on the next commit"
                );
                return resume;
            }
        };
        if record.record_type == RecordType::Commit {
            ship_transaction(inner, &record);
        }
        resume = Lsn::new(record.lsn.file, record.lsn.offset + record.frame_len() as u32);
        next = cursor.get(CursorOp::Next);
    }
}

fn ship_transaction(inner: &ShipperInner, commit: &LogRecord) {
    if !inner.dispatcher.is_shipping() {
        return;
    }
    let mut batch = Vec::new();
    for record in inner.log.txn_chain(commit.lsn) {
        match record {
            Ok(record) => batch.push(record),
            Err(e) => {
                error!(
                    target: "stratalog::repl",
                    txn_id = ?commit.txn_id,
                    commit_lsn = %commit.lsn,
                    error = %e,
                    "Committed transaction could not be collected for shipping"
                );
                return;
            }
        }
    }
    batch.reverse();

    inner.shipped.fetch_add(1, Ordering::Relaxed);
    let shipped = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        inner.dispatcher.ship(&batch)
    }));
    match shipped {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(
            target: "stratalog::repl",
            error = %e,
            records = batch.len(),
            "Batch could not be encoded for shipping"
        ),
        Err(_) => error!(target: "stratalog::repl", "Replication transport panicked"),
    }
}
