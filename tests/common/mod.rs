//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
pub use stratalog::{
    CursorOp, DispatchOutcome, EnvConfig, Environment, Error, GlobalTxnId, LogRecord, Lsn,
    PreparedTransaction, RecordType, RecoverPosition, RecoveryOp, RecoveryState, Resolution,
    Result, TxnId, TxnState,
};
use stratalog_durability::SEGMENT_HEADER_SIZE;
use tempfile::TempDir;

// ============================================================================
// TestEnv - environment in a temp directory that can be reopened
// ============================================================================

/// Every data record a handler saw, with the operation it was dispatched for.
pub type Seen = Arc<Mutex<Vec<(RecoveryOp, Vec<u8>)>>>;

/// Environment wrapper that owns its directory and can "crash" and reopen.
pub struct TestEnv {
    pub env: Option<Environment>,
    pub dir: TempDir,
    pub config: EnvConfig,
    pub seen: Seen,
}

impl TestEnv {
    /// Fresh environment with test-sized segments.
    pub fn new() -> Self {
        Self::with_config(EnvConfig::for_testing())
    }

    pub fn with_config(config: EnvConfig) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let env = open_recording(dir.path(), config.clone(), &seen).expect("open");
        TestEnv {
            env: Some(env),
            dir,
            config,
            seen,
        }
    }

    pub fn env(&self) -> &Environment {
        self.env.as_ref().expect("environment is open")
    }

    /// Close and open again, running recovery.
    pub fn reopen(&mut self) {
        self.try_reopen().expect("reopen");
    }

    pub fn try_reopen(&mut self) -> Result<()> {
        self.shutdown();
        self.seen.lock().clear();
        self.env = Some(open_recording(self.dir.path(), self.config.clone(), &self.seen)?);
        Ok(())
    }

    /// Drop the environment without reopening.
    pub fn shutdown(&mut self) {
        if let Some(env) = self.env.take() {
            drop(env);
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dir.path().join(stratalog_engine::LOG_DIR_NAME)
    }

    /// Payloads the handler saw for `op`, in dispatch order.
    pub fn seen(&self, op: RecoveryOp) -> Vec<Vec<u8>> {
        self.seen
            .lock()
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

/// Open `dir` with an `Update` handler that records every dispatch into `seen`.
pub fn open_recording(dir: &Path, config: EnvConfig, seen: &Seen) -> Result<Environment> {
    let seen = Arc::clone(seen);
    Environment::builder()
        .dir(dir)
        .config(config)
        .handler(
            RecordType::Update,
            Arc::new(move |record: &LogRecord, op: RecoveryOp| -> Result<DispatchOutcome> {
                seen.lock().push((op, record.payload.clone()));
                Ok(DispatchOutcome::Applied)
            }),
        )
        .open()
}

// ============================================================================
// Workload helpers
// ============================================================================

/// Begin, write each payload as an `Update`, commit.
pub fn committed_txn(env: &Environment, payloads: &[&[u8]]) -> TxnId {
    let tx = env.begin().unwrap();
    for payload in payloads {
        env.write(tx, RecordType::Update, payload).unwrap();
    }
    env.commit(tx).unwrap();
    tx
}

pub fn gid(n: u8) -> GlobalTxnId {
    GlobalTxnId::new(0x1234, vec![b'g', n], vec![b'b', n]).unwrap()
}

/// Every record in the log, oldest first.
pub fn all_records(env: &Environment) -> Vec<LogRecord> {
    let mut cursor = env.log_cursor().unwrap();
    let mut records = Vec::new();
    while let Ok(record) = cursor.get(CursorOp::Next) {
        records.push(record);
    }
    records
}

// ============================================================================
// On-disk damage
// ============================================================================

/// Path of segment `file` inside `log_dir`.
pub fn segment_file(log_dir: &Path, file: u32) -> PathBuf {
    stratalog_durability::format::segment_path(log_dir, file)
}

/// XOR one byte of the record area at `lsn.offset + delta`.
pub fn flip_byte(log_dir: &Path, lsn: Lsn, delta: u64) {
    let path = segment_file(log_dir, lsn.file);
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let pos = SEGMENT_HEADER_SIZE as u64 + lsn.offset as u64 + delta;
    file.seek(SeekFrom::Start(pos)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0xFF;
    file.seek(SeekFrom::Start(pos)).unwrap();
    file.write_all(&byte).unwrap();
    file.sync_all().unwrap();
}
