//! stratalog - write-ahead log with cursor replay, two-phase-commit
//! recovery and log shipping
//!
//! # Quick Start
//!
//! ```ignore
//! use stratalog::{Environment, RecordType};
//!
//! let env = Environment::open("/data/env")?;
//!
//! let tx = env.begin()?;
//! env.write(tx, RecordType::Update, b"change")?;
//! env.commit(tx)?;
//!
//! // A prepared transaction survives a crash and is handed back to the
//! // coordinator after the next open.
//! for prepared in env.prepared()? {
//!     env.resolve(prepared.txn_id, Resolution::Commit)?;
//! }
//! ```
//!
//! # Architecture
//!
//! - `stratalog-core`: LSNs, record types, global transaction ids, errors
//! - `stratalog-durability`: segmented log, group commit, cursors, checkpoint file
//! - `stratalog-concurrency`: transaction table
//! - `stratalog-engine`: environment, recovery, dispatch, replication

use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use stratalog_concurrency::{
    PreparedTransaction, Transaction, TransactionTable, TxnOutcome, TxnStats,
};
pub use stratalog_core::{
    EnvId, Error, GlobalTxnId, Lsn, RecordType, Result, TxnId, TxnState,
};
pub use stratalog_durability::{
    Checkpoint, CheckpointFile, CursorOp, LogConfig, LogCursor, LogRecord, LogStats, LogStore,
};
pub use stratalog_engine::{
    AppDispatch, ApplyPosition, CheckpointConfig, DispatchOutcome, DispatchTable, EnvConfig,
    EnvInfo, EnvStats, Environment, EnvironmentBuilder, ReceiveOutcome, RecordHandler,
    RecoverPosition, RecoveryOp, RecoveryReport, RecoveryState, ReplicationConfig,
    ReplicationControl, ReplicationDispatcher, ReplicationTransport, Resolution, SendFlags,
    ShipperStats, SiteId, SiteShipResult, SiteStats,
};

static LOGGING: OnceCell<()> = OnceCell::new();

/// Install a stderr `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Only the first call has an
/// effect, and it does nothing if the process already installed a
/// subscriber of its own.
pub fn init_logging(level: Level) {
    LOGGING.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("stratalog={},warn", level)));
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_writer(std::io::stderr);
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();
    });
}
