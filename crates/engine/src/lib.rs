//! Environment layer for stratalog
//!
//! This crate wires the lower layers together:
//! - Environment: open/close, directory lock, configuration
//! - Recovery: two-pass replay from the last checkpoint
//! - Prepared-transaction resolution for an external coordinator
//! - Dispatch: per-record-type handlers and the application hook
//! - Replication: shipping committed transactions and applying received ones
//!
//! Nothing is usable until recovery has completed inside
//! [`EnvironmentBuilder::open`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dispatch;
pub mod environment;
pub mod recovery;
pub mod replication;

pub use config::{CheckpointConfig, EnvConfig, ReplicationConfig, CONFIG_FILE_NAME};
pub use dispatch::{
    AppDispatch, DispatchOutcome, DispatchTable, EnvInfo, RecordHandler, RecoveryOp, SiteId,
};
pub use environment::{EnvStats, Environment, EnvironmentBuilder, LOCK_FILE_NAME, LOG_DIR_NAME};
pub use recovery::{
    RecoverPosition, RecoveryEngine, RecoveryReport, RecoveryState, Resolution,
};
pub use replication::{
    ApplyPosition, LogShipper, ReceiveOutcome, ReplicationControl, ReplicationDispatcher,
    ReplicationTransport, SendFlags, ShipperStats, SiteShipResult, SiteStats, PROGRESS_FILE_NAME,
};
