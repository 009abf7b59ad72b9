//! Segmented write-ahead log: store, cursor, configuration and open-time scan.

pub mod config;
pub mod cursor;
pub mod scan;
pub mod store;

pub use config::{LogConfig, LogConfigError};
pub use cursor::{CursorOp, LogCursor};
pub use scan::{ScanReport, ScanStop};
pub use store::{LogStats, LogStore, TxnChain};
