//! Environment configuration via `stratalog.toml`
//!
//! On first open a commented default `stratalog.toml` is written into the
//! environment directory. To change settings, edit the file and reopen.
//! A configuration passed to the builder takes precedence over the file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use stratalog_core::{Error, Result};
use stratalog_durability::LogConfig;

use crate::dispatch::SiteId;

/// Config file name placed in the environment directory.
pub const CONFIG_FILE_NAME: &str = "stratalog.toml";

/// Thresholds for `checkpoint_if_needed`.
///
/// With both thresholds at zero every call takes a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Checkpoint once this many KiB have been logged since the last one
    pub kbytes: u64,
    /// Checkpoint once this many minutes have passed since the last one
    pub minutes: u64,
}

/// Replication settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// This site's id
    pub site_id: SiteId,
    /// Remote sites committed transactions are shipped to
    pub sites: Vec<SiteId>,
}

/// Environment configuration loaded from `stratalog.toml`.
///
/// # Example
///
/// ```toml
/// [log]
/// segment_size = 10485760
/// max_record_size = 1048576
///
/// [checkpoint]
/// kbytes = 1024
/// minutes = 5
///
/// [replication]
/// site_id = 1
/// sites = [2, 3]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Log segment settings
    pub log: LogConfig,
    /// Checkpoint thresholds
    pub checkpoint: CheckpointConfig,
    /// Replication settings
    pub replication: ReplicationConfig,
}

impl EnvConfig {
    /// Small segments and records, for tests.
    pub fn for_testing() -> Self {
        EnvConfig {
            log: LogConfig::for_testing(),
            ..EnvConfig::default()
        }
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        self.log.validate()?;
        if self.replication.sites.contains(&self.replication.site_id) {
            return Err(Error::Config(format!(
                "replication.sites lists the local site {}",
                self.replication.site_id
            )));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# stratalog environment configuration

[log]
# Segment files are rotated once they would grow past this size (bytes)
segment_size = 10485760
# Largest payload a single record may carry (bytes)
max_record_size = 1048576

[checkpoint]
# checkpoint_if_needed() takes a checkpoint once either threshold is reached.
# With both at 0 every call checkpoints.
kbytes = 0
minutes = 0

[replication]
# This site's id
site_id = 0
# Remote sites committed transactions are shipped to (requires a transport)
sites = []
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: EnvConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
