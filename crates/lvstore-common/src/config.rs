//! Configuration types for lvstore
//!
//! `LvsOpts` is what the lvol layer forwards to the blob store when a store
//! is created. `Config` is the root document the CLI reads.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default cluster size: 4 MiB
pub const DEFAULT_CLUSTER_SIZE: u32 = 4 * 1024 * 1024;

/// Smallest cluster size accepted (one metadata page)
pub const MIN_CLUSTER_SIZE: u32 = 4096;

/// Root configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Options used when a new store is created
    pub lvs: LvsOpts,
    /// Geometry used when the CLI creates a new device file
    pub device: DeviceConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Parse configuration from JSON text; missing fields take defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the blob store would reject
    pub fn validate(&self) -> Result<()> {
        self.lvs.validate()?;
        self.device.validate()?;
        if self.lvs.cluster_size % self.device.block_len != 0 {
            return Err(Error::configuration(format!(
                "cluster_size {} is not a multiple of block_len {}",
                self.lvs.cluster_size, self.device.block_len
            )));
        }
        Ok(())
    }
}

/// Options for creating a logical volume store
///
/// All values are handed to the blob store unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LvsOpts {
    /// Cluster size in bytes (allocation unit)
    pub cluster_size: u32,
    /// Metadata page budget; 0 means one page per cluster
    pub num_md_pages: u32,
    /// Maximum concurrent metadata operations
    pub max_md_ops: u32,
    /// Maximum concurrent operations per I/O channel
    pub max_channel_ops: u32,
}

impl Default for LvsOpts {
    fn default() -> Self {
        Self {
            cluster_size: DEFAULT_CLUSTER_SIZE,
            num_md_pages: 0,
            max_md_ops: 32,
            max_channel_ops: 512,
        }
    }
}

impl LvsOpts {
    /// Options with a specific cluster size, everything else default
    #[must_use]
    pub fn with_cluster_size(cluster_size: u32) -> Self {
        Self {
            cluster_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_size < MIN_CLUSTER_SIZE || !self.cluster_size.is_power_of_two() {
            return Err(Error::configuration(format!(
                "cluster_size {} must be a power of two >= {MIN_CLUSTER_SIZE}",
                self.cluster_size
            )));
        }
        if self.max_md_ops == 0 || self.max_channel_ops == 0 {
            return Err(Error::configuration(
                "max_md_ops and max_channel_ops must be positive",
            ));
        }
        Ok(())
    }
}

/// Geometry of a device created by the CLI
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Logical block length in bytes
    pub block_len: u32,
    /// Device size in bytes
    pub size_bytes: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            block_len: 4096,
            size_bytes: 1024 * 1024 * 1024, // 1 GiB
        }
    }
}

impl DeviceConfig {
    /// Number of blocks on the device
    #[must_use]
    pub const fn block_count(&self) -> u64 {
        self.size_bytes / self.block_len as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_len == 0 || !self.block_len.is_power_of_two() {
            return Err(Error::configuration(format!(
                "block_len {} must be a non-zero power of two",
                self.block_len
            )));
        }
        if self.block_count() == 0 {
            return Err(Error::configuration("device holds no blocks"));
        }
        Ok(())
    }
}
