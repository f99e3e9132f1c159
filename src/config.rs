//! Container and archive settings
//!
//! Settings load from TOML; every field has a default, so a partial file (or
//! no file at all) is fine. Ranges are checked with `validator` on load and
//! again when a container or archive is opened.

use crate::compression::CompressionConfig;
use crate::error::{PakError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use validator::Validate;

/// Slotted container tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ContainerConfig {
    /// Close the OS file handle after this much inactivity; 0 keeps it open
    pub idle_timeout_ms: u64,

    /// Slot table growth multiplier applied to the current slot count
    #[validate(range(min = 1.0, max = 16.0))]
    pub table_growth_factor: f64,

    /// Smallest slot table, in records
    #[validate(range(min = 1))]
    pub table_min_growth: u32,

    /// Run a full guard rescan every time an existing file is opened
    pub validate_on_open: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            idle_timeout_ms: 5000,
            table_growth_factor: 1.25,
            table_min_growth: 50,
            validate_on_open: false,
        }
    }
}

impl ContainerConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout_ms = timeout.map_or(0, |t| t.as_millis().max(1) as u64);
        self
    }

    pub fn with_validate_on_open(mut self, validate: bool) -> Self {
        self.validate_on_open = validate;
        self
    }
}

/// Content archive tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Header table growth multiplier applied to the entry count
    #[validate(range(min = 1.0, max = 16.0))]
    pub header_table_growth_factor: f64,

    /// Smallest header table, in records
    #[validate(range(min = 1))]
    pub header_table_min_records: u32,

    #[validate(nested)]
    pub compression: CompressionConfig,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            header_table_growth_factor: 1.5,
            header_table_min_records: 1000,
            compression: CompressionConfig::default(),
        }
    }
}

impl ArchiveConfig {
    pub fn with_min_records(mut self, records: u32) -> Self {
        self.header_table_min_records = records;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    /// Header-table capacity in records for `entries` entries
    pub fn header_table_records(&self, entries: usize) -> u64 {
        let grown = (entries as f64 * self.header_table_growth_factor).ceil() as u64;
        grown.max(u64::from(self.header_table_min_records))
    }
}

/// Complete settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub container: ContainerConfig,

    #[validate(nested)]
    pub archive: ArchiveConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PakError::Config(e.to_string()))
    }
}
