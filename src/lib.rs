//! # Pakstore - Packed Single-File Storage
//!
//! `pakstore-rs` stores many independently sized blobs inside one file.
//!
//! - **Slotted container**: a region allocator over a single file with
//!   best-fit reuse, guard words around every region, and recovery by rescan
//! - **Content archive**: blobs keyed by a 20-byte content hash, with optional
//!   transparent LZ4 compression
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pakstore_rs::{ContentArchive, ContentHash, Result};
//!
//! # fn main() -> Result<()> {
//! let mut archive = ContentArchive::open("assets.pak")?;
//!
//! // Store under an explicit key
//! let key = ContentHash::digest(b"abc");
//! archive.write_data(key, b"abc", false)?;
//!
//! // Or let the archive hash the content
//! let logo = archive.put(b"<svg/>")?;
//!
//! assert_eq!(archive.get_data(&key)?, b"abc");
//! assert!(archive.has_data(&logo));
//!
//! archive.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Raw Slots
//!
//! ```rust,no_run
//! use pakstore_rs::{Result, SlottedContainer};
//! use std::io::Write;
//!
//! # fn main() -> Result<()> {
//! let mut container = SlottedContainer::open("raw.pak")?;
//! let slot = container.new_entry(64)?;
//!
//! let mut writer = container.write_entry(slot)?;
//! writer.write_all(b"hello")?;
//! writer.finish()?;
//!
//! assert_eq!(container.read_entry_bytes(slot)?, b"hello");
//! container.close()?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod compression;
pub mod config;
pub mod core;
pub mod error;

pub use crate::archive::{ArchiveEntry, ArchiveStats, ContentArchive, ContentHash, ParseHashError};
pub use crate::compression::CompressionConfig;
pub use crate::config::{ArchiveConfig, Config, ContainerConfig};
pub use crate::core::{
    ContainerStats, SlotIndex, SlotReader, SlotWriter, SlottedContainer, ValidationReport,
};
pub use crate::error::{ErrorKind, PakError, Result};

use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Builder for opening a [`ContentArchive`] with custom settings
///
/// # Examples
///
/// ```rust,no_run
/// use pakstore_rs::ArchiveBuilder;
///
/// # fn main() -> pakstore_rs::Result<()> {
/// let archive = ArchiveBuilder::new()
///     .path("/data/assets.pak")
///     .with_compression()
///     .validate_on_open(true)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ArchiveBuilder {
    path: Option<PathBuf>,
    config: Config,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        ArchiveBuilder {
            path: None,
            config: Config::default(),
        }
    }

    /// Start from a loaded settings file
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Enable LZ4 compression for blobs that shrink enough
    pub fn with_compression(mut self) -> Self {
        self.config.archive.compression = CompressionConfig::lz4();
        self
    }

    /// Idle time after which the OS handle is closed; `None` keeps it open
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.container = self.config.container.with_idle_timeout(timeout);
        self
    }

    /// Rescan the file's guards on open
    pub fn validate_on_open(mut self, validate: bool) -> Self {
        self.config.container.validate_on_open = validate;
        self
    }

    /// Smallest header table the archive allocates, in records
    pub fn header_table_min_records(mut self, records: u32) -> Self {
        self.config.archive.header_table_min_records = records;
        self
    }

    pub fn build(self) -> Result<ContentArchive> {
        let path = self
            .path
            .ok_or_else(|| PakError::Config("archive path must be set".to_string()))?;

        info!("Building archive at {:?}", path);
        debug!("Archive settings: {:?}", self.config);
        ContentArchive::open_with(&path, &self.config)
    }
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}
