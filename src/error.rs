//! Error types for container and archive operations

use crate::archive::ContentHash;
use crate::core::slot::SlotIndex;
use thiserror::Error;

/// Unified error type for pakstore operations
#[derive(Error, Debug)]
pub enum PakError {
    /// The physical layout disagrees with itself (guard mismatch, misalignment,
    /// missing sentinel, two slots claiming one offset). Only a rescan can recover.
    #[error("Malformed container: {0}")]
    Malformed(String),

    #[error("Invalid slot {index}: {reason}")]
    InvalidSlot { index: SlotIndex, reason: &'static str },

    #[error("Hash collision: {0} is already stored")]
    HashCollision(ContentHash),

    #[error("Hash not found: {0}")]
    HashNotFound(ContentHash),

    #[error("Header mismatch in {field}: expected {expected:#x}, found {found:#x}")]
    HeaderMismatch {
        field: &'static str,
        expected: u32,
        found: u32,
    },

    #[error("Overflow: {0}")]
    Overflow(String),

    #[error("An append write is already in flight")]
    AppendInFlight,

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Closed classification of [`PakError`] variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedLayout,
    InvalidSlot,
    ArchiveCollision,
    ArchiveNotFound,
    HeaderMismatch,
    Overflow,
    /// API misuse such as overlapping append writes
    Usage,
    Config,
    Io,
}

impl PakError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PakError::Malformed(_) => ErrorKind::MalformedLayout,
            PakError::InvalidSlot { .. } => ErrorKind::InvalidSlot,
            PakError::HashCollision(_) => ErrorKind::ArchiveCollision,
            PakError::HashNotFound(_) => ErrorKind::ArchiveNotFound,
            PakError::HeaderMismatch { .. } => ErrorKind::HeaderMismatch,
            PakError::Overflow(_) => ErrorKind::Overflow,
            PakError::AppendInFlight => ErrorKind::Usage,
            // Blob could not be decoded: stored bytes disagree with the recorded layout
            PakError::Compression(_) => ErrorKind::MalformedLayout,
            PakError::Config(_) => ErrorKind::Config,
            PakError::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        PakError::Malformed(msg.into())
    }
}

impl From<toml::de::Error> for PakError {
    fn from(err: toml::de::Error) -> Self {
        PakError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for PakError {
    fn from(err: validator::ValidationErrors) -> Self {
        PakError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PakError>;
