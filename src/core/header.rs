//! Container header codec
//!
//! The header sits at offset 0 and is rewritten only by a flush. It records
//! where the slot table lives, how many records it holds, the root slot and
//! the data offset the next appended region gets.

use crate::core::records::{get_u32, get_u64};
use crate::error::{PakError, Result};

/// Container signature ("PAKS", little-endian)
pub const SIGNATURE: u32 = u32::from_le_bytes(*b"PAKS");
pub const VERSION: u32 = 1;

const RESERVED_LEN: usize = 512;

/// Encoded header width: signature, version, reserved block, end-of-file,
/// reserved, index offset, index count, reserved, root index
pub const HEADER_SIZE: usize = 4 + 4 + RESERVED_LEN + 8 + 8 + 8 + 4 + 4 + 8;

const _: () = assert!(HEADER_SIZE == 0x230);

/// Position of the first guard word; the scan of the physical file starts here
pub const FIRST_GUARD_OFFSET: u64 = HEADER_SIZE as u64;

/// Lowest data offset a slot may legally point at
pub const MIN_DATA_OFFSET: u64 = FIRST_GUARD_OFFSET + 8;

/// Container header at offset 0
///
/// Only written by `flush`; between flushes the in-memory copy is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub signature: u32,
    pub version: u32,
    /// Data offset of the next region appended at the end of the file
    pub end_of_file: u64,
    /// Data offset of the slot table region (0 if never flushed)
    pub index_offset: u64,
    /// Number of slot records stored at `index_offset`
    pub index_count: u32,
    /// Root slot index, 0 when no root has been set
    pub root_entry_idx: u64,
}

impl ContainerHeader {
    /// Header for a freshly created container
    pub fn new() -> Self {
        ContainerHeader {
            signature: SIGNATURE,
            version: VERSION,
            end_of_file: MIN_DATA_OFFSET,
            index_offset: 0,
            index_count: 0,
            root_entry_idx: 0,
        }
    }

    /// Check signature and version against what this build understands
    pub fn validate(&self) -> Result<()> {
        if self.signature != SIGNATURE {
            return Err(PakError::HeaderMismatch {
                field: "signature",
                expected: SIGNATURE,
                found: self.signature,
            });
        }

        if self.version != VERSION {
            return Err(PakError::HeaderMismatch {
                field: "version",
                expected: VERSION,
                found: self.version,
            });
        }

        if self.end_of_file < MIN_DATA_OFFSET {
            return Err(PakError::malformed(format!(
                "end-of-file {:#x} lies inside the header",
                self.end_of_file
            )));
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);

        bytes.extend_from_slice(&self.signature.to_le_bytes());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&[0u8; RESERVED_LEN]);
        bytes.extend_from_slice(&self.end_of_file.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&self.index_offset.to_le_bytes());
        bytes.extend_from_slice(&self.index_count.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&self.root_entry_idx.to_le_bytes());

        debug_assert_eq!(bytes.len(), HEADER_SIZE);
        bytes
    }

    /// Decode and validate a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(PakError::malformed(format!(
                "header needs {} bytes, file has {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let mut offset = 0;

        let signature = get_u32(bytes, offset);
        offset += 4;
        let version = get_u32(bytes, offset);
        offset += 4 + RESERVED_LEN;
        let end_of_file = get_u64(bytes, offset);
        offset += 8 + 8;
        let index_offset = get_u64(bytes, offset);
        offset += 8;
        let index_count = get_u32(bytes, offset);
        offset += 4 + 4;
        let root_entry_idx = get_u64(bytes, offset);

        let header = ContainerHeader {
            signature,
            version,
            end_of_file,
            index_offset,
            index_count,
            root_entry_idx,
        };
        header.validate()?;

        Ok(header)
    }
}

impl Default for ContainerHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_creation() {
        let header = ContainerHeader::new();
        assert_eq!(header.signature, SIGNATURE);
        assert_eq!(header.version, VERSION);
        assert_eq!(header.end_of_file, 0x238);
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_field_positions() {
        let header = ContainerHeader {
            end_of_file: 0x1111,
            index_offset: 0x2222,
            index_count: 0x33,
            root_entry_idx: 0x44,
            ..ContainerHeader::new()
        };
        let bytes = header.to_bytes();

        assert_eq!(bytes.len(), 0x230);
        assert_eq!(&bytes[0..4], b"PAKS");
        assert_eq!(get_u64(&bytes, 0x208), 0x1111);
        assert_eq!(get_u64(&bytes, 0x218), 0x2222);
        assert_eq!(get_u32(&bytes, 0x220), 0x33);
        assert_eq!(get_u64(&bytes, 0x228), 0x44);
    }

    #[test]
    fn test_header_serialization() {
        let mut header = ContainerHeader::new();
        header.end_of_file = 0x1000;
        header.index_offset = 0x800;
        header.index_count = 12;
        header.root_entry_idx = 3;

        let decoded = ContainerHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_invalid_signature() {
        let mut bytes = ContainerHeader::new().to_bytes();
        bytes[0..4].copy_from_slice(b"NOPE");
        assert!(matches!(
            ContainerHeader::from_bytes(&bytes),
            Err(PakError::HeaderMismatch {
                field: "signature",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_version() {
        let mut header = ContainerHeader::new();
        header.version = 99;
        assert!(matches!(
            ContainerHeader::from_bytes(&header.to_bytes()),
            Err(PakError::HeaderMismatch {
                field: "version",
                ..
            })
        ));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = ContainerHeader::new().to_bytes();
        assert!(matches!(
            ContainerHeader::from_bytes(&bytes[..100]),
            Err(PakError::Malformed(_))
        ));
    }
}
