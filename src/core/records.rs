//! Fixed-width record codecs
//!
//! Every record type encodes its fields in a fixed order, little-endian, and
//! checks its encoded width at compile time.

use crate::error::{PakError, Result};

/// Root record signature for content archives ("AARC", little-endian)
pub const ARCHIVE_SIGNATURE: u32 = u32::from_le_bytes(*b"AARC");
pub const ARCHIVE_VERSION: u32 = 1;

pub(crate) fn get_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

pub(crate) fn get_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn check_len(bytes: &[u8], needed: usize, what: &str) -> Result<()> {
    if bytes.len() < needed {
        return Err(PakError::malformed(format!(
            "{} needs {} bytes, got {}",
            what,
            needed,
            bytes.len()
        )));
    }
    Ok(())
}

/// One slot-table entry: `offset:u64, size:u64`
///
/// Capacity is not stored here; it is recovered from the region's guard words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotRecord {
    pub offset: u64,
    pub size: u64,
}

impl SlotRecord {
    pub const SIZE: usize = 8 + 8;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, Self::SIZE, "slot record")?;
        Ok(SlotRecord {
            offset: get_u64(bytes, 0),
            size: get_u64(bytes, 8),
        })
    }

    /// Decode a packed table of `count` records
    pub fn decode_table(bytes: &[u8], count: usize) -> Result<Vec<Self>> {
        let needed = count
            .checked_mul(Self::SIZE)
            .ok_or_else(|| PakError::Overflow(format!("slot table of {} records", count)))?;
        check_len(bytes, needed, "slot table")?;

        bytes[..needed]
            .chunks_exact(Self::SIZE)
            .map(Self::decode)
            .collect()
    }
}

/// Anchor record stored in a container's root slot:
/// `signature:u32, version:u32, entryCount:u32, headerTableIdx:u32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootRecord {
    pub signature: u32,
    pub version: u32,
    pub entry_count: u32,
    pub header_table_idx: u32,
}

impl RootRecord {
    pub const SIZE: usize = 4 + 4 + 4 + 4;

    /// Empty archive root
    pub fn archive() -> Self {
        RootRecord {
            signature: ARCHIVE_SIGNATURE,
            version: ARCHIVE_VERSION,
            entry_count: 0,
            header_table_idx: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.signature.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.entry_count.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.header_table_idx.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, Self::SIZE, "root record")?;
        Ok(RootRecord {
            signature: get_u32(bytes, 0),
            version: get_u32(bytes, 4),
            entry_count: get_u32(bytes, 8),
            header_table_idx: get_u32(bytes, 12),
        })
    }

    /// Require the given signature and version
    pub fn expect(&self, signature: u32, version: u32) -> Result<()> {
        if self.signature != signature {
            return Err(PakError::HeaderMismatch {
                field: "root signature",
                expected: signature,
                found: self.signature,
            });
        }
        if self.version != version {
            return Err(PakError::HeaderMismatch {
                field: "root version",
                expected: version,
                found: self.version,
            });
        }
        Ok(())
    }
}

/// Archive header-table entry: `slotIndex:u32, hash:[u8;20], uncompressedSize:u64`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRecord {
    pub slot_index: u32,
    pub hash: [u8; 20],
    pub uncompressed_size: u64,
}

impl HashRecord {
    pub const SIZE: usize = 4 + 20 + 8;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.slot_index.to_le_bytes());
        out.extend_from_slice(&self.hash);
        out.extend_from_slice(&self.uncompressed_size.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, Self::SIZE, "hash record")?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[4..24]);
        Ok(HashRecord {
            slot_index: get_u32(bytes, 0),
            hash,
            uncompressed_size: get_u64(bytes, 24),
        })
    }
}

const _: () = assert!(SlotRecord::SIZE == 16);
const _: () = assert!(RootRecord::SIZE == 16);
const _: () = assert!(HashRecord::SIZE == 32);
