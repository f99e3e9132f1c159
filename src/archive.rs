//! Content-addressed archive
//!
//! Blobs are keyed by a 20-byte content hash. The archive only uses the
//! container's public slot API: its root slot holds a [`RootRecord`], and the
//! root record points at a header-table slot listing
//! `(slot index, hash, uncompressed size)` for every blob.
//!
//! ```text
//! root slot ──► RootRecord { "AARC", v1, entry_count, header_table_idx }
//!                                                        │
//! header table ◄─────────────────────────────────────────┘
//!   [HashRecord; entry_count] ──► blob slots
//! ```

use crate::compression::{self, CompressionMethod};
use crate::config::{ArchiveConfig, Config};
use crate::core::container::{ContainerStats, SlottedContainer};
use crate::core::records::{HashRecord, RootRecord, ARCHIVE_SIGNATURE, ARCHIVE_VERSION};
use crate::core::slot::SlotIndex;
use crate::error::{PakError, Result};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, error, info};
use validator::Validate;

/// 20-byte content key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 20]);

impl ContentHash {
    pub const LEN: usize = 20;

    pub const fn new(bytes: [u8; 20]) -> Self {
        ContentHash(bytes)
    }

    /// Default digest: SHA-256 truncated to 20 bytes
    pub fn digest(data: &[u8]) -> Self {
        let full = Sha256::digest(data);
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&full[..Self::LEN]);
        ContentHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseHashError {
    #[error("content hash must be 40 hex digits, got {0} characters")]
    Length(usize),

    #[error("invalid hex digit {0:?} in content hash")]
    Digit(char),
}

impl FromStr for ContentHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != Self::LEN * 2 || !s.is_ascii() {
            return Err(ParseHashError::Length(s.chars().count()));
        }

        let mut bytes = [0u8; Self::LEN];
        let digits = s.as_bytes();
        for (i, byte) in bytes.iter_mut().enumerate() {
            let hi = hex_value(digits[2 * i])?;
            let lo = hex_value(digits[2 * i + 1])?;
            *byte = (hi << 4) | lo;
        }
        Ok(ContentHash(bytes))
    }
}

fn hex_value(digit: u8) -> std::result::Result<u8, ParseHashError> {
    (digit as char)
        .to_digit(16)
        .map(|v| v as u8)
        .ok_or(ParseHashError::Digit(digit as char))
}

/// One stored blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    pub hash: ContentHash,
    pub slot_index: SlotIndex,
    pub uncompressed_size: u64,
}

impl ArchiveEntry {
    fn to_record(self) -> HashRecord {
        HashRecord {
            slot_index: self.slot_index,
            hash: self.hash.0,
            uncompressed_size: self.uncompressed_size,
        }
    }
}

/// Archive-level bookkeeping
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveStats {
    pub entries: usize,
    pub compressed_entries: usize,
    pub stored_bytes: u64,
    pub uncompressed_bytes: u64,
    pub root_slot: SlotIndex,
    pub header_table_slot: Option<SlotIndex>,
    pub container: ContainerStats,
}

/// Hash-keyed blob store on top of a [`SlottedContainer`]
pub struct ContentArchive {
    container: SlottedContainer,
    root_index: SlotIndex,
    root: RootRecord,
    entries: HashMap<ContentHash, ArchiveEntry>,
    dirty: bool,
    config: ArchiveConfig,
}

impl ContentArchive {
    /// Open or create an archive with default settings
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &Config::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self> {
        let container = SlottedContainer::open_with(path, config.container.clone())?;
        Self::from_container(container, config.archive.clone())
    }

    /// Layer an archive over an open container
    ///
    /// A container without a root gets a fresh, empty archive root. Otherwise
    /// the root record must carry the archive signature and version, and the
    /// header table must not list any hash twice.
    pub fn from_container(mut container: SlottedContainer, config: ArchiveConfig) -> Result<Self> {
        config.validate()?;

        let Some(root_index) = container.root_index() else {
            let root = RootRecord::archive();
            let root_index = container.new_entry(RootRecord::SIZE as u64)?;
            container.write_entry_bytes(root_index, &root.to_bytes(), 0)?;
            container.set_root_index(root_index)?;
            info!("Initialized archive root in slot {}", root_index);

            return Ok(ContentArchive {
                container,
                root_index,
                root,
                entries: HashMap::new(),
                dirty: true,
                config,
            });
        };

        let root = RootRecord::from_bytes(&container.read_entry_bytes(root_index)?)?;
        root.expect(ARCHIVE_SIGNATURE, ARCHIVE_VERSION)?;
        let entries = Self::load_entries(&container, &root)?;
        info!(
            "Opened archive {:?}: {} entries",
            container.path(),
            entries.len()
        );

        Ok(ContentArchive {
            container,
            root_index,
            root,
            entries,
            dirty: false,
            config,
        })
    }

    fn load_entries(
        container: &SlottedContainer,
        root: &RootRecord,
    ) -> Result<HashMap<ContentHash, ArchiveEntry>> {
        let count = root.entry_count as usize;
        let mut entries = HashMap::with_capacity(count);
        if count == 0 {
            return Ok(entries);
        }

        let table = container.read_entry_bytes(root.header_table_idx)?;
        if table.len() < count * HashRecord::SIZE {
            return Err(PakError::malformed(format!(
                "header table holds {} bytes, {} entries need {}",
                table.len(),
                count,
                count * HashRecord::SIZE
            )));
        }

        for chunk in table.chunks_exact(HashRecord::SIZE).take(count) {
            let record = HashRecord::decode(chunk)?;
            let hash = ContentHash(record.hash);
            let entry = ArchiveEntry {
                hash,
                slot_index: record.slot_index,
                uncompressed_size: record.uncompressed_size,
            };
            if entries.insert(hash, entry).is_some() {
                return Err(PakError::HashCollision(hash));
            }
        }
        Ok(entries)
    }

    pub fn container(&self) -> &SlottedContainer {
        &self.container
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn root_slot(&self) -> SlotIndex {
        self.root_index
    }

    pub fn header_table_slot(&self) -> Option<SlotIndex> {
        (self.root.header_table_idx != 0).then_some(self.root.header_table_idx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty || self.container.is_dirty()
    }

    pub fn has_data(&self, hash: &ContentHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn entry(&self, hash: &ContentHash) -> Option<&ArchiveEntry> {
        self.entries.get(hash)
    }

    /// All stored hashes, sorted
    pub fn hashes(&self) -> Vec<ContentHash> {
        let mut hashes: Vec<ContentHash> = self.entries.keys().copied().collect();
        hashes.sort();
        hashes
    }

    /// Store `data` under `hash`
    ///
    /// An existing hash is a collision unless `allow_overwrite` is set; then
    /// its slot is reused when big enough and replaced otherwise. On error the
    /// hash map is left as it was.
    pub fn write_data(&mut self, hash: ContentHash, data: &[u8], allow_overwrite: bool) -> Result<()> {
        let existing = self.entries.get(&hash).copied();
        if existing.is_some() && !allow_overwrite {
            return Err(PakError::HashCollision(hash));
        }

        let (stored, method) = compression::compress_if_beneficial(data, &self.config.compression);
        let needed = stored.len() as u64;

        let slot = match existing {
            Some(entry) if self.container.entry_capacity(entry.slot_index)? >= needed => {
                entry.slot_index
            }
            _ => self.container.new_entry(needed)?,
        };

        if let Err(e) = self.fill_slot(slot, &stored) {
            if existing.map(|entry| entry.slot_index) != Some(slot) {
                if let Err(cleanup) = self.container.release_entry(slot) {
                    error!("Could not release slot {} after failed write: {}", slot, cleanup);
                }
            }
            return Err(e);
        }

        if let Some(old) = existing.filter(|entry| entry.slot_index != slot) {
            self.container.release_entry(old.slot_index)?;
        }

        self.entries.insert(
            hash,
            ArchiveEntry {
                hash,
                slot_index: slot,
                uncompressed_size: data.len() as u64,
            },
        );
        self.dirty = true;
        debug!(
            "Stored {} ({} bytes, {} on disk{}) in slot {}",
            hash,
            data.len(),
            stored.len(),
            if method == CompressionMethod::Lz4 { ", lz4" } else { "" },
            slot
        );
        Ok(())
    }

    fn fill_slot(&mut self, slot: SlotIndex, bytes: &[u8]) -> Result<()> {
        let mut writer = self.container.write_entry(slot)?;
        writer.write_all(bytes)?;
        writer.finish()?;
        Ok(())
    }

    /// Store `data` under its own digest; already-present content is not rewritten
    pub fn put(&mut self, data: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::digest(data);
        if !self.has_data(&hash) {
            self.write_data(hash, data, false)?;
        }
        Ok(hash)
    }

    pub fn get_data(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let entry = self
            .entries
            .get(hash)
            .ok_or(PakError::HashNotFound(*hash))?;
        let stored = self.container.read_entry_bytes(entry.slot_index)?;

        if stored.len() as u64 == entry.uncompressed_size {
            return Ok(stored);
        }
        let size = usize::try_from(entry.uncompressed_size)
            .map_err(|_| PakError::Overflow(format!("blob of {} bytes", entry.uncompressed_size)))?;
        compression::decompress(&stored, CompressionMethod::Lz4, size)
    }

    /// Move a blob to a new key without touching its slot
    pub fn replace_hash(&mut self, old: &ContentHash, new: ContentHash) -> Result<()> {
        if !self.entries.contains_key(old) {
            return Err(PakError::HashNotFound(*old));
        }
        if self.entries.contains_key(&new) {
            return Err(PakError::HashCollision(new));
        }

        if let Some(mut entry) = self.entries.remove(old) {
            entry.hash = new;
            self.entries.insert(new, entry);
            self.dirty = true;
            debug!("Rekeyed {} to {}", old, new);
        }
        Ok(())
    }

    /// Release a blob's slot and forget its hash
    pub fn delete_data(&mut self, hash: &ContentHash) -> Result<()> {
        let entry = *self
            .entries
            .get(hash)
            .ok_or(PakError::HashNotFound(*hash))?;
        self.container.release_entry(entry.slot_index)?;
        self.entries.remove(hash);
        self.dirty = true;
        debug!("Deleted {} from slot {}", hash, entry.slot_index);
        Ok(())
    }

    pub fn stats(&self) -> Result<ArchiveStats> {
        let mut stats = ArchiveStats {
            entries: self.entries.len(),
            compressed_entries: 0,
            stored_bytes: 0,
            uncompressed_bytes: 0,
            root_slot: self.root_index,
            header_table_slot: self.header_table_slot(),
            container: self.container.stats(),
        };
        for entry in self.entries.values() {
            let stored = self.container.entry_size(entry.slot_index)?;
            stats.stored_bytes += stored;
            stats.uncompressed_bytes += entry.uncompressed_size;
            if stored != entry.uncompressed_size {
                stats.compressed_entries += 1;
            }
        }
        Ok(stats)
    }

    /// Persist the header table and root record, then flush the container
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.write_header_table()?;
            self.dirty = false;
        }
        self.container.flush()
    }

    fn write_header_table(&mut self) -> Result<()> {
        let count = self.entries.len();
        let entry_count = u32::try_from(count)
            .map_err(|_| PakError::Overflow(format!("{} archive entries", count)))?;
        let needed = (count * HashRecord::SIZE) as u64;

        let current = self.header_table_slot();
        let fits = match current {
            Some(slot) => self.container.entry_capacity(slot)? >= needed,
            None => count == 0,
        };
        if !fits {
            let records = self.config.header_table_records(count);
            let slot = self.container.new_entry(records * HashRecord::SIZE as u64)?;
            if let Some(old) = current {
                self.container.release_entry(old)?;
            }
            self.root.header_table_idx = slot;
            debug!(
                "Header table moved to slot {} ({} records for {} entries)",
                slot, records, count
            );
        }

        if let Some(slot) = self.header_table_slot() {
            let mut entries: Vec<&ArchiveEntry> = self.entries.values().collect();
            entries.sort_by_key(|entry| entry.hash);

            let mut bytes = Vec::with_capacity(count * HashRecord::SIZE);
            for entry in entries {
                entry.to_record().encode_into(&mut bytes);
            }
            self.fill_slot(slot, &bytes)?;
        }

        self.root.entry_count = entry_count;
        let root = self.root.to_bytes();
        self.fill_slot(self.root_index, &root)
    }

    /// Flush everything and close the file
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.container.file_handle().release()?;
        info!("Closed archive {:?}", self.container.path());
        Ok(())
    }
}

impl Drop for ContentArchive {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                error!("Archive flush on drop failed: {}", e);
            }
        }
    }
}
