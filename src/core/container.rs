//! Slotted container: a generic region allocator over one physical file
//!
//! Layout:
//! ```text
//! 0x000  header (0x230 bytes)
//! 0x230  guard | region 1 | guard | guard | region 2 | guard | ... | 0
//! ```
//!
//! Each region is flanked by two identical guard words holding its capacity
//! (negated while the region is free). The slot table that maps stable slot
//! indices to regions is itself stored in one of the regions and rewritten by
//! [`SlottedContainer::flush`].

use crate::config::ContainerConfig;
use crate::core::header::{ContainerHeader, FIRST_GUARD_OFFSET, HEADER_SIZE, MIN_DATA_OFFSET};
use crate::core::io::{FileHandle, FileLease};
use crate::core::records::SlotRecord;
use crate::core::slot::{Region, SlotIndex, SlotState, SlotTable, SENTINEL};
use crate::core::validation::{self, ValidationReport};
use crate::core::view::{AppendWriter, SlotReader, SlotWriter};
use crate::error::{PakError, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::Path;
use tracing::{debug, error, info, warn};
use validator::Validate;

/// Allocation granule; every capacity is a multiple of this
pub const GRANULE: u64 = 16;

/// Round a requested size up to a legal region capacity
pub fn aligned_capacity(requested: u64) -> Result<u64> {
    let capacity = requested
        .max(1)
        .checked_add(GRANULE - 1)
        .map(|n| n & !(GRANULE - 1))
        .filter(|&n| n <= i64::MAX as u64)
        .ok_or_else(|| PakError::Overflow(format!("capacity for {} bytes", requested)))?;
    Ok(capacity)
}

/// Snapshot of container bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    pub slot_count: usize,
    pub live_slots: usize,
    pub free_slots: usize,
    pub deletable_slots: usize,
    pub unused_slots: usize,
    pub live_bytes: u64,
    pub free_bytes: u64,
    pub end_of_file: u64,
    pub table_slot: Option<SlotIndex>,
    pub root_slot: Option<SlotIndex>,
}

/// Single-file slotted storage engine
pub struct SlottedContainer {
    file: FileHandle,
    header: ContainerHeader,
    slots: SlotTable,
    /// Slot holding the persisted slot table, `SENTINEL` until first flush
    table_index: SlotIndex,
    dirty: bool,
    append_in_flight: bool,
    config: ContainerConfig,
}

impl SlottedContainer {
    /// Open or create a container with default settings
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, ContainerConfig::default())
    }

    /// Open or create a container
    ///
    /// An empty or missing file is initialized with a fresh header and the
    /// sentinel guard. Otherwise the header is validated and the slot table
    /// rebuilt from its persisted records and the guards around each region.
    pub fn open_with<P: AsRef<Path>>(path: P, config: ContainerConfig) -> Result<Self> {
        config.validate()?;

        let file = FileHandle::new(path.as_ref(), config.idle_timeout());
        let (header, slots, table_index, fresh) = {
            let mut lease = file.lease()?;
            let len = lease.len()?;
            if len == 0 {
                let header = ContainerHeader::new();
                lease.write_all_at(0, &header.to_bytes())?;
                lease.write_i64_at(FIRST_GUARD_OFFSET, 0)?;
                (header, SlotTable::new(), SENTINEL, true)
            } else {
                let (header, slots, table_index) = Self::load(&mut lease, len)?;
                (header, slots, table_index, false)
            }
        };

        let mut container = SlottedContainer {
            file,
            header,
            slots,
            table_index,
            dirty: fresh,
            append_in_flight: false,
            config,
        };

        if fresh {
            info!("Created container {:?}", container.path());
        } else {
            info!(
                "Opened container {:?}: {} slots, eof {:#x}",
                container.path(),
                container.slots.len(),
                container.header.end_of_file
            );
            if container.config.validate_on_open {
                container.validate_file()?;
            }
        }

        Ok(container)
    }

    fn load(lease: &mut FileLease<'_>, len: u64) -> Result<(ContainerHeader, SlotTable, SlotIndex)> {
        if len < HEADER_SIZE as u64 {
            return Err(PakError::malformed(format!(
                "file of {} bytes is shorter than the header",
                len
            )));
        }

        let mut bytes = vec![0u8; HEADER_SIZE];
        lease.read_exact_at(0, &mut bytes)?;
        let header = ContainerHeader::from_bytes(&bytes)?;

        let count = header.index_count as usize;
        if count == 0 {
            if header.root_entry_idx != 0 {
                return Err(PakError::malformed("root index set without a slot table"));
            }
            return Ok((header, SlotTable::new(), SENTINEL));
        }

        let table_len = (count as u64) * SlotRecord::SIZE as u64;
        let in_bounds = header.index_offset >= MIN_DATA_OFFSET
            && header
                .index_offset
                .checked_add(table_len)
                .is_some_and(|end| end <= len);
        if !in_bounds {
            return Err(PakError::malformed(format!(
                "slot table of {} records at {:#x} does not fit in {} bytes",
                count, header.index_offset, len
            )));
        }

        let mut table = vec![0u8; table_len as usize];
        lease.read_exact_at(header.index_offset, &mut table)?;
        let records = SlotRecord::decode_table(&table, count)?;

        let mut states = Vec::with_capacity(count);
        let mut seen = HashSet::with_capacity(count);
        for (index, record) in records.iter().enumerate() {
            if record.offset < MIN_DATA_OFFSET {
                if record.offset != 0 {
                    debug!(
                        "Slot {} offset {:#x} below data area; treating as unused",
                        index, record.offset
                    );
                }
                states.push(SlotState::Unused);
                continue;
            }
            if index == SENTINEL as usize {
                return Err(PakError::malformed("sentinel slot 0 holds a region"));
            }
            if !seen.insert(record.offset) {
                return Err(PakError::malformed(format!(
                    "two slots claim the region at {:#x}",
                    record.offset
                )));
            }
            states.push(Self::read_region(lease, len, record)?);
        }

        let slots = SlotTable::from_states(states);
        let table_index = slots
            .find_by_offset(header.index_offset)
            .filter(|&index| slots.get(index).is_some_and(SlotState::is_live))
            .ok_or_else(|| {
                PakError::malformed(format!(
                    "no live slot owns the slot table at {:#x}",
                    header.index_offset
                ))
            })?;

        if header.root_entry_idx != 0 {
            let root = usize::try_from(header.root_entry_idx).unwrap_or(usize::MAX);
            if root >= slots.len() || root == table_index as usize {
                return Err(PakError::malformed(format!(
                    "root index {} is not a user slot",
                    header.root_entry_idx
                )));
            }
        }

        Ok((header, slots, table_index))
    }

    /// Recover capacity and liveness of a recorded region from its guards
    fn read_region(lease: &mut FileLease<'_>, len: u64, record: &SlotRecord) -> Result<SlotState> {
        if record.offset.checked_add(8).map_or(true, |end| end > len) {
            return Err(PakError::malformed(format!(
                "region at {:#x} lies past end of file ({:#x})",
                record.offset, len
            )));
        }

        let leading = lease.read_i64_at(record.offset - 8)?;
        let capacity = leading.unsigned_abs();
        if leading == 0 || capacity % GRANULE != 0 || (record.offset - 8) % GRANULE != 0 {
            return Err(PakError::malformed(format!(
                "bad leading guard {} for region at {:#x}",
                leading, record.offset
            )));
        }

        let fits = record
            .offset
            .checked_add(capacity)
            .is_some_and(|end| end + 8 <= len);
        if !fits {
            return Err(PakError::malformed(format!(
                "region at {:#x} with {} bytes runs past end of file",
                record.offset, capacity
            )));
        }

        let trailing = lease.read_i64_at(record.offset + capacity)?;
        if trailing != leading {
            return Err(PakError::malformed(format!(
                "guard mismatch around {:#x}: leading {}, trailing {}",
                record.offset, leading, trailing
            )));
        }

        if record.size > capacity {
            return Err(PakError::malformed(format!(
                "region at {:#x} records size {} over capacity {}",
                record.offset, record.size, capacity
            )));
        }

        let region = Region {
            offset: record.offset,
            size: record.size,
            capacity,
        };
        Ok(if leading > 0 {
            SlotState::Live(region)
        } else {
            SlotState::Free {
                region,
                deletable: false,
            }
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn file_handle(&self) -> &FileHandle {
        &self.file
    }

    /// Whether the OS file handle is currently open
    pub fn is_handle_open(&self) -> bool {
        self.file.is_open()
    }

    /// Number of slot indices, including the sentinel
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Slot holding the persisted slot table, once one exists
    pub fn table_slot(&self) -> Option<SlotIndex> {
        (self.table_index != SENTINEL).then_some(self.table_index)
    }

    pub fn slot_state(&self, index: SlotIndex) -> Option<&SlotState> {
        self.slots.get(index)
    }

    // === Index checks ===

    fn check_index(&self, index: SlotIndex) -> Result<&SlotState> {
        if index == SENTINEL {
            return Err(PakError::InvalidSlot {
                index,
                reason: "slot 0 is the reserved sentinel",
            });
        }
        if index == self.table_index {
            return Err(PakError::InvalidSlot {
                index,
                reason: "slot is reserved for the slot table",
            });
        }
        match self.slots.get(index) {
            None => Err(PakError::InvalidSlot {
                index,
                reason: "index out of range",
            }),
            Some(SlotState::Unused) => Err(PakError::InvalidSlot {
                index,
                reason: "slot is not allocated",
            }),
            Some(state) => Ok(state),
        }
    }

    fn live_region(&self, index: SlotIndex) -> Result<Region> {
        match self.check_index(index)? {
            SlotState::Live(region) => Ok(*region),
            _ => Err(PakError::InvalidSlot {
                index,
                reason: "slot has been released",
            }),
        }
    }

    // === Allocation ===

    /// Allocate a slot able to hold `max_size` bytes
    ///
    /// Best fit over released regions first; otherwise a new region is
    /// appended at the end of the file. The returned slot starts with size 0.
    pub fn new_entry(&mut self, max_size: u64) -> Result<SlotIndex> {
        let capacity = aligned_capacity(max_size)?;

        if let Some(index) = self.slots.best_fit(capacity) {
            if let Some(state) = self.slots.get_mut(index) {
                if let Some(region) = state.region() {
                    let region = Region {
                        size: 0,
                        ..*region
                    };
                    *state = SlotState::Live(region);
                    debug!(
                        "Reused slot {} ({} bytes) for {} byte request",
                        index, region.capacity, max_size
                    );
                }
            }
            self.dirty = true;
            return Ok(index);
        }

        let region = self.append_region(capacity)?;
        let index = self.slots.acquire_index()?;
        self.slots.set(index, SlotState::Live(region));
        self.dirty = true;
        debug!(
            "Appended slot {} at {:#x} ({} bytes)",
            index, region.offset, capacity
        );
        Ok(index)
    }

    /// Claim `capacity` bytes at the end of the file and write its guards
    fn append_region(&mut self, capacity: u64) -> Result<Region> {
        let offset = self.header.end_of_file;
        let next = offset
            .checked_add(capacity)
            .and_then(|n| n.checked_add(2 * 8))
            .ok_or_else(|| PakError::Overflow(format!("file growth past {:#x}", offset)))?;
        let guard = i64::try_from(capacity)
            .map_err(|_| PakError::Overflow(format!("capacity {}", capacity)))?;

        // Terminator and trailing guard first: a non-zero leading guard
        // always has a partner, and the scan never runs into stale bytes
        let mut lease = self.file.lease()?;
        lease.write_i64_at(next - 8, 0)?;
        lease.write_i64_at(offset + capacity, guard)?;
        lease.write_i64_at(offset - 8, guard)?;

        self.header.end_of_file = next;
        Ok(Region::new(offset, capacity))
    }

    /// Stream a new slot's contents straight to the end of the file
    ///
    /// The slot is sized to exactly what the producer wrote. Only one append
    /// may be in flight; if a producer panics the container refuses further
    /// appends.
    pub fn write_new_entry<F>(&mut self, produce: F) -> Result<SlotIndex>
    where
        F: FnOnce(&mut AppendWriter<'_>) -> io::Result<()>,
    {
        if self.append_in_flight {
            return Err(PakError::AppendInFlight);
        }
        self.append_in_flight = true;

        let offset = self.header.end_of_file;
        let streamed = Self::stream_append(&self.file, offset, produce);
        self.append_in_flight = false;
        let written = match streamed {
            Ok(written) => written,
            Err(e) => {
                self.seal_tail(offset);
                return Err(e.into());
            }
        };

        let capacity = aligned_capacity(written)?;
        let mut region = self.append_region(capacity)?;
        region.size = written;

        let index = self.slots.acquire_index()?;
        self.slots.set(index, SlotState::Live(region));
        self.dirty = true;
        debug!("Streamed {} bytes into new slot {}", written, index);
        Ok(index)
    }

    /// Make sure the scan stops in front of an abandoned append
    fn seal_tail(&self, offset: u64) {
        let sealed = self
            .file
            .lease()
            .and_then(|mut lease| lease.write_i64_at(offset - 8, 0));
        if let Err(e) = sealed {
            warn!("Could not seal end of file at {:#x}: {}", offset - 8, e);
        }
    }

    fn stream_append<F>(file: &FileHandle, offset: u64, produce: F) -> io::Result<u64>
    where
        F: FnOnce(&mut AppendWriter<'_>) -> io::Result<()>,
    {
        let lease = file.lease()?;
        let mut writer = AppendWriter::new(lease, offset);
        produce(&mut writer)?;
        writer.finish()
    }

    // === Data access ===

    /// Scoped read view over a live slot's used bytes
    pub fn read_entry(&self, index: SlotIndex) -> Result<SlotReader<'_>> {
        let region = self.live_region(index)?;
        Ok(SlotReader::new(&self.file, region))
    }

    /// Scoped write view over a live slot's capacity; closing it sets the size
    pub fn write_entry(&mut self, index: SlotIndex) -> Result<SlotWriter<'_>> {
        let region = self.live_region(index)?;
        Ok(SlotWriter::new(self, index, region))
    }

    /// Whole contents of a live slot
    pub fn read_entry_bytes(&self, index: SlotIndex) -> Result<Vec<u8>> {
        let region = self.live_region(index)?;
        let len = usize::try_from(region.size)
            .map_err(|_| PakError::Overflow(format!("slot {} of {} bytes", index, region.size)))?;

        let mut data = vec![0u8; len];
        self.file.lease()?.read_exact_at(region.offset, &mut data)?;
        Ok(data)
    }

    /// Write `data` at byte `at` of a live slot, growing its size if needed
    pub fn write_entry_bytes(&mut self, index: SlotIndex, data: &[u8], at: u64) -> Result<()> {
        let region = self.live_region(index)?;
        let end = at
            .checked_add(data.len() as u64)
            .filter(|&end| end <= region.capacity)
            .ok_or_else(|| {
                PakError::Overflow(format!(
                    "{} bytes at {} exceed capacity {} of slot {}",
                    data.len(),
                    at,
                    region.capacity,
                    index
                ))
            })?;

        self.file.lease()?.write_all_at(region.offset + at, data)?;
        self.set_entry_size(index, region.size.max(end));
        Ok(())
    }

    /// Record the used size of a slot; called when a write view closes
    pub(crate) fn set_entry_size(&mut self, index: SlotIndex, size: u64) {
        if let Some(region) = self.slots.get_mut(index).and_then(SlotState::region_mut) {
            region.size = size.min(region.capacity);
            self.dirty = true;
        }
    }

    // === Slot lifecycle ===

    /// Return a slot's region to the free set. Releasing a free slot is a no-op.
    pub fn release_entry(&mut self, index: SlotIndex) -> Result<()> {
        let state = *self.check_index(index)?;
        if let SlotState::Live(region) = state {
            self.slots.set(
                index,
                SlotState::Free {
                    region,
                    deletable: false,
                },
            );
            self.dirty = true;
            debug!("Released slot {} ({} bytes)", index, region.capacity);
        }
        Ok(())
    }

    /// Take a released slot back, keeping its recorded size
    pub fn claim_entry(&mut self, index: SlotIndex) -> Result<()> {
        let state = *self.check_index(index)?;
        if let SlotState::Free { region, .. } = state {
            self.slots.set(index, SlotState::Live(region));
            self.dirty = true;
            debug!("Claimed slot {}", index);
        }
        Ok(())
    }

    /// Free a slot and mark its region for physical reclamation
    pub fn delete_entry(&mut self, index: SlotIndex) -> Result<()> {
        let state = *self.check_index(index)?;
        let region = match state {
            SlotState::Live(region) | SlotState::Free { region, .. } => region,
            SlotState::Unused => return Ok(()),
        };
        self.slots.set(
            index,
            SlotState::Free {
                region,
                deletable: true,
            },
        );
        self.dirty = true;
        debug!("Deleted slot {}", index);
        Ok(())
    }

    pub fn entry_capacity(&self, index: SlotIndex) -> Result<u64> {
        Ok(self.region_of(index)?.capacity)
    }

    pub fn entry_size(&self, index: SlotIndex) -> Result<u64> {
        Ok(self.region_of(index)?.size)
    }

    fn region_of(&self, index: SlotIndex) -> Result<Region> {
        self.check_index(index)?
            .region()
            .copied()
            .ok_or(PakError::InvalidSlot {
                index,
                reason: "slot is not allocated",
            })
    }

    /// Live user slots in index order
    pub fn entries(&self) -> Vec<SlotIndex> {
        self.slots
            .iter()
            .filter(|&(index, state)| index != self.table_index && state.is_live())
            .map(|(index, _)| index)
            .collect()
    }

    /// Released slots whose regions await reuse
    pub fn unclaimed_entries(&self) -> Vec<SlotIndex> {
        self.slots
            .iter()
            .filter(|(_, state)| state.is_free())
            .map(|(index, _)| index)
            .collect()
    }

    /// Released slots marked for physical reclamation
    pub fn deletable_entries(&self) -> Vec<SlotIndex> {
        self.slots
            .iter()
            .filter(|(_, state)| matches!(state, SlotState::Free { deletable: true, .. }))
            .map(|(index, _)| index)
            .collect()
    }

    // === Root ===

    pub fn root_index(&self) -> Option<SlotIndex> {
        match self.header.root_entry_idx {
            0 => None,
            index => SlotIndex::try_from(index).ok(),
        }
    }

    /// Anchor a live slot as the container's root
    pub fn set_root_index(&mut self, index: SlotIndex) -> Result<()> {
        self.live_region(index)?;
        self.header.root_entry_idx = u64::from(index);
        self.dirty = true;
        Ok(())
    }

    pub fn stats(&self) -> ContainerStats {
        let mut stats = ContainerStats {
            slot_count: self.slots.len(),
            live_slots: 0,
            free_slots: 0,
            deletable_slots: 0,
            unused_slots: 0,
            live_bytes: 0,
            free_bytes: 0,
            end_of_file: self.header.end_of_file,
            table_slot: self.table_slot(),
            root_slot: self.root_index(),
        };

        for (index, state) in self.slots.iter() {
            match state {
                SlotState::Unused => stats.unused_slots += 1,
                SlotState::Live(_) if index == self.table_index => {}
                SlotState::Live(region) => {
                    stats.live_slots += 1;
                    stats.live_bytes += region.size;
                }
                SlotState::Free { region, deletable } => {
                    stats.free_slots += 1;
                    stats.free_bytes += region.capacity;
                    if *deletable {
                        stats.deletable_slots += 1;
                    }
                }
            }
        }
        stats
    }

    // === Validation ===

    /// Rescan the physical file and repair the slot table against it
    ///
    /// Slots whose region is missing are demoted to unused; regions with no
    /// slot are recovered as free slots. Layout violations are fatal.
    pub fn validate_file(&mut self) -> Result<ValidationReport> {
        let scan = {
            let mut lease = self.file.lease()?;
            validation::scan_regions(&mut lease)?
        };
        let report = validation::reconcile(&mut self.slots, &scan)?;

        if report.slots_demoted.contains(&self.table_index) {
            warn!("Slot table region is gone; it will be rewritten on flush");
            self.table_index = SENTINEL;
        }
        if let Some(root) = self.root_index() {
            if report.slots_demoted.contains(&root) {
                warn!("Root slot {} was demoted; clearing root", root);
                self.header.root_entry_idx = 0;
            }
        }
        if report.end_of_file != self.header.end_of_file {
            warn!(
                "End of file moves from {:#x} to {:#x}",
                self.header.end_of_file, report.end_of_file
            );
            self.header.end_of_file = report.end_of_file;
            self.dirty = true;
        }
        if !report.is_clean() {
            self.dirty = true;
        }

        info!(
            "Validated {:?}: {} regions, {} demoted, {} recovered",
            self.path(),
            report.regions_scanned,
            report.slots_demoted.len(),
            report.slots_recovered.len()
        );
        Ok(report)
    }

    // === Persistence ===

    /// Persist the slot table, the guards and the header, in that order
    ///
    /// No-op when nothing changed since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        self.ensure_table_capacity()?;

        let count = self.slots.len();
        let table_len = (count * SlotRecord::SIZE) as u64;
        let index_count = u32::try_from(count)
            .map_err(|_| PakError::Overflow(format!("{} slot records", count)))?;
        self.set_entry_size(self.table_index, table_len);
        let table = self.live_region_unchecked(self.table_index)?;

        let mut records = Vec::with_capacity(count * SlotRecord::SIZE);
        for (_, state) in self.slots.iter() {
            let record = state
                .region()
                .map(|region| SlotRecord {
                    offset: region.offset,
                    size: region.size,
                })
                .unwrap_or_default();
            record.encode_into(&mut records);
        }

        let mut lease = self.file.lease()?;
        {
            let mut writer = lease.writer_at(table.offset)?;
            writer.write_all(&records)?;
            writer.flush()?;
        }

        for (_, state) in self.slots.iter() {
            if let (Some(region), Some(guard)) = (state.region(), state.guard_word()) {
                lease.write_i64_at(region.leading_guard(), guard)?;
                lease.write_i64_at(region.trailing_guard(), guard)?;
            }
        }

        self.header.index_offset = table.offset;
        self.header.index_count = index_count;
        lease.write_all_at(0, &self.header.to_bytes())?;
        lease.sync()?;
        drop(lease);

        self.dirty = false;
        debug!(
            "Flushed {:?}: {} slots, table at {:#x}",
            self.path(),
            count,
            table.offset
        );
        Ok(())
    }

    fn live_region_unchecked(&self, index: SlotIndex) -> Result<Region> {
        match self.slots.get(index) {
            Some(SlotState::Live(region)) => Ok(*region),
            _ => Err(PakError::malformed(format!(
                "slot table slot {} is not live",
                index
            ))),
        }
    }

    /// Move the slot table to a bigger region until every record fits
    fn ensure_table_capacity(&mut self) -> Result<()> {
        loop {
            let needed = (self.slots.len() * SlotRecord::SIZE) as u64;
            let current = match self.slots.get(self.table_index) {
                Some(SlotState::Live(region)) if self.table_index != SENTINEL => {
                    Some(*region)
                }
                _ => None,
            };
            if current.is_some_and(|region| region.capacity >= needed) {
                return Ok(());
            }

            if let Some(region) = current {
                self.slots.set(
                    self.table_index,
                    SlotState::Free {
                        region,
                        deletable: false,
                    },
                );
            }

            let grown = (self.slots.len() as f64 * self.config.table_growth_factor).ceil() as u64;
            let records = grown.max(u64::from(self.config.table_min_growth));
            let old = self.table_index;
            self.table_index = SENTINEL;
            self.table_index = self.new_entry(records * SlotRecord::SIZE as u64)?;
            debug!(
                "Slot table moved from slot {} to slot {} ({} records)",
                old, self.table_index, records
            );
        }
    }

    /// Flush and close the OS handle
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.file.release()?;
        info!("Closed container {:?}", self.path());
        Ok(())
    }
}

impl Drop for SlottedContainer {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                error!("Flush of {:?} on drop failed: {}", self.path(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use tempfile::TempDir;

    fn config() -> ContainerConfig {
        ContainerConfig {
            idle_timeout_ms: 0,
            ..ContainerConfig::default()
        }
    }

    fn create() -> (TempDir, SlottedContainer) {
        let dir = TempDir::new().unwrap();
        let container = SlottedContainer::open_with(dir.path().join("test.pak"), config()).unwrap();
        (dir, container)
    }

    #[test]
    fn test_aligned_capacity() {
        assert_eq!(aligned_capacity(0).unwrap(), 16);
        assert_eq!(aligned_capacity(1).unwrap(), 16);
        assert_eq!(aligned_capacity(16).unwrap(), 16);
        assert_eq!(aligned_capacity(17).unwrap(), 32);
        assert!(matches!(aligned_capacity(u64::MAX), Err(PakError::Overflow(_))));
    }

    #[test]
    fn test_new_container() {
        let (_dir, container) = create();
        assert_eq!(container.slot_count(), 1);
        assert_eq!(container.header().end_of_file, MIN_DATA_OFFSET);
        assert!(container.entries().is_empty());
        assert!(container.root_index().is_none());
        assert!(container.is_dirty());
    }

    #[test]
    fn test_append_geometry() {
        let (_dir, mut container) = create();
        let a = container.new_entry(10).unwrap();
        let b = container.new_entry(40).unwrap();

        assert_eq!((a, b), (1, 2));
        assert_eq!(container.entry_capacity(a).unwrap(), 16);
        assert_eq!(container.entry_capacity(b).unwrap(), 48);

        let ra = *container.slot_state(a).unwrap().region().unwrap();
        let rb = *container.slot_state(b).unwrap().region().unwrap();
        assert_eq!(ra.offset, MIN_DATA_OFFSET);
        assert_eq!(rb.offset, ra.offset + 16 + 16);
        assert_eq!(container.header().end_of_file, rb.offset + 48 + 16);
    }

    #[test]
    fn test_bytes_round_trip() {
        let (_dir, mut container) = create();
        let index = container.new_entry(64).unwrap();
        container.write_entry_bytes(index, b"hello", 0).unwrap();
        container.write_entry_bytes(index, b"world", 5).unwrap();

        assert_eq!(container.entry_size(index).unwrap(), 10);
        assert_eq!(container.read_entry_bytes(index).unwrap(), b"helloworld");
    }

    #[test]
    fn test_write_past_capacity() {
        let (_dir, mut container) = create();
        let index = container.new_entry(16).unwrap();
        let err = container.write_entry_bytes(index, &[1u8; 17], 0).unwrap_err();
        assert!(matches!(err, PakError::Overflow(_)));
        assert_eq!(container.entry_size(index).unwrap(), 0);
    }

    #[test]
    fn test_write_view_sets_size() {
        let (_dir, mut container) = create();
        let index = container.new_entry(100).unwrap();

        {
            let mut writer = container.write_entry(index).unwrap();
            writer.write_all(b"scoped view").unwrap();
        }
        assert_eq!(container.entry_size(index).unwrap(), 11);

        let mut reader = container.read_entry(index).unwrap();
        let mut text = String::new();
        reader.read_to_string(&mut text).unwrap();
        assert_eq!(text, "scoped view");

        reader.seek(SeekFrom::Start(7)).unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, b"view");
    }

    #[test]
    fn test_write_view_is_bounded() {
        let (_dir, mut container) = create();
        let index = container.new_entry(16).unwrap();

        let mut writer = container.write_entry(index).unwrap();
        let err = writer.write_all(&[7u8; 32]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(writer.finish().unwrap(), 16);
        assert_eq!(container.entry_size(index).unwrap(), 16);
    }

    #[test]
    fn test_best_fit_reuse() {
        let (_dir, mut container) = create();
        let big = container.new_entry(256).unwrap();
        let small = container.new_entry(64).unwrap();
        let _keep = container.new_entry(16).unwrap();
        let eof = container.header().end_of_file;

        container.release_entry(big).unwrap();
        container.release_entry(small).unwrap();

        let reused = container.new_entry(48).unwrap();
        assert_eq!(reused, small);
        assert_eq!(container.entry_size(reused).unwrap(), 0);
        assert_eq!(container.header().end_of_file, eof);
        assert_eq!(container.unclaimed_entries(), vec![big]);
    }

    #[test]
    fn test_release_and_claim() {
        let (_dir, mut container) = create();
        let index = container.new_entry(32).unwrap();
        container.write_entry_bytes(index, b"keep me", 0).unwrap();

        container.release_entry(index).unwrap();
        container.release_entry(index).unwrap();
        assert!(matches!(
            container.read_entry_bytes(index),
            Err(PakError::InvalidSlot { .. })
        ));

        container.claim_entry(index).unwrap();
        assert_eq!(container.read_entry_bytes(index).unwrap(), b"keep me");
    }

    #[test]
    fn test_delete_marks_deletable() {
        let (_dir, mut container) = create();
        let index = container.new_entry(32).unwrap();
        container.delete_entry(index).unwrap();

        assert_eq!(container.deletable_entries(), vec![index]);
        assert_eq!(container.unclaimed_entries(), vec![index]);
        assert_eq!(container.stats().deletable_slots, 1);
    }

    #[test]
    fn test_invalid_indices() {
        let (_dir, mut container) = create();
        let index = container.new_entry(16).unwrap();
        container.flush().unwrap();
        let table = container.table_slot().unwrap();

        for bad in [SENTINEL, table, 999] {
            assert!(matches!(
                container.read_entry_bytes(bad),
                Err(PakError::InvalidSlot { .. })
            ));
            assert!(matches!(
                container.release_entry(bad),
                Err(PakError::InvalidSlot { .. })
            ));
        }
        assert!(container.read_entry_bytes(index).is_ok());
    }

    #[test]
    fn test_append_stream() {
        let (_dir, mut container) = create();
        let index = container
            .write_new_entry(|w| {
                w.write_all(b"streamed ")?;
                w.write_all(b"payload")
            })
            .unwrap();

        assert_eq!(container.entry_size(index).unwrap(), 16);
        assert_eq!(container.entry_capacity(index).unwrap(), 16);
        assert_eq!(container.read_entry_bytes(index).unwrap(), b"streamed payload");
    }

    #[test]
    fn test_append_failure_leaves_no_slot() {
        let (_dir, mut container) = create();
        let eof = container.header().end_of_file;
        let result = container.write_new_entry(|w| {
            w.write_all(b"partial")?;
            Err(io::Error::new(io::ErrorKind::Other, "producer gave up"))
        });

        assert!(matches!(result, Err(PakError::Io(_))));
        assert_eq!(container.slot_count(), 1);
        assert_eq!(container.header().end_of_file, eof);

        // The next append still works
        assert!(container.write_new_entry(|w| w.write_all(b"ok")).is_ok());
    }

    #[test]
    fn test_flush_allocates_table() {
        let (dir, mut container) = create();
        let index = container.new_entry(16).unwrap();
        container.write_entry_bytes(index, b"x", 0).unwrap();
        container.flush().unwrap();

        let table = container.table_slot().unwrap();
        assert_eq!(container.entry_capacity_unchecked(table), 50 * 16);
        assert!(!container.is_dirty());
        assert_eq!(container.header().index_count as usize, container.slot_count());
        drop(container);

        let reopened = SlottedContainer::open_with(dir.path().join("test.pak"), config()).unwrap();
        assert_eq!(reopened.table_slot(), Some(table));
        assert_eq!(reopened.read_entry_bytes(index).unwrap(), b"x");
    }

    #[test]
    fn test_root_index() {
        let (_dir, mut container) = create();
        let index = container.new_entry(16).unwrap();
        container.set_root_index(index).unwrap();
        assert_eq!(container.root_index(), Some(index));
        assert!(container.set_root_index(SENTINEL).is_err());
    }

    impl SlottedContainer {
        fn entry_capacity_unchecked(&self, index: SlotIndex) -> u64 {
            self.slots.get(index).unwrap().region().unwrap().capacity
        }
    }
}
