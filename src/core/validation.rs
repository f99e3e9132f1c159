//! Physical-layout validation and recovery
//!
//! The slot table is only a cache of what the guard words already say. This
//! module walks the file from the first guard after the header, rebuilding the
//! list of regions from the guards alone, and reconciles the slot table with
//! that ground truth:
//!
//! - a slot pointing at an offset no region starts at is demoted to `Unused`
//! - a region nobody points at gets a freshly appended `Free` slot
//!
//! The walk stops at the first zero guard or at the end of the file.

use crate::core::header::FIRST_GUARD_OFFSET;
use crate::core::io::FileLease;
use crate::core::slot::{Region, SlotIndex, SlotState, SlotTable, SENTINEL};
use crate::error::{PakError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;
use tracing::{debug, warn};

/// A region found by walking the guard words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedRegion {
    pub offset: u64,
    pub capacity: u64,
    /// Positive guard: the region was live when its guards were last written
    pub live: bool,
}

/// Result of a guard walk
#[derive(Debug, Clone, Default)]
pub struct Scan {
    pub regions: Vec<ScannedRegion>,
    /// Position of the terminating guard (zero, or end of file)
    pub end: u64,
}

impl Scan {
    /// Data offset the next appended region would get
    pub fn next_data_offset(&self) -> u64 {
        self.end + 8
    }
}

/// Outcome of [`SlottedContainer::validate_file`](crate::core::container::SlottedContainer::validate_file)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub regions_scanned: usize,
    pub live_regions: usize,
    pub free_regions: usize,
    /// Slots whose region was not found in the file
    pub slots_demoted: Vec<SlotIndex>,
    /// Slots synthesized for orphaned regions
    pub slots_recovered: Vec<SlotIndex>,
    /// Slots whose capacity disagreed with the guards
    pub capacity_fixed: Vec<SlotIndex>,
    pub end_of_file: u64,
}

impl ValidationReport {
    /// True when the slot table already matched the file
    pub fn is_clean(&self) -> bool {
        self.slots_demoted.is_empty()
            && self.slots_recovered.is_empty()
            && self.capacity_fixed.is_empty()
    }
}

/// Walk every guard-delimited region from the first post-header guard
pub fn scan_regions(lease: &mut FileLease<'_>) -> Result<Scan> {
    let len = lease.len()?;
    let mut reader = lease.reader_at(FIRST_GUARD_OFFSET)?;
    let mut pos = FIRST_GUARD_OFFSET;
    let mut regions = Vec::new();
    let mut word = [0u8; 8];

    while pos + 8 <= len {
        reader.read_exact(&mut word)?;
        let guard = i64::from_le_bytes(word);
        if guard == 0 {
            break;
        }

        let capacity = guard.unsigned_abs();
        let offset = pos + 8;
        if capacity % 16 != 0 {
            return Err(PakError::malformed(format!(
                "region at {:#x} has misaligned length {}",
                offset, capacity
            )));
        }

        let trailing = offset
            .checked_add(capacity)
            .filter(|end| end + 8 <= len)
            .ok_or_else(|| {
                PakError::malformed(format!(
                    "region at {:#x} with {} bytes runs past end of file ({:#x})",
                    offset, capacity, len
                ))
            })?;

        reader.seek_relative(capacity as i64)?;
        reader.read_exact(&mut word)?;
        let closing = i64::from_le_bytes(word);
        if closing != guard {
            return Err(PakError::malformed(format!(
                "guard mismatch around {:#x}: leading {}, trailing {}",
                offset, guard, closing
            )));
        }

        regions.push(ScannedRegion {
            offset,
            capacity,
            live: guard > 0,
        });

        pos = trailing + 8;
        if pos % 16 != 0 {
            return Err(PakError::malformed(format!(
                "guard after region {:#x} is misaligned at {:#x}",
                offset, pos
            )));
        }
    }

    debug!("Scanned {} regions up to {:#x}", regions.len(), pos);
    Ok(Scan { regions, end: pos })
}

/// Bring `slots` in line with a scan, returning what had to change
pub fn reconcile(slots: &mut SlotTable, scan: &Scan) -> Result<ValidationReport> {
    if !slots.get(SENTINEL).is_some_and(SlotState::is_unused) {
        return Err(PakError::malformed("sentinel slot 0 holds a region"));
    }

    let mut by_offset: HashMap<u64, (ScannedRegion, bool)> = scan
        .regions
        .iter()
        .map(|region| (region.offset, (*region, false)))
        .collect();

    let mut report = ValidationReport {
        regions_scanned: scan.regions.len(),
        live_regions: scan.regions.iter().filter(|r| r.live).count(),
        free_regions: scan.regions.iter().filter(|r| !r.live).count(),
        end_of_file: scan.next_data_offset(),
        ..Default::default()
    };

    let indices: Vec<SlotIndex> = slots
        .iter()
        .filter(|(_, state)| !state.is_unused())
        .map(|(index, _)| index)
        .collect();

    for index in indices {
        let Some(state) = slots.get_mut(index) else {
            continue;
        };
        let Some(region) = state.region_mut() else {
            continue;
        };

        match by_offset.get_mut(&region.offset) {
            Some((_, true)) => {
                return Err(PakError::malformed(format!(
                    "two slots claim the region at {:#x}",
                    region.offset
                )));
            }
            Some((scanned, claimed)) => {
                *claimed = true;
                if region.capacity != scanned.capacity {
                    warn!(
                        "Slot {} records capacity {} but guards say {}",
                        index, region.capacity, scanned.capacity
                    );
                    region.capacity = scanned.capacity;
                    region.size = region.size.min(region.capacity);
                    report.capacity_fixed.push(index);
                }
            }
            None => {
                warn!(
                    "Slot {} points at {:#x}, which is not a region; demoting",
                    index, region.offset
                );
                *state = SlotState::Unused;
                report.slots_demoted.push(index);
            }
        }
    }

    let mut orphans: Vec<ScannedRegion> = by_offset
        .into_values()
        .filter(|(_, claimed)| !claimed)
        .map(|(region, _)| region)
        .collect();
    orphans.sort_by_key(|region| region.offset);

    for orphan in orphans {
        let index = slots.push(SlotState::Free {
            region: Region {
                offset: orphan.offset,
                size: orphan.capacity,
                capacity: orphan.capacity,
            },
            deletable: false,
        })?;
        warn!(
            "Recovered orphaned region at {:#x} ({} bytes) as free slot {}",
            orphan.offset, orphan.capacity, index
        );
        report.slots_recovered.push(index);
    }

    Ok(report)
}
