//! Slot arena
//!
//! One dense table of tagged slot states. Index 0 is a permanent sentinel and
//! always stays `Unused`. Reuse candidates, recyclable indices and deletion
//! marks are all derived from this single table, so they cannot drift apart.

use crate::error::{PakError, Result};

/// Stable index into the slot table
pub type SlotIndex = u32;

/// Index of the sentinel slot
pub const SENTINEL: SlotIndex = 0;

/// A guard-delimited byte region in the container file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Byte position of the first data byte
    pub offset: u64,
    /// Bytes currently in use
    pub size: u64,
    /// Allocated bytes between the guards, always a multiple of 16
    pub capacity: u64,
}

impl Region {
    pub fn new(offset: u64, capacity: u64) -> Self {
        Region {
            offset,
            size: 0,
            capacity,
        }
    }

    /// Position of the leading guard word
    pub fn leading_guard(&self) -> u64 {
        self.offset - 8
    }

    /// Position of the trailing guard word
    pub fn trailing_guard(&self) -> u64 {
        self.offset + self.capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never written, or recycled; carries no region
    Unused,
    /// Claimed region holding data
    Live(Region),
    /// Released region available to the allocator. `deletable` marks regions
    /// whose space should eventually be reclaimed physically.
    Free { region: Region, deletable: bool },
}

impl SlotState {
    pub fn region(&self) -> Option<&Region> {
        match self {
            SlotState::Unused => None,
            SlotState::Live(region) | SlotState::Free { region, .. } => Some(region),
        }
    }

    pub fn region_mut(&mut self) -> Option<&mut Region> {
        match self {
            SlotState::Unused => None,
            SlotState::Live(region) | SlotState::Free { region, .. } => Some(region),
        }
    }

    pub fn is_unused(&self) -> bool {
        matches!(self, SlotState::Unused)
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SlotState::Live(_))
    }

    pub fn is_free(&self) -> bool {
        matches!(self, SlotState::Free { .. })
    }

    /// Guard word value for this slot's region: capacity, negated when free
    pub fn guard_word(&self) -> Option<i64> {
        match self {
            SlotState::Unused => None,
            SlotState::Live(region) => Some(region.capacity as i64),
            SlotState::Free { region, .. } => Some(-(region.capacity as i64)),
        }
    }
}

/// Dense arena of slot states
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<SlotState>,
}

impl SlotTable {
    /// Table holding only the sentinel
    pub fn new() -> Self {
        SlotTable {
            slots: vec![SlotState::Unused],
        }
    }

    /// Build a table from decoded states. An empty input still gets a sentinel.
    pub fn from_states(mut slots: Vec<SlotState>) -> Self {
        if slots.is_empty() {
            slots.push(SlotState::Unused);
        }
        SlotTable { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        // The sentinel is not an entry
        self.slots.len() <= 1
    }

    pub fn get(&self, index: SlotIndex) -> Option<&SlotState> {
        self.slots.get(index as usize)
    }

    pub fn get_mut(&mut self, index: SlotIndex) -> Option<&mut SlotState> {
        self.slots.get_mut(index as usize)
    }

    pub fn set(&mut self, index: SlotIndex, state: SlotState) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            *slot = state;
        }
    }

    /// Hand out an `Unused` index, recycling the lowest one before growing the table
    pub fn acquire_index(&mut self) -> Result<SlotIndex> {
        if let Some(pos) = self
            .slots
            .iter()
            .skip(1)
            .position(SlotState::is_unused)
        {
            return Ok(pos as SlotIndex + 1);
        }

        let index = SlotIndex::try_from(self.slots.len())
            .map_err(|_| PakError::Overflow("slot table exceeds u32 indices".to_string()))?;
        self.slots.push(SlotState::Unused);
        Ok(index)
    }

    /// Append a slot at a fresh index, never recycling
    pub fn push(&mut self, state: SlotState) -> Result<SlotIndex> {
        let index = SlotIndex::try_from(self.slots.len())
            .map_err(|_| PakError::Overflow("slot table exceeds u32 indices".to_string()))?;
        self.slots.push(state);
        Ok(index)
    }

    /// Smallest free region with at least `min_capacity` bytes.
    /// Ties go to the lowest index.
    pub fn best_fit(&self, min_capacity: u64) -> Option<SlotIndex> {
        self.iter()
            .filter_map(|(index, state)| match state {
                SlotState::Free { region, .. } if region.capacity >= min_capacity => {
                    Some((index, region.capacity))
                }
                _ => None,
            })
            .min_by_key(|&(index, capacity)| (capacity, index))
            .map(|(index, _)| index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotIndex, &SlotState)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, state)| (index as SlotIndex, state))
    }

    /// Slot whose region starts at `offset`
    pub fn find_by_offset(&self, offset: u64) -> Option<SlotIndex> {
        self.iter()
            .find(|(_, state)| state.region().is_some_and(|r| r.offset == offset))
            .map(|(index, _)| index)
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}
