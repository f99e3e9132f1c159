//! Slotted container engine
//!
//! - [`header`]: the fixed 0x230-byte file header
//! - [`records`]: slot, root and hash record codecs
//! - [`slot`]: the in-memory slot arena
//! - [`io`]: lazily opened, idle-expiring file handle
//! - [`view`]: scoped read/write views into slots
//! - [`container`]: allocation, reuse and flush
//! - [`validation`]: guard walk and slot-table recovery

pub mod container;
pub mod header;
pub mod io;
pub mod records;
pub mod slot;
pub mod validation;
pub mod view;

pub use container::{ContainerStats, SlottedContainer};
pub use header::ContainerHeader;
pub use slot::{Region, SlotIndex, SlotState};
pub use validation::ValidationReport;
pub use view::{AppendWriter, SlotReader, SlotWriter};
