//! Scoped views into slot regions
//!
//! A [`SlotReader`] is bounded by the slot's used size, a [`SlotWriter`] by its
//! capacity. Closing a writer (explicitly via [`SlotWriter::finish`] or by
//! dropping it) records the high-water mark as the slot's new size. A writer
//! that hit an I/O error leaves the recorded size untouched.

use crate::core::container::SlottedContainer;
use crate::core::io::{FileHandle, FileLease, HandlePin};
use crate::core::slot::{Region, SlotIndex};
use crate::error::{PakError, Result};
use std::io::{self, Read, Seek, SeekFrom, Write};

fn seek_target(base: u64, pos: SeekFrom, current: u64) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::End(delta) => base.checked_add_signed(delta),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
    };
    target.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "seek to a negative or overflowing position",
        )
    })
}

/// Read-only view of a live slot
pub struct SlotReader<'a> {
    file: &'a FileHandle,
    _pin: HandlePin,
    region: Region,
    pos: u64,
}

impl<'a> SlotReader<'a> {
    pub(crate) fn new(file: &'a FileHandle, region: Region) -> Self {
        SlotReader {
            _pin: file.pin(),
            file,
            region,
            pos: 0,
        }
    }

    /// Bytes available to read from the start of the slot
    pub fn len(&self) -> u64 {
        self.region.size
    }

    pub fn is_empty(&self) -> bool {
        self.region.size == 0
    }
}

impl Read for SlotReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.region.size.saturating_sub(self.pos);
        let n = remaining.min(buf.len() as u64) as usize;
        if n == 0 {
            return Ok(0);
        }

        self.file
            .lease()?
            .read_exact_at(self.region.offset + self.pos, &mut buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SlotReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = seek_target(self.region.size, pos, self.pos)?;
        Ok(self.pos)
    }
}

/// Write view of a live slot, bounded by its capacity
pub struct SlotWriter<'a> {
    container: &'a mut SlottedContainer,
    _pin: HandlePin,
    index: SlotIndex,
    region: Region,
    pos: u64,
    high_water: u64,
    failed: bool,
    committed: bool,
}

impl<'a> SlotWriter<'a> {
    pub(crate) fn new(container: &'a mut SlottedContainer, index: SlotIndex, region: Region) -> Self {
        let pin = container.file_handle().pin();
        SlotWriter {
            container,
            _pin: pin,
            index,
            region,
            pos: 0,
            high_water: 0,
            failed: false,
            committed: false,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.region.capacity
    }

    pub fn written(&self) -> u64 {
        self.high_water
    }

    /// Close the view and record the bytes written as the slot's size
    pub fn finish(mut self) -> Result<u64> {
        if self.failed {
            return Err(PakError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("write view of slot {} failed; size left unchanged", self.index),
            )));
        }
        self.commit();
        Ok(self.high_water)
    }

    fn commit(&mut self) {
        if self.committed || self.failed {
            return;
        }
        self.container.set_entry_size(self.index, self.high_water);
        self.committed = true;
    }
}

impl Write for SlotWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write view already failed",
            ));
        }

        let available = self.region.capacity.saturating_sub(self.pos);
        let n = available.min(buf.len() as u64) as usize;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!(
                    "slot {} is full ({} bytes)",
                    self.index, self.region.capacity
                ),
            ));
        }

        let written = self
            .container
            .file_handle()
            .lease()
            .and_then(|mut lease| lease.write_all_at(self.region.offset + self.pos, &buf[..n]));
        if let Err(e) = written {
            self.failed = true;
            return Err(e);
        }

        self.pos += n as u64;
        self.high_water = self.high_water.max(self.pos);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SlotWriter<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = seek_target(self.high_water, pos, self.pos)?;
        Ok(self.pos)
    }
}

impl Drop for SlotWriter<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}

/// Streaming writer for append-only slot creation
///
/// Bytes go straight past the current end of the file; the slot and its
/// guards are created once the producer returns.
pub struct AppendWriter<'a> {
    lease: FileLease<'a>,
    start: u64,
    flushed: u64,
    buffer: Vec<u8>,
}

impl<'a> AppendWriter<'a> {
    const BUFFER_SIZE: usize = 64 * 1024;

    pub(crate) fn new(lease: FileLease<'a>, start: u64) -> Self {
        AppendWriter {
            lease,
            start,
            flushed: 0,
            buffer: Vec::with_capacity(Self::BUFFER_SIZE),
        }
    }

    /// Bytes accepted so far
    pub fn written(&self) -> u64 {
        self.flushed + self.buffer.len() as u64
    }

    /// Flush remaining bytes and return the total length
    pub(crate) fn finish(mut self) -> io::Result<u64> {
        self.flush()?;
        Ok(self.flushed)
    }
}

impl Write for AppendWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= Self::BUFFER_SIZE {
            self.flush()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.lease
            .write_all_at(self.start + self.flushed, &self.buffer)?;
        self.flushed += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }
}
