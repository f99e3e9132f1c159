//! Container round-trip and allocation tests
//!
//! Data written to slots must survive close/reopen, released regions must be
//! reused best-fit, and every region must stay guard-delimited and aligned.

use pakstore_rs::core::header::MIN_DATA_OFFSET;
use pakstore_rs::core::slot::SlotState;
use pakstore_rs::{ContainerConfig, ErrorKind, PakError, SlottedContainer};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn config() -> ContainerConfig {
    ContainerConfig::default().with_idle_timeout(None)
}

/// Helper: read a raw guard word from the file
fn read_guard(path: &Path, pos: u64) -> i64 {
    let mut file = File::open(path).unwrap();
    file.seek(SeekFrom::Start(pos)).unwrap();
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf).unwrap();
    i64::from_le_bytes(buf)
}

#[test]
fn test_round_trip_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("roundtrip.pak");
    let sizes = [0usize, 1, 15, 16, 17, 1000, 70_000];

    let mut written = Vec::new();
    {
        let mut container = SlottedContainer::open_with(&path, config()).unwrap();
        for (i, &size) in sizes.iter().enumerate() {
            let data: Vec<u8> = (0..size).map(|b| (b * 7 + i) as u8).collect();
            let slot = container.new_entry(size as u64).unwrap();
            container.write_entry_bytes(slot, &data, 0).unwrap();
            written.push((slot, data));
        }
        container.close().unwrap();
    }

    let container = SlottedContainer::open_with(&path, config()).unwrap();
    for (slot, data) in &written {
        assert_eq!(&container.read_entry_bytes(*slot).unwrap(), data);
        assert_eq!(container.entry_size(*slot).unwrap(), data.len() as u64);
    }
    assert_eq!(container.entries().len(), sizes.len());
}

#[test]
fn test_drop_flushes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("drop.pak");

    let slot = {
        let mut container = SlottedContainer::open_with(&path, config()).unwrap();
        let slot = container.new_entry(8).unwrap();
        container.write_entry_bytes(slot, b"dropped", 0).unwrap();
        slot
    };

    let container = SlottedContainer::open_with(&path, config()).unwrap();
    assert_eq!(container.read_entry_bytes(slot).unwrap(), b"dropped");
}

#[test]
fn test_released_slot_is_reused() {
    let dir = TempDir::new().unwrap();
    let mut container = SlottedContainer::open_with(dir.path().join("reuse.pak"), config()).unwrap();

    let a = container.new_entry(100).unwrap();
    let _b = container.new_entry(100).unwrap();
    container.release_entry(a).unwrap();

    let eof = container.header().end_of_file;
    let c = container.new_entry(60).unwrap();
    assert_eq!(c, a, "released slot should be reused, not appended");
    assert_eq!(container.header().end_of_file, eof);
}

#[test]
fn test_reuse_picks_tightest_fit() {
    let dir = TempDir::new().unwrap();
    let mut container = SlottedContainer::open_with(dir.path().join("fit.pak"), config()).unwrap();

    let large = container.new_entry(1024).unwrap();
    let medium = container.new_entry(256).unwrap();
    let small = container.new_entry(32).unwrap();
    for slot in [large, medium, small] {
        container.release_entry(slot).unwrap();
    }

    assert_eq!(container.new_entry(200).unwrap(), medium);
    assert_eq!(container.new_entry(16).unwrap(), small);
    assert_eq!(container.new_entry(1000).unwrap(), large);
    assert!(container.unclaimed_entries().is_empty());
}

#[test]
fn test_free_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("free.pak");

    let (kept, released) = {
        let mut container = SlottedContainer::open_with(&path, config()).unwrap();
        let kept = container.new_entry(64).unwrap();
        let released = container.new_entry(64).unwrap();
        container.write_entry_bytes(kept, b"kept", 0).unwrap();
        container.release_entry(released).unwrap();
        container.close().unwrap();
        (kept, released)
    };

    let mut container = SlottedContainer::open_with(&path, config()).unwrap();
    assert!(container.unclaimed_entries().contains(&released));
    assert_eq!(container.entries(), vec![kept]);

    // The reloaded free slot feeds the allocator
    assert_eq!(container.new_entry(48).unwrap(), released);
}

#[test]
fn test_guards_after_flush() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("guards.pak");

    let mut container = SlottedContainer::open_with(&path, config()).unwrap();
    let mut slots = Vec::new();
    for size in [1u64, 33, 500, 4096, 17] {
        slots.push(container.new_entry(size).unwrap());
    }
    container.release_entry(slots[2]).unwrap();
    container.flush().unwrap();

    let states: Vec<(u32, SlotState)> = (1..container.slot_count() as u32)
        .filter_map(|i| container.slot_state(i).map(|s| (i, *s)))
        .collect();

    for (index, state) in states {
        let Some(region) = state.region() else {
            continue;
        };
        assert_eq!(region.capacity % 16, 0, "slot {} capacity", index);
        assert!(region.offset >= MIN_DATA_OFFSET);

        let expected = state.guard_word().unwrap();
        assert_eq!(read_guard(&path, region.offset - 8), expected, "leading guard of {}", index);
        assert_eq!(
            read_guard(&path, region.offset + region.capacity),
            expected,
            "trailing guard of {}",
            index
        );
        if state.is_free() {
            assert!(expected < 0);
        }
    }
}

#[test]
fn test_write_view_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("views.pak");

    let slot = {
        let mut container = SlottedContainer::open_with(&path, config()).unwrap();
        let slot = container.new_entry(4096).unwrap();
        let mut writer = container.write_entry(slot).unwrap();
        for chunk in 0..16u8 {
            writer.write_all(&[chunk; 100]).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 1600);
        container.close().unwrap();
        slot
    };

    let container = SlottedContainer::open_with(&path, config()).unwrap();
    let mut reader = container.read_entry(slot).unwrap();
    assert_eq!(reader.len(), 1600);

    reader.seek(SeekFrom::Start(1550)).unwrap();
    let mut tail = Vec::new();
    reader.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, vec![15u8; 50]);
}

#[test]
fn test_rewrite_shrinks_size() {
    let dir = TempDir::new().unwrap();
    let mut container = SlottedContainer::open_with(dir.path().join("shrink.pak"), config()).unwrap();
    let slot = container.new_entry(64).unwrap();

    container.write_entry_bytes(slot, &[1u8; 64], 0).unwrap();
    {
        let mut writer = container.write_entry(slot).unwrap();
        writer.write_all(b"short").unwrap();
    }
    assert_eq!(container.read_entry_bytes(slot).unwrap(), b"short");
}

#[test]
fn test_stream_append_sizes_slot() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stream.pak");

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let slot = {
        let mut container = SlottedContainer::open_with(&path, config()).unwrap();
        let slot = container
            .write_new_entry(|w| {
                for chunk in payload.chunks(7_000) {
                    w.write_all(chunk)?;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(container.entry_size(slot).unwrap(), payload.len() as u64);
        assert_eq!(container.entry_capacity(slot).unwrap(), 200_000);
        container.close().unwrap();
        slot
    };

    let container = SlottedContainer::open_with(&path, config()).unwrap();
    assert_eq!(container.read_entry_bytes(slot).unwrap(), payload);
}

#[test]
fn test_second_append_while_one_is_stuck() {
    let dir = TempDir::new().unwrap();
    let mut container = SlottedContainer::open_with(dir.path().join("inflight.pak"), config()).unwrap();

    let crashed = catch_unwind(AssertUnwindSafe(|| {
        let _ = container.write_new_entry(|_w| -> io::Result<()> { panic!("producer crashed") });
    }));
    assert!(crashed.is_err());

    let err = container.write_new_entry(|w| w.write_all(b"x")).unwrap_err();
    assert!(matches!(err, PakError::AppendInFlight));
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[test]
fn test_invalid_slot_rejected_before_io() {
    let dir = TempDir::new().unwrap();
    let mut container = SlottedContainer::open_with(dir.path().join("invalid.pak"), config()).unwrap();
    let live = container.new_entry(16).unwrap();
    let recycled = container.new_entry(16).unwrap();
    container.release_entry(recycled).unwrap();
    container.flush().unwrap();
    let table = container.table_slot().unwrap();

    for index in [0, table, 10_000] {
        let err = container.read_entry_bytes(index).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSlot, "index {}", index);
        assert_eq!(
            container.write_entry_bytes(index, b"x", 0).unwrap_err().kind(),
            ErrorKind::InvalidSlot
        );
        assert!(container.entry_capacity(index).is_err());
    }

    assert_eq!(
        container.read_entry(recycled).err().unwrap().kind(),
        ErrorKind::InvalidSlot
    );
    assert!(container.read_entry_bytes(live).is_ok());
}

#[test]
fn test_table_grows_past_minimum() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("table.pak");

    let mut slots = Vec::new();
    {
        let mut container = SlottedContainer::open_with(&path, config()).unwrap();
        for i in 0..120u32 {
            let slot = container.new_entry(16).unwrap();
            container.write_entry_bytes(slot, &i.to_le_bytes(), 0).unwrap();
            slots.push(slot);
            if i % 40 == 0 {
                container.flush().unwrap();
            }
        }
        container.close().unwrap();
    }

    let container = SlottedContainer::open_with(&path, config()).unwrap();
    let table = container.table_slot().unwrap();
    assert_eq!(container.header().index_count as usize, container.slot_count());
    assert!(!slots.contains(&table));
    for (i, slot) in slots.iter().enumerate() {
        assert_eq!(
            container.read_entry_bytes(*slot).unwrap(),
            (i as u32).to_le_bytes()
        );
    }
}

#[test]
fn test_idle_handle_closes_between_operations() {
    let dir = TempDir::new().unwrap();
    let config = ContainerConfig::default().with_idle_timeout(Some(Duration::from_millis(40)));
    let mut container = SlottedContainer::open_with(dir.path().join("idle.pak"), config).unwrap();

    let slot = container.new_entry(16).unwrap();
    container.write_entry_bytes(slot, b"idle", 0).unwrap();
    assert!(container.is_handle_open());

    std::thread::sleep(Duration::from_millis(400));
    assert!(!container.is_handle_open());

    // Reopened transparently
    assert_eq!(container.read_entry_bytes(slot).unwrap(), b"idle");
}

#[test]
fn test_stats() {
    let dir = TempDir::new().unwrap();
    let mut container = SlottedContainer::open_with(dir.path().join("stats.pak"), config()).unwrap();
    let a = container.new_entry(100).unwrap();
    let b = container.new_entry(16).unwrap();
    container.write_entry_bytes(a, &[0u8; 100], 0).unwrap();
    container.delete_entry(b).unwrap();

    let stats = container.stats();
    assert_eq!(stats.live_slots, 1);
    assert_eq!(stats.live_bytes, 100);
    assert_eq!(stats.free_slots, 1);
    assert_eq!(stats.deletable_slots, 1);
    assert_eq!(stats.free_bytes, 16);
}
