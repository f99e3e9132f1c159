#![no_main]
use libfuzzer_sys::fuzz_target;
use pakstore_rs::{Config, ContentArchive, SlottedContainer};

// Arbitrary file contents must be rejected with an error, never a panic
fuzz_target!(|data: &[u8]| {
    let dir = match tempfile::TempDir::new() {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let path = dir.path().join("fuzz.pak");
    if std::fs::write(&path, data).is_err() {
        return;
    }

    let mut config = Config::default();
    config.container.idle_timeout_ms = 0;

    if let Ok(mut container) = SlottedContainer::open_with(&path, config.container.clone()) {
        let _ = container.validate_file();
        for slot in container.entries() {
            let _ = container.read_entry_bytes(slot);
        }
        if let Ok(archive) = ContentArchive::from_container(container, config.archive.clone()) {
            for hash in archive.hashes() {
                let _ = archive.get_data(&hash);
            }
        }
    }
});
