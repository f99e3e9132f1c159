#![no_main]
use libfuzzer_sys::{fuzz_target, arbitrary::{Arbitrary, Unstructured}};
use pakstore_rs::{Config, ContentArchive, ContentHash};
use std::collections::HashMap;

#[derive(Debug, Arbitrary)]
enum ArchiveOp {
    Write { key: u8, data: Vec<u8>, overwrite: bool },
    Delete { key: u8 },
    Rekey { from: u8, to: u8 },
    Flush,
}

fn key(n: u8) -> ContentHash {
    ContentHash::new([n; 20])
}

// Every operation sequence must leave the archive readable after reopen
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<ArchiveOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let dir = match tempfile::TempDir::new() {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let path = dir.path().join("ops.pak");
    let mut config = Config::default();
    config.container.idle_timeout_ms = 0;
    config.archive.header_table_min_records = 4;

    let mut model: HashMap<u8, Vec<u8>> = HashMap::new();
    {
        let mut archive = ContentArchive::open_with(&path, &config).unwrap();
        for op in ops {
            match op {
                ArchiveOp::Write { key: k, data, overwrite } => {
                    if archive.write_data(key(k), &data, overwrite).is_ok() {
                        model.insert(k, data);
                    }
                }
                ArchiveOp::Delete { key: k } => {
                    if archive.delete_data(&key(k)).is_ok() {
                        model.remove(&k);
                    }
                }
                ArchiveOp::Rekey { from, to } => {
                    if archive.replace_hash(&key(from), key(to)).is_ok() {
                        if let Some(data) = model.remove(&from) {
                            model.insert(to, data);
                        }
                    }
                }
                ArchiveOp::Flush => archive.flush().unwrap(),
            }
        }
        archive.close().unwrap();
    }

    let archive = ContentArchive::open_with(&path, &config).unwrap();
    assert_eq!(archive.len(), model.len());
    for (k, data) in &model {
        assert_eq!(&archive.get_data(&key(*k)).unwrap(), data);
    }
});
