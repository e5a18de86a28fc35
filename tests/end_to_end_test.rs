use drainpipe::cleaner;
use drainpipe::config::DrainConfig;
use drainpipe::item::list_items;
use drainpipe::packer::{self, PackMode, Packer};
use drainpipe::remote::{Headers, RemoteStore};
use drainpipe::retry::Sleeper;
use drainpipe::transfer::{Transfer, TransferMode};
use drainpipe::DrainError;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Accepts everything and remembers where each upload came from.
#[derive(Default)]
struct AcceptingStore {
    uploaded: RefCell<Vec<(String, String, PathBuf)>>,
}

impl RemoteStore for AcceptingStore {
    fn create_item(&self, _item: &str, _manifest: &[u8], _headers: &Headers) -> Result<u16, DrainError> {
        Ok(201)
    }

    fn probe_item(&self, _item: &str) -> Result<u16, DrainError> {
        Ok(200)
    }

    fn upload(&self, item: &str, filename: &str, path: &Path, _headers: &Headers) -> Result<u16, DrainError> {
        self.uploaded
            .borrow_mut()
            .push((item.to_string(), filename.to_string(), path.to_path_buf()));
        Ok(200)
    }
}

struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) {}
}

fn write_segment(job_dir: &Path, timestamp: &str, serial: usize, records: usize) {
    let name = format!("IA-{}-{:05}-{}~crawl7.example.org~8443.warc.gz", timestamp, serial, 4242);
    let mut enc = GzEncoder::new(fs::File::create(job_dir.join(name)).unwrap(), Compression::none());
    for r in 0..records {
        enc.write_all(format!("WARC/1.0\r\nWARC-Record-ID: {}-{}\r\n\r\n", serial, r).as_bytes())
            .unwrap();
    }
    enc.finish().unwrap();
}

/// Pack with compact names, upload everything, then clean the local copies.
#[test]
fn test_pack_transfer_clean() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("job")).unwrap();
    fs::create_dir(dir.path().join("xfer")).unwrap();
    let yaml = r#"
crawljob: ia00007
job_dir: job
xfer_dir: xfer
max_size: 4k
WARC_naming: 2
compact_names: 1
description: "CRAWLHOST:CRAWLJOB from START_DATE to END_DATE."
collections: [web, ia00007]
"#;
    let config = DrainConfig::from_yaml_str(yaml, dir.path()).unwrap();
    println!("[test] config loaded, target {} bytes", config.max_size_bytes().unwrap());

    for serial in 0..6 {
        write_segment(&config.job_dir, "20240301093000123", serial, 20);
    }
    packer::set_finish_drain(&config, true).unwrap();

    let pack = Packer::new(&config, PackMode::Multi).unwrap().run().unwrap();
    println!("[test] packed {} files into {} items", pack.files_packed, pack.items.len());
    assert_eq!(pack.files_packed, 6);
    assert!(!pack.items.is_empty());
    assert!(pack.quarantined.is_empty());

    let items = list_items(&config.xfer_dir).unwrap();
    assert_eq!(items.len(), pack.items.len());
    for item in &items {
        assert!(item.name().starts_with("IA-20240301093000"), "{}", item.name());
        assert!(item.name().ends_with("-crawl7"), "{}", item.name());
        for entry in item.manifest_entries().unwrap() {
            assert!(entry.filename.starts_with("IA-20240301093000-"), "{}", entry.filename);
            assert!(entry.filename.ends_with(".warc.gz"));
        }
    }

    let store = AcceptingStore::default();
    let transfer = Transfer::new(&config, &store, &NoSleep)
        .unwrap()
        .run(TransferMode::All)
        .unwrap();
    println!("[test] transfer completed {} items", transfer.completed.len());
    assert_eq!(transfer.completed.len(), items.len());
    assert_eq!(transfer.files_uploaded, 6);
    assert_eq!(store.uploaded.borrow().len(), 6);

    let clean = cleaner::run(&config.xfer_dir).unwrap();
    println!("[test] cleaned {} items, removed {} files", clean.items_cleaned, clean.files_removed);
    assert_eq!(clean.items_cleaned, items.len());
    assert_eq!(clean.files_removed, 6);

    for item in &items {
        let status = item.status();
        assert_eq!(status.state, "completed");
        assert_eq!(status.tombstone_count, status.total_file_count);
        for entry in item.manifest_entries().unwrap() {
            assert!(!item.has_file(&entry.filename));
        }
    }

    let again = Transfer::new(&config, &store, &NoSleep)
        .unwrap()
        .run(TransferMode::All)
        .unwrap();
    assert_eq!(again.launched, 0);
    assert_eq!(store.uploaded.borrow().len(), 6);
}
