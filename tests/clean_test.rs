use drainpipe::cleaner::{self, CleanOutcome};
use drainpipe::item::{Item, CLEAN_ERR};
use std::fs;
use std::path::Path;

const FILES: [&str; 3] = [
    "WIDE-20240101000000000-00000-crawl1.example.org.warc.gz",
    "WIDE-20240101000000000-00001-crawl1.example.org.warc.gz",
    "WIDE-20240101000000000-00002-crawl1.example.org.warc.gz",
];

/// Item with all three files on disk and listed in MANIFEST.
fn item_with_files(xfer_dir: &Path, name: &str) -> Item {
    let item = Item::new(xfer_dir, name);
    fs::create_dir(item.path()).unwrap();
    let mut manifest = String::new();
    for f in FILES {
        fs::write(item.file_path(f), f.as_bytes()).unwrap();
        manifest.push_str(&format!("0123456789abcdef0123456789abcdef {}\n", f));
    }
    item.manifest().write(&manifest).unwrap();
    item.packed().write(&format!("{} 3 165\n", name)).unwrap();
    item
}

fn finish(item: &Item, tombstoned: &[&str]) {
    for f in tombstoned {
        item.mark_uploaded(f, &format!("https://archive.org/download/{}/{}", item.name(), f))
            .unwrap();
    }
    item.success().write("2024-01-01 12:00:00\n").unwrap();
}

#[test]
fn test_all_tombstoned_files_removed() {
    let dir = tempfile::tempdir().unwrap();
    let item = item_with_files(dir.path(), "ITEM-A");
    finish(&item, &FILES);

    assert_eq!(
        cleaner::clean_item(&item),
        CleanOutcome::Cleaned { removed: 3, missing: 0 }
    );
    for f in FILES {
        assert!(!item.has_file(f));
    }
    assert!(item.clean().exists());
    assert!(!item.clean().is_open());
    assert!(!item.path().join(CLEAN_ERR).exists());
}

/// Three uploaded files, one already deleted by hand: two removed, one
/// counted as missing, tombstones kept.
#[test]
fn test_three_file_item_is_cleaned() {
    let dir = tempfile::tempdir().unwrap();
    let item = item_with_files(dir.path(), "ITEM-A");
    finish(&item, &FILES);
    fs::remove_file(item.file_path(FILES[2])).unwrap();

    let report = cleaner::run(dir.path()).unwrap();

    assert_eq!(report.items_cleaned, 1);
    assert_eq!(report.files_removed, 2);
    assert_eq!(report.files_missing, 1);
    for f in FILES {
        assert!(!item.has_file(f), "{} should be gone", f);
        assert!(item.is_tombstoned(f));
    }
    assert!(item.clean().exists());
    let journal = item.clean().read().unwrap();
    assert!(journal.contains("2 removed, 1 already gone"), "{}", journal);

    let again = cleaner::run(dir.path()).unwrap();
    assert_eq!(again.items_cleaned, 0);
    assert_eq!(again.items_inactive, 1);
}

#[test]
fn test_mixed_transfer_directory() {
    let dir = tempfile::tempdir().unwrap();
    let done = item_with_files(dir.path(), "ITEM-A");
    finish(&done, &FILES);
    let pending = item_with_files(dir.path(), "ITEM-B");
    let partial = item_with_files(dir.path(), "ITEM-C");
    finish(&partial, &FILES[..2]);

    let report = cleaner::run(dir.path()).unwrap();

    assert_eq!(report.items_cleaned, 1);
    assert_eq!(report.items_active, 1);
    assert_eq!(report.items_error, 1);
    assert_eq!(report.files_removed, 3);

    for f in FILES {
        assert!(pending.has_file(f));
        assert!(partial.has_file(f));
    }
    assert!(partial.path().join(CLEAN_ERR).is_file());
    let parked = fs::read_to_string(partial.path().join(CLEAN_ERR)).unwrap();
    assert!(parked.contains(FILES[2]), "{}", parked);
    assert_eq!(cleaner::clean_item(&partial), CleanOutcome::Inactive);
}
