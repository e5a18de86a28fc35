use crate::item::{list_items, Item, CLEAN_ERR};
use crate::lock::ManualLock;
use crate::marker::MarkerWriter;
use crate::DrainError;
use itertools::Itertools;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

#[derive(Debug, Default, Clone, Serialize)]
pub struct CleanReport {
    pub items_cleaned: usize,
    /// Already cleaned on an earlier run.
    pub items_inactive: usize,
    /// No SUCCESS yet.
    pub items_active: usize,
    pub items_error: usize,
    pub items_locked: usize,
    pub files_removed: usize,
    pub files_missing: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanOutcome {
    Active,
    Inactive,
    Locked,
    Cleaned { removed: usize, missing: usize },
    Error,
}

pub fn run(xfer_dir: &Path) -> Result<CleanReport, DrainError> {
    let mut report = CleanReport::default();
    for item in list_items(xfer_dir)? {
        match clean_item(&item) {
            CleanOutcome::Active => report.items_active += 1,
            CleanOutcome::Inactive => report.items_inactive += 1,
            CleanOutcome::Locked => report.items_locked += 1,
            CleanOutcome::Error => report.items_error += 1,
            CleanOutcome::Cleaned { removed, missing } => {
                report.items_cleaned += 1;
                report.files_removed += removed;
                report.files_missing += missing;
            }
        }
    }
    tracing::info!(
        cleaned = report.items_cleaned,
        inactive = report.items_inactive,
        active = report.items_active,
        error = report.items_error,
        locked = report.items_locked,
        removed = report.files_removed,
        "clean done"
    );
    Ok(report)
}

/// Remove the uploaded files of one finished item. Any problem parks the
/// journal as CLEAN.err for an operator and leaves the files in place.
pub fn clean_item(item: &Item) -> CleanOutcome {
    if !item.success().exists() {
        tracing::debug!(item = %item, "no SUCCESS yet");
        return CleanOutcome::Active;
    }
    if item.path().join(CLEAN_ERR).is_file() {
        tracing::info!(item = %item, "has CLEAN.err");
        return CleanOutcome::Inactive;
    }
    if item.clean().exists() {
        return CleanOutcome::Inactive;
    }

    let mut journal = match ManualLock::new(item.clean()).try_acquire() {
        Ok(Some(journal)) => journal,
        Ok(None) => {
            tracing::info!(item = %item, "has CLEAN.open");
            return CleanOutcome::Locked;
        }
        Err(e) => {
            tracing::error!(item = %item, "cannot open CLEAN: {}", e);
            return CleanOutcome::Error;
        }
    };

    match remove_uploaded(item, &mut journal) {
        Ok((removed, missing)) => match journal.close() {
            Ok(()) => CleanOutcome::Cleaned { removed, missing },
            Err(e) => {
                tracing::error!(item = %item, "cannot close CLEAN: {}", e);
                CleanOutcome::Error
            }
        },
        Err(e) => {
            journal.error(&e.to_string());
            if let Err(park) = journal.fail("err") {
                tracing::error!(item = %item, "cannot write CLEAN.err: {}", park);
            }
            CleanOutcome::Error
        }
    }
}

fn remove_uploaded(item: &Item, journal: &mut MarkerWriter) -> Result<(usize, usize), DrainError> {
    let entries = item.manifest_entries()?;
    if entries.is_empty() {
        journal.warn("no uploaded files in this item");
        return Ok((0, 0));
    }

    let missed: Vec<&str> = entries
        .iter()
        .filter(|e| !item.is_tombstoned(&e.filename))
        .map(|e| e.filename.as_str())
        .collect();
    if !missed.is_empty() {
        for name in &missed {
            journal.warn(&format!("{}: listed in MANIFEST, but no .tombstone exists", name));
        }
        return Err(DrainError::Integrity(format!(
            "{} file(s) not uploaded while SUCCESS exists: {}",
            missed.len(),
            missed.iter().join(", ")
        )));
    }

    journal.info(&format!("cleaning {}", item.path().display()));
    let mut removed = 0;
    let mut missing = 0;
    for entry in &entries {
        let url = item.tombstone(&entry.filename).read()?;
        match fs::remove_file(item.file_path(&entry.filename)) {
            Ok(()) => {
                journal.info(&format!("removed {} uploaded to {}", entry.filename, url.trim()));
                removed += 1;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                journal.info(&format!("{} already removed", entry.filename));
                missing += 1;
            }
            Err(e) => {
                return Err(DrainError::Io(e));
            }
        }
    }
    journal.info(&format!("{} removed, {} already gone", removed, missing));
    Ok((removed, missing))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished_item(dir: &Path, files: &[&str], tombstoned: &[&str]) -> Item {
        fs::create_dir_all(dir.join("ITEM")).unwrap();
        let item = Item::new(dir, "ITEM");
        let mut manifest = String::new();
        for f in files {
            fs::write(item.file_path(f), b"data").unwrap();
            manifest.push_str(&format!("8d777f385d3dfec8815d20f7496026dc {}\n", f));
        }
        item.manifest().write(&manifest).unwrap();
        for f in tombstoned {
            item.mark_uploaded(f, &format!("https://example.org/download/ITEM/{}", f))
                .unwrap();
        }
        item.success().write("done\n").unwrap();
        item
    }

    #[test]
    fn test_clean_removes_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let item = finished_item(dir.path(), &["a.warc.gz", "b.warc.gz"], &["a.warc.gz", "b.warc.gz"]);
        fs::remove_file(item.file_path("b.warc.gz")).unwrap();

        assert_eq!(clean_item(&item), CleanOutcome::Cleaned { removed: 1, missing: 1 });
        assert!(item.clean().exists());
        assert!(!item.clean().is_open());
        assert_eq!(clean_item(&item), CleanOutcome::Inactive);
    }

    #[test]
    fn test_missing_tombstone_marks_error() {
        let dir = tempfile::tempdir().unwrap();
        let item = finished_item(dir.path(), &["a.warc.gz", "b.warc.gz"], &["a.warc.gz"]);

        assert_eq!(clean_item(&item), CleanOutcome::Error);
        assert!(item.path().join(CLEAN_ERR).is_file());
        assert!(!item.clean().exists());
        assert!(!item.clean().is_open());
        assert!(item.file_path("a.warc.gz").exists(), "nothing deleted on mismatch");
        assert_eq!(clean_item(&item), CleanOutcome::Inactive);
    }

    #[test]
    fn test_active_and_locked_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let item = finished_item(dir.path(), &["a.warc.gz"], &["a.warc.gz"]);

        let _held = item.clean().open(crate::marker::OpenMode::Append).unwrap();
        assert_eq!(clean_item(&item), CleanOutcome::Locked);

        fs::remove_file(item.success().path()).unwrap();
        assert_eq!(clean_item(&item), CleanOutcome::Active);
    }
}
