use crate::marker::Marker;
use crate::DrainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const RETRY: &str = "RETRY";
pub const PACKED: &str = "PACKED";
pub const MANIFEST: &str = "MANIFEST";
pub const LAUNCH: &str = "LAUNCH";
pub const TASK: &str = "TASK";
pub const SUCCESS: &str = "SUCCESS";
pub const ERROR: &str = "ERROR";
pub const BUCKET_OK: &str = "BUCKET_OK";
pub const CLEAN: &str = "CLEAN";
pub const CLEAN_ERR: &str = "CLEAN.err";
pub const TOMBSTONE_SUFFIX: &str = ".tombstone";

pub fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One line of MANIFEST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub checksum: String,
    pub filename: String,
}

impl ManifestEntry {
    pub fn parse_line(line: &str) -> Option<Self> {
        let (checksum, filename) = line.trim_end().split_once(' ')?;
        if checksum.is_empty() || filename.is_empty() {
            return None;
        }
        Some(Self {
            checksum: checksum.to_string(),
            filename: filename.to_string(),
        })
    }
}

impl fmt::Display for ManifestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.checksum, self.filename)
    }
}

/// Body of PACKED: `<item-id> <file-count> <total-size>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedInfo {
    #[serde(rename = "iid")]
    pub item_id: String,
    pub num_files: u64,
    pub total_size: u64,
}

impl PackedInfo {
    /// Accepts the space separated form and the older JSON form.
    pub fn parse(text: &str) -> Result<Self, DrainError> {
        let text = text.trim();
        if text.starts_with('{') {
            return Ok(serde_json::from_str(text)?);
        }
        let parts: Vec<&str> = text.split(' ').collect();
        let bad = || DrainError::Integrity(format!("malformed PACKED: {:?}", text));
        if parts.len() != 3 {
            return Err(bad());
        }
        Ok(Self {
            item_id: parts[0].to_string(),
            num_files: parts[1].parse().map_err(|_| bad())?,
            total_size: parts[2].parse().map_err(|_| bad())?,
        })
    }
}

impl fmt::Display for PackedInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {} {}", self.item_id, self.num_files, self.total_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerState {
    Absent,
    Open,
    Closed,
}

impl MarkerState {
    pub fn of(marker: &Marker) -> Self {
        if marker.exists() {
            MarkerState::Closed
        } else if marker.is_open() {
            MarkerState::Open
        } else {
            MarkerState::Absent
        }
    }
}

/// Snapshot of an item for dashboards and the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct ItemStatus {
    pub name: String,
    pub exists: bool,
    pub mtime: i64,
    pub state: String,
    pub packed: MarkerState,
    pub manifest: MarkerState,
    pub launch: MarkerState,
    pub task: MarkerState,
    pub success: bool,
    pub error: bool,
    pub bucket_ok: bool,
    pub clean: MarkerState,
    pub clean_error: bool,
    pub retry: Option<i64>,
    pub tombstone_count: usize,
    pub total_file_count: usize,
}

/// A bundle directory under the transfer directory. Nothing is cached:
/// every query goes back to the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    name: String,
    path: PathBuf,
}

impl Item {
    pub fn new(xfer_dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: xfer_dir.join(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    pub fn marker(&self, name: &str) -> Marker {
        Marker::new(&self.path, name)
    }

    pub fn retry(&self) -> Marker {
        self.marker(RETRY)
    }
    pub fn packed(&self) -> Marker {
        self.marker(PACKED)
    }
    pub fn manifest(&self) -> Marker {
        self.marker(MANIFEST)
    }
    pub fn launch(&self) -> Marker {
        self.marker(LAUNCH)
    }
    pub fn task(&self) -> Marker {
        self.marker(TASK)
    }
    pub fn success(&self) -> Marker {
        self.marker(SUCCESS)
    }
    pub fn error(&self) -> Marker {
        self.marker(ERROR)
    }
    pub fn bucket_ok(&self) -> Marker {
        self.marker(BUCKET_OK)
    }
    pub fn clean(&self) -> Marker {
        self.marker(CLEAN)
    }

    pub fn has_file(&self, filename: &str) -> bool {
        self.path.join(filename).is_file()
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.path.join(filename)
    }

    pub fn tombstone(&self, filename: &str) -> Marker {
        self.marker(&format!("{}{}", filename, TOMBSTONE_SUFFIX))
    }

    pub fn is_tombstoned(&self, filename: &str) -> bool {
        self.tombstone(filename).exists()
    }

    /// Record a confirmed upload. Only call after the store accepted the file.
    pub fn mark_uploaded(&self, filename: &str, download_url: &str) -> Result<(), DrainError> {
        self.tombstone(filename).write(&format!("{}\n", download_url))
    }

    pub fn manifest_entries(&self) -> Result<Vec<ManifestEntry>, DrainError> {
        let mut entries = Vec::new();
        for line in self.manifest().read_lines()? {
            if line.trim().is_empty() {
                continue;
            }
            let entry = ManifestEntry::parse_line(&line).ok_or_else(|| {
                DrainError::Integrity(format!("{}: malformed MANIFEST line {:?}", self.name, line))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn packed_info(&self) -> Result<PackedInfo, DrainError> {
        PackedInfo::parse(&self.packed().read()?)
    }

    /// Epoch seconds stored in RETRY.
    pub fn retry_time(&self) -> Result<i64, DrainError> {
        let text = self.retry().read()?;
        text.trim().parse::<i64>().map_err(|_| {
            DrainError::Integrity(format!("{}: RETRY holds {:?}", self.name, text.trim()))
        })
    }

    pub fn mtime(&self) -> i64 {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn count_entries(&self, pred: impl Fn(&str) -> bool) -> usize {
        fs::read_dir(&self.path)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_str().map(&pred).unwrap_or(false))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn tombstone_count(&self) -> usize {
        self.count_entries(|n| n.ends_with(TOMBSTONE_SUFFIX))
    }

    pub fn status(&self) -> ItemStatus {
        let retry = if self.retry().exists() {
            self.retry_time().ok()
        } else {
            None
        };
        let total_file_count = self
            .manifest_entries()
            .map(|e| e.len())
            .unwrap_or_else(|_| self.count_entries(is_segment_name));

        let success = self.success().exists();
        let error = self.error().exists();
        let state = if success {
            "completed"
        } else if error {
            "error"
        } else if retry.is_some() {
            "retry"
        } else if self.launch().is_open() || self.manifest().is_open() {
            "running"
        } else if self.packed().exists() {
            "packed"
        } else {
            "packing"
        };

        ItemStatus {
            name: self.name.clone(),
            exists: self.exists(),
            mtime: self.mtime(),
            state: state.to_string(),
            packed: MarkerState::of(&self.packed()),
            manifest: MarkerState::of(&self.manifest()),
            launch: MarkerState::of(&self.launch()),
            task: MarkerState::of(&self.task()),
            success,
            error,
            bucket_ok: self.bucket_ok().exists(),
            clean: MarkerState::of(&self.clean()),
            clean_error: self.path.join(CLEAN_ERR).is_file(),
            retry,
            tombstone_count: self.tombstone_count(),
            total_file_count,
        }
    }

    /// Make the item eligible on the next transfer pass. Any pending RETRY
    /// is kept as `RETRY.<old value>`.
    pub fn retry_asap(&self) -> Result<(), DrainError> {
        if self.success().exists() {
            return Err(DrainError::IllegalState(format!(
                "{}: completed series",
                self.name
            )));
        }
        let retry = self.retry();
        if retry.exists() {
            match retry.read() {
                Ok(old) if !old.trim().is_empty() => {
                    // the transfer stage may archive RETRY concurrently
                    if let Err(e) = retry.remove(Some(old.trim())) {
                        if !e.is_not_found() {
                            return Err(e);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        retry.write("0\n")
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

fn is_segment_name(name: &str) -> bool {
    [".warc.gz", ".warc", ".arc.gz", ".arc"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

/// Item directories under `xfer_dir`, sorted by name.
pub fn list_items(xfer_dir: &Path) -> Result<Vec<Item>, DrainError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(xfer_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names.iter().map(|n| Item::new(xfer_dir, n)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_in(dir: &Path, name: &str) -> Item {
        fs::create_dir_all(dir.join(name)).unwrap();
        Item::new(dir, name)
    }

    #[test]
    fn test_manifest_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let item = item_in(dir.path(), "ITEM-1");
        item.manifest()
            .write("d41d8cd98f00b204e9800998ecf8427e a.warc.gz\nabc b c.warc.gz\n")
            .unwrap();

        let entries = item.manifest_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].filename, "a.warc.gz");
        assert_eq!(entries[1].filename, "b c.warc.gz");
        assert_eq!(entries[0].to_string(), "d41d8cd98f00b204e9800998ecf8427e a.warc.gz\n");

        item.manifest().write("justonefield\n").unwrap();
        assert!(matches!(item.manifest_entries(), Err(DrainError::Integrity(_))));
    }

    #[test]
    fn test_packed_info_forms() {
        let info = PackedInfo::parse("ITEM-1 8 12345\n").unwrap();
        assert_eq!(info.item_id, "ITEM-1");
        assert_eq!(info.num_files, 8);
        assert_eq!(info.total_size, 12345);
        assert_eq!(info.to_string(), "ITEM-1 8 12345\n");

        let json = PackedInfo::parse(r#"{"iid": "ITEM-2", "num_files": 3, "total_size": 9}"#).unwrap();
        assert_eq!(json.item_id, "ITEM-2");

        assert!(PackedInfo::parse("ITEM-1 x 1").is_err());
    }

    #[test]
    fn test_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let item = item_in(dir.path(), "ITEM-1");
        assert!(!item.is_tombstoned("a.warc.gz"));

        item.mark_uploaded("a.warc.gz", "https://example.org/download/ITEM-1/a.warc.gz")
            .unwrap();
        assert!(item.is_tombstoned("a.warc.gz"));
        assert_eq!(item.tombstone_count(), 1);
        assert_eq!(
            item.tombstone("a.warc.gz").read().unwrap(),
            "https://example.org/download/ITEM-1/a.warc.gz\n"
        );
    }

    #[test]
    fn test_retry_asap() {
        let dir = tempfile::tempdir().unwrap();
        let item = item_in(dir.path(), "ITEM-1");
        item.retry().write("1900000000").unwrap();

        item.retry_asap().unwrap();
        assert_eq!(item.retry_time().unwrap(), 0);
        assert!(item.path().join("RETRY.1900000000").is_file());

        item.success().write("done").unwrap();
        assert!(matches!(item.retry_asap(), Err(DrainError::IllegalState(_))));
    }

    #[test]
    fn test_status_states() {
        let dir = tempfile::tempdir().unwrap();
        let item = item_in(dir.path(), "ITEM-1");
        assert_eq!(item.status().state, "packing");

        item.manifest().write("abc a.warc.gz\n").unwrap();
        item.packed().write("ITEM-1 1 10\n").unwrap();
        let status = item.status();
        assert_eq!(status.state, "packed");
        assert_eq!(status.packed, MarkerState::Closed);
        assert_eq!(status.total_file_count, 1);

        let _launch = item.launch().open(crate::marker::OpenMode::Append).unwrap();
        let status = item.status();
        assert_eq!(status.state, "running");
        assert_eq!(status.launch, MarkerState::Open);

        item.retry().write("42").unwrap();
        assert_eq!(item.status().retry, Some(42));
        assert_eq!(item.status().state, "retry");
    }

    #[test]
    fn test_list_items_sorted() {
        let dir = tempfile::tempdir().unwrap();
        item_in(dir.path(), "B");
        item_in(dir.path(), "A");
        fs::write(dir.path().join("not-an-item"), "x").unwrap();

        let names: Vec<String> = list_items(dir.path())
            .unwrap()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
    }
}
