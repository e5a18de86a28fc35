//! Packing stage: bundle segment files from the job directory into item
//! directories under the transfer directory.
//!
//! One run holds the job directory's pack lock, finishes any item a crashed
//! run left without PACKED, then fills new items in sorted filename order.

use crate::config::{CollisionPolicy, DrainConfig};
use crate::item::{list_items, Item, ManifestEntry, PackedInfo, MANIFEST};
use crate::lock::SelfHealingLock;
use crate::marker::OpenMode;
use crate::naming::{self, FilenamePattern};
use crate::DrainError;
use flate2::read::MultiGzDecoder;
use md5::{Digest, Md5};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufReader, ErrorKind};
use std::path::{Path, PathBuf};

const MAX_SUFFIX_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackMode {
    /// One item per run.
    Single,
    /// Keep packing while enough input remains.
    Multi,
}

/// Decision for the next candidate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    Take,
    /// Nothing accumulated yet and the file alone exceeds the target.
    TakeOversize,
    Stop,
}

pub fn fit(batch_size: u64, batch_len: usize, file_size: u64, target: u64) -> Fit {
    if batch_size + file_size <= target {
        Fit::Take
    } else if batch_len == 0 {
        Fit::TakeOversize
    } else {
        Fit::Stop
    }
}

/// Number of leading files that make up the next item.
pub fn select_batch(sizes: &[u64], target: u64) -> usize {
    let mut total = 0;
    let mut taken = 0;
    for &size in sizes {
        match fit(total, taken, size, target) {
            Fit::Take => {
                total += size;
                taken += 1;
            }
            Fit::TakeOversize => return 1,
            Fit::Stop => break,
        }
    }
    taken
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    verified: bool,
}

/// Segment files waiting in the job directory.
pub fn list_candidates(job_dir: &Path, pattern: &FilenamePattern) -> Result<Vec<Candidate>, DrainError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(job_dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if pattern.matches(&name) {
            out.push(Candidate {
                path: entry.path(),
                name,
                size: meta.len(),
                verified: false,
            });
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Decode the whole gzip stream. `Ok(false)` means the container is damaged.
pub fn verify_gzip(path: &Path) -> Result<bool, DrainError> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    match io::copy(&mut decoder, &mut io::sink()) {
        Ok(_) => Ok(true),
        Err(e) => {
            tracing::debug!(path = %path.display(), "gzip check failed: {}", e);
            Ok(false)
        }
    }
}

/// Move a poison file aside as `<name>.bad`. It no longer matches the
/// segment pattern, so no later run picks it up.
pub fn quarantine(path: &Path) -> Result<PathBuf, DrainError> {
    let mut bad = path.as_os_str().to_owned();
    bad.push(".bad");
    let bad = PathBuf::from(bad);
    fs::rename(path, &bad)?;
    Ok(bad)
}

/// Hex MD5 of a file's content.
pub fn checksum_file(path: &Path) -> Result<String, DrainError> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn finish_drain_enabled(config: &DrainConfig) -> bool {
    config.finish_drain_path().is_file()
}

/// Create or remove the FINISH_DRAIN sentinel.
pub fn set_finish_drain(config: &DrainConfig, on: bool) -> Result<(), DrainError> {
    let path = config.finish_drain_path();
    if on {
        fs::write(&path, "")?;
    } else {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(DrainError::Io(e)),
        }
    }
    tracing::info!(path = %path.display(), on, "finish-drain toggled");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub job_dir: PathBuf,
    pub count: usize,
    pub total_size: u64,
    pub target_size: u64,
    pub finish_drain: bool,
    pub drainme: bool,
}

pub fn source_summary(config: &DrainConfig) -> Result<SourceSummary, DrainError> {
    let pattern = config.filename_pattern()?;
    let candidates = list_candidates(&config.job_dir, &pattern)?;
    Ok(SourceSummary {
        job_dir: config.job_dir.clone(),
        count: candidates.len(),
        total_size: candidates.iter().map(|c| c.size).sum(),
        target_size: config.max_size_bytes()?,
        finish_drain: finish_drain_enabled(config),
        drainme: config.drainme_path().is_file(),
    })
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PackReport {
    /// Another live process held the pack lock; nothing was done.
    pub locked: bool,
    pub finish_drain: bool,
    pub candidates: usize,
    pub candidate_bytes: u64,
    pub gz_ok: usize,
    pub quarantined: Vec<String>,
    pub resumed: Vec<String>,
    pub items: Vec<PackedInfo>,
    pub files_packed: usize,
}

pub struct Packer<'a> {
    config: &'a DrainConfig,
    mode: PackMode,
    pattern: FilenamePattern,
    upload_pattern: FilenamePattern,
    template: String,
    target: u64,
}

impl<'a> Packer<'a> {
    pub fn new(config: &'a DrainConfig, mode: PackMode) -> Result<Self, DrainError> {
        let pattern = config.filename_pattern()?;
        let template = config.item_template();
        pattern.validate_template(&template)?;
        Ok(Self {
            config,
            mode,
            upload_pattern: config.upload_filename_pattern()?,
            pattern,
            template,
            target: config.max_size_bytes()?,
        })
    }

    pub fn run(&self) -> Result<PackReport, DrainError> {
        let lock = SelfHealingLock::new(self.config.pack_lock_path());
        let Some(_guard) = lock.try_acquire()? else {
            tracing::info!("pack lock held elsewhere, exiting normally");
            return Ok(PackReport {
                locked: true,
                ..PackReport::default()
            });
        };

        let mut report = PackReport {
            resumed: self.resume_half_packed()?,
            finish_drain: finish_drain_enabled(self.config),
            ..PackReport::default()
        };

        let mut queue: VecDeque<Candidate> =
            list_candidates(&self.config.job_dir, &self.pattern)?.into();
        let mut remaining: u64 = queue.iter().map(|c| c.size).sum();
        report.candidates = queue.len();
        report.candidate_bytes = remaining;
        tracing::info!(
            files = report.candidates,
            bytes = remaining,
            target = self.target,
            finish_drain = report.finish_drain,
            "scanning job directory"
        );

        loop {
            if !report.finish_drain && remaining < self.target {
                tracing::info!("too few segment files and no FINISH_DRAIN, exiting normally");
                break;
            }

            let mut batch: Vec<Candidate> = Vec::new();
            let mut batch_size = 0;
            while let Some(front) = queue.front_mut() {
                if !front.verified && !self.passes_gate(front, &mut report)? {
                    remaining -= front.size;
                    queue.pop_front();
                    continue;
                }
                front.verified = true;

                match fit(batch_size, batch.len(), front.size, self.target) {
                    Fit::Take => {}
                    Fit::TakeOversize => {
                        tracing::warn!(file = %front.name, size = front.size, "file alone exceeds target");
                    }
                    Fit::Stop => break,
                }
                let taken = queue.pop_front().ok_or("candidate queue drained")?;
                let oversize = taken.size > self.target;
                batch_size += taken.size;
                batch.push(taken);
                if oversize {
                    break;
                }
            }

            if batch.is_empty() {
                break;
            }
            if queue.is_empty() && !report.finish_drain && batch_size < self.target {
                tracing::info!(files = batch.len(), bytes = batch_size, "remainder below target, leaving for a later run");
                break;
            }

            remaining -= batch_size;
            report.files_packed += batch.len();
            let info = self.pack_item(&batch)?;
            report.items.push(info);

            if self.mode == PackMode::Single {
                tracing::info!("mode = single, exiting normally");
                break;
            }
        }

        tracing::info!(
            candidates = report.candidates,
            gz_ok = report.gz_ok,
            quarantined = report.quarantined.len(),
            packed = report.files_packed,
            items = report.items.len(),
            "pack done"
        );
        Ok(report)
    }

    fn passes_gate(&self, candidate: &Candidate, report: &mut PackReport) -> Result<bool, DrainError> {
        let gzipped = self
            .pattern
            .parse(&candidate.name)
            .map(|f| f.get("gz").map(|g| !g.is_empty()).unwrap_or(false))
            .unwrap_or(false);
        if !gzipped || !self.config.verify_gzip.is_on() {
            return Ok(true);
        }
        tracing::debug!(file = %candidate.name, "verifying gz");
        if verify_gzip(&candidate.path)? {
            report.gz_ok += 1;
            return Ok(true);
        }
        let bad = quarantine(&candidate.path)?;
        tracing::error!(file = %candidate.name, moved_to = %bad.display(), "bad gzip, file set aside");
        report.quarantined.push(candidate.name.clone());
        Ok(false)
    }

    fn pack_item(&self, batch: &[Candidate]) -> Result<PackedInfo, DrainError> {
        let (first, last) = match (batch.first(), batch.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(DrainError::Other("empty batch".to_string())),
        };
        let first_fields = self.pattern.parse_or_err(&first.name)?;
        let last_fields = self.pattern.parse_or_err(&last.name)?;
        let item = self.claim_item(&first_fields, &last_fields)?;

        for (i, c) in batch.iter().enumerate() {
            tracing::info!("[{:5}] {}", i + 1, c.path.display());
        }

        let mut manifest = item.manifest().open(OpenMode::Truncate)?;
        let mut total_size = 0;
        for c in batch {
            let item_name = if self.config.compact_names.is_on() {
                naming::compact_name(&self.pattern.parse_or_err(&c.name)?)?
            } else {
                c.name.clone()
            };
            let dest = item.file_path(&item_name);
            if dest.exists() {
                return Err(DrainError::Integrity(format!(
                    "{} already holds {}",
                    item.name(),
                    item_name
                )));
            }
            tracing::debug!("mv {} {}", c.path.display(), dest.display());
            fs::rename(&c.path, &dest)?;
            let entry = ManifestEntry {
                checksum: checksum_file(&dest)?,
                filename: item_name,
            };
            manifest.write(&entry.to_string())?;
            total_size += c.size;
        }
        manifest.close()?;

        let info = PackedInfo {
            item_id: item.name().to_string(),
            num_files: batch.len() as u64,
            total_size,
        };
        item.packed().write(&info.to_string())?;
        tracing::info!(item = %item.name(), files = info.num_files, bytes = info.total_size, "PACKED");
        Ok(info)
    }

    /// Create the item directory. `create_dir` is the claim: it fails if
    /// the name is taken.
    fn claim_item(
        &self,
        first: &naming::Fields,
        last: &naming::Fields,
    ) -> Result<Item, DrainError> {
        let policy = self.config.collision_policy();
        let mut attempt = 0;
        loop {
            let suffix = if attempt == 0 {
                String::new()
            } else {
                format!("-{}", attempt)
            };
            let name = naming::item_name(&self.template, first, last, &suffix)?;
            let item = Item::new(&self.config.xfer_dir, &name);
            match fs::create_dir(item.path()) {
                Ok(()) => return Ok(item),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if policy == CollisionPolicy::Abort || attempt >= MAX_SUFFIX_ATTEMPTS {
                        tracing::error!(item = %name, "item name conflict, aborting");
                        return Err(DrainError::ItemExists(name));
                    }
                    tracing::warn!(item = %name, "item name conflict, adding suffix to resolve");
                    attempt += 1;
                }
                Err(e) => return Err(DrainError::Io(e)),
            }
        }
    }

    /// Finish items a crashed run left without PACKED: rebuild MANIFEST
    /// from the files actually present, then write PACKED.
    fn resume_half_packed(&self) -> Result<Vec<String>, DrainError> {
        let mut resumed = Vec::new();
        for item in list_items(&self.config.xfer_dir)? {
            if item.packed().exists() {
                continue;
            }
            let mut files: Vec<(String, u64)> = Vec::new();
            let mut others = 0;
            for entry in fs::read_dir(item.path())? {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    others += 1;
                    continue;
                };
                if entry.file_type()?.is_file() && self.upload_pattern.matches(&name) {
                    files.push((name, entry.metadata()?.len()));
                } else if name != MANIFEST && name != format!("{}.open", MANIFEST) {
                    others += 1;
                }
            }

            if files.is_empty() {
                if others == 0 {
                    tracing::warn!(item = %item.name(), "removing empty half-packed item");
                    fs::remove_dir_all(item.path())?;
                } else {
                    tracing::warn!(item = %item.name(), "item has no PACKED and no segment files, leaving it alone");
                }
                continue;
            }

            files.sort();
            let mut body = String::new();
            for (name, _) in &files {
                let entry = ManifestEntry {
                    checksum: checksum_file(&item.file_path(name))?,
                    filename: name.clone(),
                };
                body.push_str(&entry.to_string());
            }
            let manifest = item.manifest();
            manifest.write(&body)?;
            if manifest.is_open() {
                fs::remove_file(manifest.open_path())?;
            }
            let info = PackedInfo {
                item_id: item.name().to_string(),
                num_files: files.len() as u64,
                total_size: files.iter().map(|(_, size)| size).sum(),
            };
            item.packed().write(&info.to_string())?;
            tracing::warn!(item = %item.name(), files = info.num_files, "resumed half-packed item");
            resumed.push(item.name().to_string());
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_select_batch() {
        assert_eq!(select_batch(&[3, 3, 3, 3], 10), 3);
        assert_eq!(select_batch(&[10, 1], 10), 1);
        assert_eq!(select_batch(&[25, 1], 10), 1);
        assert_eq!(select_batch(&[1, 25], 10), 1);
        assert_eq!(select_batch(&[], 10), 0);
    }

    /// Every closed batch either has a single oversize member or could not
    /// take the next file.
    #[test]
    fn test_select_batch_never_underfills() {
        let sequences: Vec<Vec<u64>> = vec![
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9],
            vec![9, 9, 9, 1, 1, 1],
            vec![15, 2, 2, 15, 3],
            vec![5; 20],
        ];
        for sizes in sequences {
            let target = 10;
            let mut rest = &sizes[..];
            while !rest.is_empty() {
                let n = select_batch(rest, target);
                assert!(n > 0);
                let total: u64 = rest[..n].iter().sum();
                if n < rest.len() {
                    let single_oversize = n == 1 && total > target;
                    assert!(single_oversize || total + rest[n] > target, "{:?}", sizes);
                }
                rest = &rest[n..];
            }
        }
    }

    #[test]
    fn test_verify_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.warc.gz");
        let mut enc = GzEncoder::new(File::create(&good).unwrap(), Compression::default());
        enc.write_all(b"WARC/1.0\r\n").unwrap();
        enc.finish().unwrap();
        assert!(verify_gzip(&good).unwrap());

        let bad = dir.path().join("bad.warc.gz");
        fs::write(&bad, b"not gzip at all").unwrap();
        assert!(!verify_gzip(&bad).unwrap());

        let empty = dir.path().join("empty.warc.gz");
        fs::write(&empty, b"").unwrap();
        assert!(!verify_gzip(&empty).unwrap());
    }

    #[test]
    fn test_checksum_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        fs::write(&path, b"").unwrap();
        assert_eq!(checksum_file(&path).unwrap(), "d41d8cd98f00b204e9800998ecf8427e");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(checksum_file(&path).unwrap(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.warc.gz");
        fs::write(&path, b"x").unwrap();
        let bad = quarantine(&path).unwrap();
        assert_eq!(bad, dir.path().join("a.warc.gz.bad"));
        assert!(!path.exists());
    }
}
