use crate::config::DrainConfig;
use crate::item::{list_items, now_seconds, Item, ManifestEntry};
use crate::lock::ManualLock;
use crate::marker::MarkerWriter;
use crate::metadata::{derive_item_metadata, metadata_headers, SeriesProps};
use crate::naming::FilenamePattern;
use crate::remote::{Headers, RemoteStore};
use crate::retry::{BoundedRetry, DeferredRetry, RetryVerdict, Sleeper};
use crate::DrainError;
use serde::Serialize;
use std::cell::Cell;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Stop after the first item that gets launched.
    Single,
    All,
}

/// Result of one pass over one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "lowercase")]
pub enum ItemOutcome {
    Skipped(String),
    Completed,
    Deferred(i64),
    Failed(String),
    /// Could not be examined or locked. ERROR is written, nothing was launched.
    Rejected(String),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TransferReport {
    pub launched: usize,
    pub completed: Vec<String>,
    pub deferred: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: usize,
    pub files_uploaded: usize,
}

enum Launch {
    Completed,
    Deferred(i64),
}

pub struct Transfer<'a> {
    config: &'a DrainConfig,
    store: &'a dyn RemoteStore,
    sleeper: &'a dyn Sleeper,
    upload_pattern: FilenamePattern,
    uploaded: Cell<usize>,
}

impl<'a> Transfer<'a> {
    pub fn new(
        config: &'a DrainConfig,
        store: &'a dyn RemoteStore,
        sleeper: &'a dyn Sleeper,
    ) -> Result<Self, DrainError> {
        Ok(Self {
            config,
            store,
            sleeper,
            upload_pattern: config.upload_filename_pattern()?,
            uploaded: Cell::new(0),
        })
    }

    pub fn run(&self, mode: TransferMode) -> Result<TransferReport, DrainError> {
        let mut report = TransferReport::default();
        for item in list_items(&self.config.xfer_dir)? {
            let outcome = self.process_item(&item);
            match &outcome {
                ItemOutcome::Skipped(reason) => {
                    tracing::debug!(item = %item, "skipped: {}", reason);
                    report.skipped += 1;
                    continue;
                }
                ItemOutcome::Completed => report.completed.push(item.name().to_string()),
                ItemOutcome::Deferred(at) => {
                    tracing::info!(item = %item, retry_at = at, "aborting series");
                    report.deferred.push(item.name().to_string());
                }
                ItemOutcome::Failed(msg) => {
                    tracing::error!(item = %item, "transfer failed: {}", msg);
                    report.failed.push(item.name().to_string());
                }
                ItemOutcome::Rejected(msg) => {
                    tracing::error!(item = %item, "not launched: {}", msg);
                    report.failed.push(item.name().to_string());
                    continue;
                }
            }
            report.launched += 1;
            if mode == TransferMode::Single {
                tracing::info!("mode = single, exiting normally");
                break;
            }
        }
        report.files_uploaded = self.uploaded.get();
        tracing::info!(
            launched = report.launched,
            completed = report.completed.len(),
            deferred = report.deferred.len(),
            failed = report.failed.len(),
            "transfer done"
        );
        Ok(report)
    }

    /// Gate, lock and upload one item. Errors stay inside the item: they are
    /// written to ERROR and reported as `Failed`.
    pub fn process_item(&self, item: &Item) -> ItemOutcome {
        match self.gate(item) {
            Ok(None) => {}
            Ok(Some(reason)) => return ItemOutcome::Skipped(reason),
            Err(e) => return self.reject(item, e),
        }

        let mut journal = match ManualLock::new(item.launch()).try_acquire() {
            Ok(Some(journal)) => journal,
            Ok(None) => return ItemOutcome::Skipped("LAUNCH taken by another process".into()),
            Err(e) => return self.reject(item, e),
        };
        journal.info(&format!("=== {} ===", item.name()));

        match self.launch(item, &mut journal) {
            Ok(Launch::Completed) => {
                let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
                let done = item
                    .success()
                    .write(&format!("{}\n", stamp))
                    .and_then(|()| {
                        journal.info(&format!("SUCCESS: {}", item.name()));
                        journal.close()
                    });
                match done {
                    Ok(()) => ItemOutcome::Completed,
                    Err(e) => ItemOutcome::Failed(e.to_string()),
                }
            }
            Ok(Launch::Deferred(at)) => {
                journal.info(&format!("aborting series: {}, retry after {}", item.name(), at));
                match journal.close() {
                    Ok(()) => ItemOutcome::Deferred(at),
                    Err(e) => ItemOutcome::Failed(e.to_string()),
                }
            }
            Err(e) => {
                let msg = e.to_string();
                journal.error(&msg);
                journal.error("Aborting!");
                if let Err(mark) = item.error().write(&format!("{}\n", msg)) {
                    tracing::error!(item = %item, "failed to write ERROR: {}", mark);
                }
                if let Err(close) = journal.close() {
                    tracing::error!(item = %item, "failed to close LAUNCH: {}", close);
                }
                ItemOutcome::Failed(msg)
            }
        }
    }

    /// Mark an item that could not even be gated. A RETRY that does not
    /// hold a time is parked as `RETRY.bad` so the ERROR gate applies on
    /// later passes.
    fn reject(&self, item: &Item, e: DrainError) -> ItemOutcome {
        let msg = e.to_string();
        if item.retry().exists() && item.retry_time().is_err() {
            if let Err(park) = item.retry().remove(Some("bad")) {
                tracing::error!(item = %item, "failed to park RETRY: {}", park);
            }
        }
        if let Err(mark) = item.error().write(&format!("{}\n", msg)) {
            tracing::error!(item = %item, "failed to write ERROR: {}", mark);
        }
        ItemOutcome::Rejected(msg)
    }

    /// `Ok(Some(reason))` when the item is not eligible this pass.
    fn gate(&self, item: &Item) -> Result<Option<String>, DrainError> {
        if !item.manifest().exists() {
            return Ok(Some("no MANIFEST".into()));
        }
        if !item.packed().exists() {
            return Ok(Some("no PACKED".into()));
        }
        if item.success().exists() {
            return Ok(Some("SUCCESS".into()));
        }
        if item.retry().exists() && !self.time_to_retry(item)? {
            return Ok(Some("RETRY pending".into()));
        }
        if item.launch().is_open() {
            return Ok(Some("LAUNCH.open".into()));
        }
        if item.error().exists() {
            tracing::warn!(item = %item, "ERROR file exists");
            return Ok(Some("ERROR".into()));
        }
        if item.launch().exists() {
            return Ok(Some("LAUNCH".into()));
        }
        if item.task().exists() {
            return Ok(Some("TASK".into()));
        }
        Ok(None)
    }

    /// An elapsed RETRY is archived together with the LAUNCH, ERROR and
    /// TASK markers of the failed attempt, all under the retry timestamp.
    fn time_to_retry(&self, item: &Item) -> Result<bool, DrainError> {
        let retry_at = item.retry_time()?;
        let now = now_seconds();
        if now < retry_at {
            tracing::debug!(item = %item, now, retry_at, "RETRY delay");
            return Ok(false);
        }
        tracing::info!(item = %item, now, retry_at, "RETRY OK, moving aside RETRY file");
        let suffix = retry_at.to_string();
        if let Err(e) = item.retry().remove(Some(&suffix)) {
            tracing::error!(item = %item, "failed to rename RETRY: {}", e);
            return Ok(false);
        }
        for blocker in [item.launch(), item.error(), item.task()] {
            if blocker.exists() {
                blocker.remove(Some(&suffix))?;
            }
        }
        Ok(true)
    }

    fn launch(&self, item: &Item, journal: &mut MarkerWriter) -> Result<Launch, DrainError> {
        journal.info(&format!("parsing MANIFEST: {}", item.manifest()));
        let entries = item.manifest_entries()?;
        let pending = check_manifest(item, &entries)?;
        journal.info(&format!(
            "nfiles_manifest = {}, pending = {}",
            entries.len(),
            pending.len()
        ));
        let Some(last_pending) = pending.last().map(|e| e.filename.clone()) else {
            journal.info("every file already has a tombstone");
            return Ok(Launch::Completed);
        };

        let first = self.upload_pattern.parse_or_err(&entries[0].filename)?;
        let last = self.upload_pattern.parse_or_err(&entries[entries.len() - 1].filename)?;
        let props = SeriesProps::from_fields(&first, &last);
        let metadata = derive_item_metadata(self.config, item.name(), &props, entries.len());
        let size_hint = item.packed_info()?.total_size;

        let bounded = BoundedRetry::new(
            self.config.max_block_count,
            Duration::from_secs(self.config.block_delay),
            self.sleeper,
        );
        let deferred = DeferredRetry::new(Duration::from_secs(self.config.retry_delay));

        if item.bucket_ok().exists() {
            journal.info("BUCKET_OK exists, skipping bucket creation");
        } else {
            journal.info(&format!("creating item: {}", self.config.details_url(item.name())));
            let mut headers: Headers = vec![
                ("x-amz-auto-make-bucket".into(), "1".into()),
                ("x-archive-size-hint".into(), size_hint.to_string()),
                ("x-archive-queue-derive".into(), "0".into()),
            ];
            headers.extend(metadata_headers(&metadata));
            let body = std::fs::read(item.manifest().path())?;

            let verdict = bounded.run(|attempt| {
                if attempt > 1 {
                    journal.info(&format!("RETRY attempt ({}) create {}", attempt, item.name()));
                }
                self.store.create_item(item.name(), &body, &headers)
            })?;
            if let RetryVerdict::Escalate { status, .. } = verdict {
                journal.warn(&format!("create (auto-make-bucket) failed with status {}", status));
                return Ok(Launch::Deferred(deferred.schedule_now(item)?));
            }
            journal.info("item created, checking it exists");

            let verdict = bounded.run(|_| self.store.probe_item(item.name()))?;
            if let RetryVerdict::Escalate { status, .. } = verdict {
                journal.warn(&format!("bucket check failed with status {}", status));
                return Ok(Launch::Deferred(deferred.schedule_now(item)?));
            }
            item.bucket_ok().write(&format!("{}\n", self.config.details_url(item.name())))?;
            journal.info("BUCKET_OK written");
        }

        let total = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            let position = i + 1;
            if item.is_tombstoned(&entry.filename) {
                journal.info(&format!("[{}/{}] tombstone exists, skipping {}", position, total, entry.filename));
                continue;
            }
            journal.info(&format!("[{}/{}] uploading {}", position, total, entry.filename));

            let derive = entry.filename == last_pending && self.config.derive.is_on();
            let mut headers: Headers = vec![("Content-MD5".into(), entry.checksum.clone())];
            if !derive {
                headers.push(("x-archive-queue-derive".into(), "0".into()));
            }
            let path = item.file_path(&entry.filename);

            let verdict = bounded.run(|attempt| {
                if attempt > 1 {
                    journal.info(&format!("RETRY attempt ({}) {}", attempt, entry.filename));
                }
                self.store.upload(item.name(), &entry.filename, &path, &headers)
            })?;
            match verdict {
                RetryVerdict::Succeeded { status, .. } => {
                    let url = self.config.download_url(item.name(), &entry.filename);
                    item.mark_uploaded(&entry.filename, &url)?;
                    self.uploaded.set(self.uploaded.get() + 1);
                    journal.info(&format!("status {}, tombstone written: {}", status, url));
                }
                RetryVerdict::Escalate { status, .. } => {
                    journal.warn(&format!("upload of {} failed with status {}", entry.filename, status));
                    return Ok(Launch::Deferred(deferred.schedule_now(item)?));
                }
            }
        }

        if let Some(missing) = entries.iter().find(|e| !item.is_tombstoned(&e.filename)) {
            return Err(DrainError::Integrity(format!(
                "{} has no tombstone after upload",
                missing.filename
            )));
        }
        Ok(Launch::Completed)
    }
}

/// Entries still to upload. Every entry needs its file or a tombstone.
pub fn check_manifest<'e>(
    item: &Item,
    entries: &'e [ManifestEntry],
) -> Result<Vec<&'e ManifestEntry>, DrainError> {
    if entries.is_empty() {
        return Err(DrainError::Integrity(format!("{}: empty MANIFEST", item.name())));
    }
    let mut pending = Vec::new();
    for entry in entries {
        let tombstoned = item.is_tombstoned(&entry.filename);
        if tombstoned {
            continue;
        }
        if !item.has_file(&entry.filename) {
            return Err(DrainError::Integrity(format!(
                "file not found: {}",
                item.file_path(&entry.filename).display()
            )));
        }
        pending.push(entry);
    }
    Ok(pending)
}
