use crate::DrainError;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const OPEN_SUFFIX: &str = ".open";

/// How `Marker::open` treats existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Append,
    Truncate,
}

/// A named sentinel file inside an item directory.
///
/// A marker is either closed (`<name>`) or open (`<name>.open`), never both.
/// Moving between the two states is a single `rename`, so two processes
/// racing to open the same marker cannot both succeed. Only the closed state
/// counts as set: an open marker reads as "not yet true".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    dir: PathBuf,
    name: String,
}

impl Marker {
    pub fn new(dir: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            dir: dir.into(),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    pub fn open_path(&self) -> PathBuf {
        self.dir.join(format!("{}{}", self.name, OPEN_SUFFIX))
    }

    /// The closed file exists.
    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Boolean reading of the marker. Identical to `exists`; an open marker is not set.
    pub fn is_set(&self) -> bool {
        self.exists()
    }

    pub fn is_open(&self) -> bool {
        self.open_path().is_file()
    }

    /// Move the marker to the open state and return a writer on it.
    ///
    /// Fails with `IllegalState` when the marker is already open, including
    /// when another process wins the rename race. Callers treat that as
    /// "someone else owns this item" and move on.
    pub fn open(&self, mode: OpenMode) -> Result<MarkerWriter, DrainError> {
        if self.is_open() {
            return Err(self.already_open());
        }
        let open_path = self.open_path();

        let file = if self.exists() {
            match fs::rename(self.path(), &open_path) {
                Ok(()) => {}
                // lost the race: the closed file was renamed by someone else
                Err(e) if e.kind() == ErrorKind::NotFound => return Err(self.already_open()),
                Err(e) => return Err(DrainError::Io(e)),
            }
            let mut options = OpenOptions::new();
            match mode {
                OpenMode::Append => options.append(true),
                OpenMode::Truncate => options.write(true).truncate(true),
            };
            options.open(&open_path)?
        } else {
            match OpenOptions::new().write(true).create_new(true).open(&open_path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(self.already_open()),
                Err(e) => return Err(DrainError::Io(e)),
            }
        };

        Ok(MarkerWriter {
            marker: self.clone(),
            file: Some(file),
        })
    }

    /// Move an open marker back to the closed state.
    pub fn close(&self) -> Result<(), DrainError> {
        if !self.is_open() {
            return Err(DrainError::IllegalState(format!(
                "cannot close: {} not open",
                self.path().display()
            )));
        }
        fs::rename(self.open_path(), self.path())?;
        Ok(())
    }

    /// Replace the content in one step. The marker never passes through
    /// the open state: content goes to a temporary sibling that is renamed
    /// over the final name.
    pub fn write(&self, text: &str) -> Result<(), DrainError> {
        let tmp = self
            .dir
            .join(format!(".{}.tmp.{}", self.name, std::process::id()));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, self.path()) {
            let _ = fs::remove_file(&tmp);
            return Err(DrainError::Io(e));
        }
        Ok(())
    }

    pub fn read(&self) -> Result<String, DrainError> {
        Ok(fs::read_to_string(self.path())?)
    }

    pub fn read_lines(&self) -> Result<Vec<String>, DrainError> {
        Ok(self.read()?.lines().map(str::to_string).collect())
    }

    /// Delete the closed marker, or with `save_suffix` rename it to
    /// `<name>.<suffix>` so its history survives. An earlier archive under
    /// the same suffix is kept: the new one becomes `<name>.<suffix>.<n>`.
    pub fn remove(&self, save_suffix: Option<&str>) -> Result<(), DrainError> {
        match save_suffix {
            Some(suffix) => fs::rename(self.path(), self.free_archive_path(suffix))?,
            None => fs::remove_file(self.path())?,
        }
        Ok(())
    }

    fn free_archive_path(&self, suffix: &str) -> PathBuf {
        let mut candidate = self.suffixed_path(suffix);
        let mut n = 0;
        while candidate.exists() {
            n += 1;
            candidate = self.dir.join(format!("{}.{}.{}", self.name, suffix, n));
        }
        candidate
    }

    pub fn suffixed_path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, suffix))
    }

    fn already_open(&self) -> DrainError {
        DrainError::IllegalState(format!("cannot open: {} exists", self.open_path().display()))
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// Writer on an open marker. Doubles as the item's journal.
///
/// Dropping the writer without calling `close` leaves the marker open on
/// purpose: whatever was in progress did not finish, and the open marker keeps
/// other runs away from the item until an operator looks at it.
#[derive(Debug)]
pub struct MarkerWriter {
    marker: Marker,
    file: Option<File>,
}

impl MarkerWriter {
    pub fn marker(&self) -> &Marker {
        &self.marker
    }

    pub fn path(&self) -> PathBuf {
        self.marker.open_path()
    }

    pub fn write(&mut self, text: &str) -> Result<(), DrainError> {
        match self.file.as_mut() {
            Some(file) => Ok(file.write_all(text.as_bytes())?),
            None => Err(DrainError::IllegalState(format!(
                "{} already released",
                self.marker.open_path().display()
            ))),
        }
    }

    pub fn info(&mut self, msg: &str) {
        tracing::info!(marker = %self.marker.name(), "{}", msg);
        self.journal("", msg);
    }

    pub fn warn(&mut self, msg: &str) {
        tracing::warn!(marker = %self.marker.name(), "{}", msg);
        self.journal("WARNING: ", msg);
    }

    pub fn error(&mut self, msg: &str) {
        tracing::error!(marker = %self.marker.name(), "{}", msg);
        self.journal("ERROR: ", msg);
    }

    /// Flush and move the marker to the closed state.
    pub fn close(mut self) -> Result<(), DrainError> {
        self.release()?;
        self.marker.close()
    }

    /// Flush and park the open file under `<name>.<suffix>` instead of closing it.
    pub fn fail(mut self, suffix: &str) -> Result<(), DrainError> {
        self.release()?;
        fs::rename(self.marker.open_path(), self.marker.suffixed_path(suffix))?;
        Ok(())
    }

    fn release(&mut self) -> Result<(), DrainError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    // Journal lines are best effort; the tracing event above is the primary record.
    fn journal(&mut self, level: &str, msg: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let _ = self.write(&format!("{} {}{}\n", stamp, level, msg));
    }
}

/// `true` when `path` names an open marker file.
pub fn is_open_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(OPEN_SUFFIX))
        .unwrap_or(false)
}
