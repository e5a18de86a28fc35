use crate::marker::{Marker, MarkerWriter, OpenMode};
use crate::DrainError;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// PID-stamped lock file for stages that are re-scheduled often.
///
/// A lock whose recorded process no longer exists is stale and gets reclaimed
/// on the next acquire. A lock file that does not hold a readable PID is left
/// alone for an operator to resolve.
#[derive(Debug, Clone)]
pub struct SelfHealingLock {
    path: PathBuf,
}

/// Holding the lock. The file is removed when the guard drops.
#[derive(Debug)]
pub struct SelfHealingGuard {
    path: PathBuf,
}

impl SelfHealingLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when another live process holds the lock.
    pub fn try_acquire(&self) -> Result<Option<SelfHealingGuard>, DrainError> {
        if self.path.exists() {
            match self.holder()? {
                Some(pid) if process_alive(pid) => {
                    tracing::info!(pid, lock = %self.path.display(), "lock held by live process");
                    return Ok(None);
                }
                Some(pid) => {
                    tracing::warn!(pid, lock = %self.path.display(), "reclaiming stale lock");
                    match fs::remove_file(&self.path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(DrainError::Io(e)),
                    }
                }
                None => {
                    tracing::warn!(lock = %self.path.display(), "lock file has no valid pid, declining");
                    return Ok(None);
                }
            }
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(DrainError::Io(e)),
        };
        file.write_all(format!("{}\n", std::process::id()).as_bytes())?;

        Ok(Some(SelfHealingGuard {
            path: self.path.clone(),
        }))
    }

    /// PID recorded in the lock file, `None` if it cannot be parsed.
    pub fn holder(&self) -> Result<Option<i32>, DrainError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DrainError::Io(e)),
        };
        Ok(text.trim().parse::<i32>().ok().filter(|pid| *pid > 0))
    }
}

impl Drop for SelfHealingGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), "failed to release lock: {}", e);
        }
    }
}

/// Probe a pid with signal 0. EPERM still means the process exists.
pub fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Per-item lock on a marker's open state. Never reclaimed automatically.
#[derive(Debug, Clone)]
pub struct ManualLock {
    marker: Marker,
}

impl ManualLock {
    pub fn new(marker: Marker) -> Self {
        Self { marker }
    }

    /// `Ok(None)` when the marker is already open elsewhere.
    pub fn try_acquire(&self) -> Result<Option<MarkerWriter>, DrainError> {
        match self.marker.open(OpenMode::Append) {
            Ok(writer) => Ok(Some(writer)),
            Err(DrainError::IllegalState(msg)) => {
                tracing::debug!("{}", msg);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_held(&self) -> bool {
        self.marker.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = SelfHealingLock::new(dir.path().join("PACK.lock"));

        let guard = lock.try_acquire().unwrap().expect("lock should be free");
        assert_eq!(lock.holder().unwrap(), Some(std::process::id() as i32));
        assert!(lock.try_acquire().unwrap().is_none(), "own live pid must block");

        drop(guard);
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PACK.lock");
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        fs::write(&path, format!("{}\n", dead_pid)).unwrap();
        let lock = SelfHealingLock::new(&path);

        let guard = lock.try_acquire().unwrap();
        assert!(guard.is_some());
        assert_eq!(lock.holder().unwrap(), Some(std::process::id() as i32));
    }

    #[test]
    fn test_garbage_lock_declined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PACK.lock");
        fs::write(&path, "not-a-pid").unwrap();
        let lock = SelfHealingLock::new(&path);

        assert!(lock.try_acquire().unwrap().is_none());
        assert!(path.exists());
    }

    #[test]
    fn test_manual_lock_skips_when_open() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ManualLock::new(Marker::new(dir.path(), "LAUNCH"));

        let writer = lock.try_acquire().unwrap().expect("free");
        assert!(lock.is_held());
        assert!(lock.try_acquire().unwrap().is_none());

        writer.close().unwrap();
        assert!(!lock.is_held());
    }
}
