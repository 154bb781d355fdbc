//! Directory lock
//!
//! Advisory lock on a `LOCK` file inside the store directory, so only one
//! process writes a store at a time. Read-only opens take a shared lock and
//! can coexist with each other, but not with a writer.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{CaskError, Result};

/// Name of the lock file within the store directory
pub const LOCK_FILE: &str = "LOCK";

/// Interval between attempts while waiting for the lock
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Lock flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Writers: excludes every other holder
    Exclusive,
    /// Read-only opens: excludes writers only
    Shared,
}

/// A held directory lock, released on drop
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    file: File,
    mode: LockMode,
}

impl DirLock {
    /// Take the lock or fail immediately with `LockUnavailable`
    pub fn try_acquire(dir: &Path, mode: LockMode) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let file = open_lock_file(&path, mode)?;

        if !try_lock(&file, mode)? {
            return Err(CaskError::LockUnavailable);
        }

        Ok(Self { path, file, mode })
    }

    /// Keep retrying until `timeout` elapses, then fail with `LockTimeout`
    pub fn acquire_timeout(dir: &Path, mode: LockMode, timeout: Duration) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let file = open_lock_file(&path, mode)?;
        let deadline = Instant::now() + timeout;

        loop {
            if try_lock(&file, mode)? {
                return Ok(Self { path, file, mode });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CaskError::LockTimeout(timeout));
            }
            thread::sleep(RETRY_INTERVAL.min(deadline - now));
        }
    }

    /// Release explicitly, reporting unlock failures
    pub fn release(self) -> Result<()> {
        FileExt::unlock(&self.file)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

fn open_lock_file(path: &Path, mode: LockMode) -> Result<File> {
    let file = match mode {
        LockMode::Exclusive => OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?,
        // A store copied without its lock file still opens read-only
        LockMode::Shared => match File::open(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => File::create(path)?,
            other => other?,
        },
    };
    Ok(file)
}

/// One non-blocking attempt. `Ok(false)` means another holder has it.
///
/// Calls name `FileExt` so std's inherent `File` lock methods are not picked.
fn try_lock(file: &File, mode: LockMode) -> Result<bool> {
    let attempt = match mode {
        LockMode::Exclusive => FileExt::try_lock_exclusive(file),
        LockMode::Shared => FileExt::try_lock_shared(file),
    };

    match attempt {
        Ok(()) => Ok(true),
        Err(e) if is_contended(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
