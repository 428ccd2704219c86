//! Exclusive ownership of a store's data directory.
//!
//! Two processes opening the same directory would race each other on the
//! WAL, the manifests, and compaction. `StoreLock` takes an advisory
//! `flock` on a lock file inside the data directory and records the
//! holder's PID there, so a failed acquisition can say who owns the store.
//! The OS drops the lock when the file handle closes, which covers clean
//! shutdown, `Drop`, and crashes alike.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// Name of the lock file inside the data directory.
pub const LOCK_FILE: &str = "store.lock";

/// An exclusive advisory lock on a store's data directory, held for the
/// life of the value.
pub struct StoreLock {
    _file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Locks `data_dir` for this process.
    ///
    /// When another process holds the directory, fails with an
    /// [`Error::IO`] naming the holder's PID.
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(LOCK_FILE);

        // Opened without truncation: if the lock turns out to be taken, the
        // holder's PID must still be readable.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if !try_flock(&file)? {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            return Err(Error::IO(format!(
                "data directory {} is locked by process {}",
                data_dir.display(),
                holder.trim()
            )));
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock").field("path", &self.path).finish()
    }
}

/// Returns true when the exclusive lock was taken, false when another
/// holder has it; any other flock failure is a real IO error.
#[cfg(unix)]
fn try_flock(file: &File) -> Result<bool> {
    use libc::{flock, EWOULDBLOCK, LOCK_EX, LOCK_NB};

    if unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) } == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err.into())
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File) -> Result<bool> {
    Ok(true)
}
