//! Directory sync lock
//!
//! A marker file in the synced directory signals that a session owns it.
//! Creation uses `create_new` (O_CREAT | O_EXCL) so two processes racing for
//! the same directory cannot both win.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Lock marker file name
pub const LOCK_FILENAME: &str = ".cmscloud-sync-lock";

/// Path of the lock marker for a directory
pub fn lock_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILENAME)
}

/// Try to take the lock for `dir` without waiting
///
/// Returns `Ok(false)` if the marker already exists.
pub fn acquire(dir: &Path) -> io::Result<bool> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path(dir))
    {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove the lock marker; a missing marker is not an error
pub fn release(dir: &Path) -> io::Result<()> {
    match std::fs::remove_file(lock_path(dir)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Held lock, released when dropped
#[derive(Debug)]
pub struct LockGuard {
    dir: PathBuf,
    forced: bool,
}

impl LockGuard {
    /// Acquire the lock, returning `None` if another session holds it
    pub fn try_acquire(dir: &Path) -> io::Result<Option<Self>> {
        if acquire(dir)? {
            debug!("Acquired sync lock in {:?}", dir);
            Ok(Some(Self {
                dir: dir.to_path_buf(),
                forced: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Take over an existing lock after an explicit operator override
    ///
    /// The marker is left in place and removed when this guard drops.
    pub fn adopt(dir: &Path) -> Self {
        warn!("Overriding existing sync lock in {:?}", dir);
        Self {
            dir: dir.to_path_buf(),
            forced: true,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the lock was taken over rather than freshly created
    pub fn is_forced(&self) -> bool {
        self.forced
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = release(&self.dir) {
            warn!("Failed to remove sync lock in {:?}: {}", self.dir, e);
        } else {
            debug!("Released sync lock in {:?}", self.dir);
        }
    }
}
