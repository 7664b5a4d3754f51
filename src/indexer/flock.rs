// SPDX-License-Identifier: Apache-2.0

//! Advisory locks over backlog entries.
//!
//! Each `<id>.batch` file gets a `<id>.batch.lock` sidecar, locked with a
//! cooperative `flock(LOCK_EX | LOCK_NB)`. The registry tracks locks held by
//! this process so a second acquire of the same path is a no-op rather than
//! a self-deadlock; separate processes (or separate registries) contend on
//! the flock itself.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock busy: {0}")]
    Busy(PathBuf),

    #[error("lock IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Acquired,
    /// This process already holds the lock; the acquire was a no-op.
    AlreadyHeld,
}

#[derive(Clone, Default)]
pub struct LockRegistry {
    held: Arc<Mutex<HashMap<PathBuf, File>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive advisory lock at `path`, creating the lock file
    /// if needed. Non-blocking: a lock held elsewhere returns `Busy`.
    pub fn acquire(&self, path: &Path) -> Result<LockState, LockError> {
        let mut held = self.held.lock().expect("lock registry poisoned");
        if held.contains_key(path) {
            return Ok(LockState::AlreadyHeld);
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            return if err.kind() == std::io::ErrorKind::WouldBlock {
                Err(LockError::Busy(path.to_path_buf()))
            } else {
                Err(LockError::Io {
                    path: path.to_path_buf(),
                    source: err,
                })
            };
        }

        held.insert(path.to_path_buf(), file);
        Ok(LockState::Acquired)
    }

    /// Release the lock: unlock, close the descriptor, unlink the lock file.
    /// Returns whether this process actually held it.
    pub fn release(&self, path: &Path) -> bool {
        let mut held = self.held.lock().expect("lock registry poisoned");
        let Some(file) = held.remove(path) else {
            return false;
        };
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
        drop(file);
        let _ = std::fs::remove_file(path);
        true
    }

    pub fn is_held(&self, path: &Path) -> bool {
        self.held
            .lock()
            .expect("lock registry poisoned")
            .contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.batch.lock");
        let locks = LockRegistry::new();

        assert_eq!(locks.acquire(&path).unwrap(), LockState::Acquired);
        assert!(locks.is_held(&path));
        assert!(path.exists());

        assert!(locks.release(&path));
        assert!(!locks.is_held(&path));
        assert!(!path.exists());
    }

    #[test]
    fn reacquire_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.batch.lock");
        let locks = LockRegistry::new();

        assert_eq!(locks.acquire(&path).unwrap(), LockState::Acquired);
        assert_eq!(locks.acquire(&path).unwrap(), LockState::AlreadyHeld);
        assert!(locks.release(&path));
    }

    #[test]
    fn contended_lock_is_busy() {
        // flock is per open file description, so two registries behave like
        // two processes.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.batch.lock");
        let ours = LockRegistry::new();
        let theirs = LockRegistry::new();

        assert_eq!(ours.acquire(&path).unwrap(), LockState::Acquired);
        assert!(matches!(theirs.acquire(&path), Err(LockError::Busy(_))));

        ours.release(&path);
        assert_eq!(theirs.acquire(&path).unwrap(), LockState::Acquired);
        theirs.release(&path);
    }

    #[test]
    fn release_without_hold_is_false() {
        let dir = TempDir::new().unwrap();
        let locks = LockRegistry::new();
        assert!(!locks.release(&dir.path().join("ghost.lock")));
    }
}
