// SPDX-License-Identifier: Apache-2.0

//! Disk-backed backlog of undelivered batches.
//!
//! One flat directory; the listing is authoritative. Entries are
//! content-addressed `<sha1>.batch` files with `<sha1>.batch.lock` sidecars.
//! Reads and deletes take the advisory lock so cooperating processes on the
//! same directory never double-dispatch an entry.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::indexer::flock::{LockError, LockRegistry};

pub const BATCH_SUFFIX: &str = ".batch";
pub const LOCK_SUFFIX: &str = ".batch.lock";

#[derive(Error, Debug)]
pub enum BacklogError {
    #[error("backlog IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Outcome of a disk-pressure reclaim pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReclaimOutcome {
    pub removed: u64,
    pub failed: u64,
    pub remaining_bytes: u64,
}

pub struct Backlog {
    dir: PathBuf,
    disk_ceiling: Option<u64>,
    locks: LockRegistry,
}

impl Backlog {
    pub fn open(dir: PathBuf, disk_ceiling: Option<u64>) -> Result<Self, BacklogError> {
        std::fs::create_dir_all(&dir).map_err(|source| BacklogError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            disk_ceiling,
            locks: LockRegistry::new(),
        })
    }

    pub fn batch_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{BATCH_SUFFIX}"))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{LOCK_SUFFIX}"))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.batch_path(id).exists()
    }

    /// Write a batch to disk. Returns whether a new file was written; an
    /// entry already on disk is left alone.
    pub fn spill(&self, id: &str, bytes: &[u8]) -> Result<bool, BacklogError> {
        let path = self.batch_path(id);
        if path.exists() {
            return Ok(false);
        }
        std::fs::write(&path, bytes).map_err(|source| BacklogError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(batch = id, bytes = bytes.len(), "spilled batch to backlog");
        Ok(true)
    }

    /// Read an entry under its advisory lock, leaving the lock held for the
    /// read-and-dispatch window. Returns None (without holding the lock)
    /// when the entry is locked elsewhere or the file is gone.
    pub fn read_locked(&self, id: &str) -> Result<Option<Bytes>, BacklogError> {
        let lock_path = self.lock_path(id);
        match self.locks.acquire(&lock_path) {
            Ok(crate::indexer::flock::LockState::Acquired) => {}
            // Held by this process: an earlier dispatch is still in flight.
            Ok(crate::indexer::flock::LockState::AlreadyHeld) => return Ok(None),
            Err(LockError::Busy(_)) => return Ok(None),
            Err(LockError::Io { path, source }) => return Err(BacklogError::Io { path, source }),
        }

        match std::fs::read(self.batch_path(id)) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.locks.release(&lock_path);
                Ok(None)
            }
            Err(source) => {
                self.locks.release(&lock_path);
                Err(BacklogError::Io {
                    path: self.batch_path(id),
                    source,
                })
            }
        }
    }

    /// Remove an entry after successful dispatch. Returns whether a file was
    /// actually deleted.
    pub fn remove(&self, id: &str) -> Result<bool, BacklogError> {
        let path = self.batch_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(BacklogError::Io { path, source }),
        }
    }

    /// Release the advisory lock for an entry, if this process holds it.
    pub fn release(&self, id: &str) -> bool {
        self.locks.release(&self.lock_path(id))
    }

    /// List the ids of every entry currently on disk.
    pub fn list(&self) -> Result<Vec<String>, BacklogError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| BacklogError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(LOCK_SUFFIX) {
                continue;
            }
            if let Some(id) = name.strip_suffix(BATCH_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    /// Enforce the disk-space ceiling: walk the directory, and while the
    /// total exceeds the ceiling delete entries oldest-first under the
    /// advisory lock. The last remaining entry is never deleted. A delete
    /// race counts as a failure but is not an error condition.
    pub fn reclaim(&self) -> ReclaimOutcome {
        let mut outcome = ReclaimOutcome::default();
        let Some(ceiling) = self.disk_ceiling else {
            return outcome;
        };

        let mut entries = match self.walk() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "backlog walk failed, skipping reclaim");
                return outcome;
            }
        };
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        entries.sort_by(|a, b| a.ctime.cmp(&b.ctime).then_with(|| a.path.cmp(&b.path)));

        let mut remaining = entries.len();
        for entry in entries {
            if total <= ceiling || remaining <= 1 {
                break;
            }
            let lock_path = lock_path_for(&entry.path);
            match self.locks.acquire(&lock_path) {
                Ok(crate::indexer::flock::LockState::Acquired) => {}
                Ok(crate::indexer::flock::LockState::AlreadyHeld) | Err(LockError::Busy(_)) => {
                    continue;
                }
                Err(err) => {
                    warn!(%err, "lock failed during reclaim");
                    continue;
                }
            }
            match std::fs::remove_file(&entry.path) {
                Ok(()) => {
                    debug!(path = ?entry.path, size = entry.size, "reclaimed backlog entry");
                    outcome.removed += 1;
                    total -= entry.size;
                    remaining -= 1;
                }
                Err(err) => {
                    // Another process may have dispatched and deleted it.
                    debug!(path = ?entry.path, %err, "reclaim delete race");
                    outcome.failed += 1;
                }
            }
            self.locks.release(&lock_path);
        }

        outcome.remaining_bytes = total;
        outcome
    }

    fn walk(&self) -> Result<Vec<WalkEntry>, BacklogError> {
        let dir_entries = std::fs::read_dir(&self.dir).map_err(|source| BacklogError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut entries = Vec::new();
        for entry in dir_entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(BATCH_SUFFIX) || name.ends_with(LOCK_SUFFIX) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            entries.push(WalkEntry {
                path,
                size: meta.len(),
                ctime: (meta.ctime(), meta.ctime_nsec()),
            });
        }
        Ok(entries)
    }
}

struct WalkEntry {
    path: PathBuf,
    size: u64,
    ctime: (i64, i64),
}

/// Lock sidecar path for a batch file.
pub fn lock_path_for(batch_path: &Path) -> PathBuf {
    batch_path.with_extension("batch.lock")
}
