//! Mutual exclusion keyed by the identity of a live file.
//!
//! Two handles that reach the same file through different paths or
//! descriptors share one lock, because the key is `(dev, ino)`.

use std::collections::HashSet;
use std::fs::{File, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use snapfs_config::{log_lock_debug, log_lock_warn};

use crate::{Result, SnapError};

/// Stable identity of a file on the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    pub fn of(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    pub fn of_file(file: &File) -> io::Result<Self> {
        Ok(Self::of(&file.metadata()?))
    }
}

/// Table of currently held file locks.
#[derive(Debug)]
pub struct LockManager {
    held: Mutex<HashSet<FileIdentity>>,
    released: Condvar,
    capacity: usize,
}

impl LockManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            held: Mutex::new(HashSet::with_capacity(capacity.min(64))),
            released: Condvar::new(),
            capacity,
        }
    }

    /// Block until `identity` is free, then take it.
    ///
    /// Fails with [`SnapError::LockTableFull`] when `capacity` other files
    /// are locked, and on an identity no real file can have.
    pub fn acquire(&self, identity: FileIdentity) -> Result<LockGuard<'_>> {
        if identity.ino == 0 {
            return Err(SnapError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "inode 0 is not a valid lock identity",
            )));
        }

        let mut held = self.table();
        while held.contains(&identity) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if held.len() >= self.capacity {
            log_lock_warn!(
                "Lock table full",
                capacity = self.capacity,
                ino = identity.ino
            );
            return Err(SnapError::LockTableFull {
                capacity: self.capacity,
            });
        }
        held.insert(identity);
        log_lock_debug!("Lock acquired", dev = identity.dev, ino = identity.ino);

        Ok(LockGuard {
            manager: self,
            identity,
            released: false,
        })
    }

    /// Release a lock explicitly. Equivalent to dropping the guard, but
    /// reports a lock that was no longer in the table.
    pub fn release(&self, guard: LockGuard<'_>) -> Result<()> {
        guard.release()
    }

    /// Number of locks currently held.
    pub fn held(&self) -> usize {
        self.table().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn table(&self) -> MutexGuard<'_, HashSet<FileIdentity>> {
        // The set stays consistent even if a holder panicked.
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unlock(&self, identity: FileIdentity) -> bool {
        let removed = self.table().remove(&identity);
        self.released.notify_all();
        log_lock_debug!("Lock released", dev = identity.dev, ino = identity.ino);
        removed
    }
}

/// A held lock; released on drop or by [`LockGuard::release`].
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    identity: FileIdentity,
    released: bool,
}

impl LockGuard<'_> {
    pub fn identity(&self) -> FileIdentity {
        self.identity
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        if self.manager.unlock(self.identity) {
            Ok(())
        } else {
            Err(SnapError::consistency(format!(
                "lock for inode {} was not held at release",
                self.identity.ino
            )))
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.manager.unlock(self.identity);
        }
    }
}
