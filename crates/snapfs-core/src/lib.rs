//! # snapfs-core
//!
//! Copy-on-write, append-only versioning for a live directory tree with a
//! linear chain of read-only snapshots.
//!
//! ## On-disk layout
//!
//! ```text
//! <root>/
//! ├── docs/report.txt          # live ("main") file
//! └── snapshots/
//!     ├── .hid                 # id of the latest snapshot
//!     ├── s1.hid               # back-pointer: predecessor of s1 ("" for the first)
//!     ├── s1/
//!     │   └── docs/
//!     │       ├── report.txt.map   # MapHeader + sparse u64 block pointers
//!     │       └── report.txt.dat   # preserved blocks, append-only
//!     └── s2.hid, s2/ ...
//! ```
//!
//! The first write that touches a block after a snapshot copies the block's
//! original bytes into the latest snapshot's `.dat` log and records its
//! position in the `.map` file. Older snapshots are reconstructed by walking
//! forward from the requested snapshot to the live tree.

pub mod block;
pub mod chain;
pub mod fs;
pub mod lock;
pub mod map;
pub mod overlay;
pub mod path;
pub mod versioned;

pub use block::{record_header, BlockStore, Companions};
pub use chain::{SnapshotChain, SnapshotId};
pub use fs::{MainFile, OpenDir, OpenFile, SnapFs};
pub use lock::{FileIdentity, LockGuard, LockManager};
pub use map::{FileStat, MapFile, MapHeader, MAP_HEADER_SIZE, POINTER_WIDTH};
pub use overlay::{Filler, Overlay};
pub use path::{EntryKind, PathResolver, VirtualPath};
pub use versioned::{resolve_stat, SnapshotFile};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the versioning core
#[derive(Error, Debug)]
pub enum SnapError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Name too long: {len} bytes (limit {limit})")]
    NameTooLong { len: usize, limit: usize },

    #[error("Consistency fault: {0}")]
    Consistency(String),

    #[error("Lock table full ({capacity} locks held)")]
    LockTableFull { capacity: usize },

    #[error("Out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },

    #[error("Wrong handle: {operation} is not valid on a {kind} handle")]
    WrongHandle {
        operation: &'static str,
        kind: &'static str,
    },

    #[error("Read-only: {path} is inside the snapshot namespace")]
    ReadOnly { path: String },

    #[error("Not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },

    #[error("Invalid snapshot id: {0:?}")]
    InvalidSnapshotId(String),

    #[error("Already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Name is not valid UTF-8: {name}")]
    UnrepresentableName { name: String },
}

pub type Result<T> = std::result::Result<T, SnapError>;

/// "Invalid exchange": handle used for an operation its class does not allow.
#[cfg(target_os = "linux")]
const EBADE: i32 = libc::EBADE;
#[cfg(not(target_os = "linux"))]
const EBADE: i32 = libc::EINVAL;

impl SnapError {
    pub(crate) fn not_found(path: impl Into<String>) -> Self {
        SnapError::NotFound { path: path.into() }
    }

    pub fn unrepresentable(name: &std::ffi::OsStr) -> Self {
        SnapError::UnrepresentableName {
            name: name.to_string_lossy().into_owned(),
        }
    }

    pub(crate) fn consistency(msg: impl Into<String>) -> Self {
        SnapError::Consistency(msg.into())
    }

    /// On-disk corruption rather than a transient condition; never retry.
    pub fn is_consistency_fault(&self) -> bool {
        matches!(self, SnapError::Consistency(_))
    }

    /// POSIX errno reported to the caller of the dispatch layer.
    pub fn errno(&self) -> i32 {
        match self {
            SnapError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            SnapError::NotFound { .. } => libc::ENOENT,
            SnapError::NameTooLong { .. } => libc::ENAMETOOLONG,
            SnapError::Consistency(_) => libc::EFAULT,
            SnapError::LockTableFull { .. } => libc::ENOLCK,
            SnapError::OutOfMemory { .. } => libc::ENOMEM,
            SnapError::WrongHandle { .. } => EBADE,
            SnapError::ReadOnly { .. } => libc::EACCES,
            SnapError::NotADirectory { .. } => libc::ENOTDIR,
            SnapError::InvalidSnapshotId(_) => libc::EINVAL,
            SnapError::AlreadyExists { .. } => libc::EEXIST,
            SnapError::Unsupported(_) => libc::EXDEV,
            SnapError::UnrepresentableName { .. } => libc::EILSEQ,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(SnapError::not_found("/x").errno(), libc::ENOENT);
        assert_eq!(SnapError::consistency("bad").errno(), libc::EFAULT);
        assert_eq!(
            SnapError::LockTableFull { capacity: 1 }.errno(),
            libc::ENOLCK
        );
        assert_eq!(
            SnapError::WrongHandle {
                operation: "write",
                kind: "snapshot file"
            }
            .errno(),
            EBADE
        );
        assert_eq!(
            SnapError::UnrepresentableName { name: "caf\u{fffd}".into() }.errno(),
            libc::EILSEQ
        );
        let io = SnapError::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(io.errno(), libc::ENOSPC);
    }

    #[test]
    fn test_consistency_faults_are_distinguished() {
        assert!(SnapError::consistency("misaligned log").is_consistency_fault());
        assert!(!SnapError::Io(io::Error::other("transient")).is_consistency_fault());
    }
}
