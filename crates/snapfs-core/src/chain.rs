//! The snapshot chain: a persisted singly linked list.
//!
//! `snapshots/.hid` names the latest snapshot; `snapshots/<id>.hid` names the
//! snapshot taken before `<id>` (empty for the first one). Pointer files are
//! exactly [`PATH_MAX`] bytes holding a NUL-terminated id.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, DirBuilder, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use snapfs_config::{log_chain_debug, log_chain_info, log_chain_warn};
use tracing::instrument;

use crate::path::{PathResolver, HID_SUFFIX, LOG_SUFFIX, MAP_SUFFIX, NAME_MAX, PATH_MAX};
use crate::{Result, SnapError};

/// A validated snapshot name: one path component, no leading dot, no
/// reserved suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= NAME_MAX
            && !id.starts_with('.')
            && !id.contains(['/', '\0'])
            && !id.ends_with(HID_SUFFIX)
            && !id.ends_with(MAP_SUFFIX)
            && !id.ends_with(LOG_SUFFIX);
        if valid {
            Ok(Self(id))
        } else {
            Err(SnapError::InvalidSnapshotId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SnapshotId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Creates snapshots and answers "which is latest / what came before".
///
/// Creation is not safe against a concurrent `create` on the same root from
/// another process; callers serialise it.
#[derive(Debug)]
pub struct SnapshotChain {
    resolver: PathResolver,
    latest: RwLock<Option<SnapshotId>>,
}

impl SnapshotChain {
    /// Ensure the namespace root exists and load the latest pointer.
    pub fn open(resolver: PathResolver) -> Result<Self> {
        let chain = Self {
            resolver,
            latest: RwLock::new(None),
        };
        chain.ensure_namespace_root()?;
        chain.get_latest()?;
        Ok(chain)
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Create the namespace directory (mode 0700) if it is missing.
    pub fn ensure_namespace_root(&self) -> Result<()> {
        let dir = self.resolver.snapshot_dir();
        match fs::symlink_metadata(dir) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SnapError::NotADirectory {
                path: dir.to_path_buf(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                DirBuilder::new().mode(0o700).create(dir).or_else(|e| {
                    // lost a race with another creator
                    if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() {
                        Ok(())
                    } else {
                        Err(e)
                    }
                })?;
                log_chain_info!(
                    "Created snapshot namespace",
                    path = tracing::field::display(dir.display())
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read the latest pointer from disk. `None` means no snapshots yet.
    pub fn get_latest(&self) -> Result<Option<SnapshotId>> {
        let latest = match read_pointer_file(&self.resolver.latest_pointer_path()) {
            Ok(Some(id)) => Some(id),
            Ok(None) => {
                return Err(SnapError::consistency(
                    "latest pointer file holds an empty id",
                ))
            }
            Err(SnapError::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = latest.clone();
        Ok(latest)
    }

    /// Latest id as of the last `open`, `get_latest` or `create`.
    pub fn cached_latest(&self) -> Option<SnapshotId> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Point the chain head at `id`.
    pub fn set_latest(&self, id: &SnapshotId) -> Result<()> {
        write_pointer_file(&self.resolver.latest_pointer_path(), id.as_str())?;
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
        Ok(())
    }

    /// Whether the directory and back-pointer of `id` are both on disk.
    pub fn exists(&self, id: &SnapshotId) -> bool {
        self.resolver.back_pointer_path(id.as_str()).is_file()
            && self.resolver.snapshot_root(id.as_str()).is_dir()
    }

    /// Whether `id` is reachable from the latest pointer. Unlike [`exists`],
    /// this rejects leftovers of a `create` that never moved the pointer.
    ///
    /// [`exists`]: Self::exists
    pub fn is_committed(&self, id: &SnapshotId) -> Result<bool> {
        Ok(self.chain()?.contains(id))
    }

    /// The snapshot taken immediately before `id`.
    pub fn predecessor(&self, id: &SnapshotId) -> Result<Option<SnapshotId>> {
        match read_pointer_file(&self.resolver.back_pointer_path(id.as_str())) {
            Err(SnapError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err(SnapError::not_found(format!("/snapshots/{id}")))
            }
            other => other,
        }
    }

    /// All snapshot ids, newest first.
    pub fn chain(&self) -> Result<Vec<SnapshotId>> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut next = self.get_latest()?;
        while let Some(id) = next {
            if !seen.insert(id.clone()) {
                log_chain_warn!("Snapshot chain loops", id = id.as_str());
                return Err(SnapError::consistency(format!(
                    "snapshot chain loops back to {id}"
                )));
            }
            next = self.predecessor(&id)?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// `id` followed by every newer snapshot up to the latest.
    pub fn layers_from(&self, id: &SnapshotId) -> Result<Vec<SnapshotId>> {
        let chain = self.chain()?;
        let index = chain
            .iter()
            .position(|c| c == id)
            .ok_or_else(|| SnapError::not_found(format!("/snapshots/{id}")))?;
        Ok(chain[..=index].iter().rev().cloned().collect())
    }

    /// Create snapshot `id` on top of the current latest.
    ///
    /// The snapshot exists only once the latest pointer names it; a failure
    /// before that removes the back-pointer and the directory again.
    #[instrument(skip(self), level = "debug")]
    pub fn create(&self, id: &SnapshotId) -> Result<()> {
        self.ensure_namespace_root()?;
        let root = self.resolver.snapshot_root(id.as_str());
        let back = self.resolver.back_pointer_path(id.as_str());
        if self.exists(id) {
            return Err(SnapError::AlreadyExists {
                path: format!("/snapshots/{id}"),
            });
        }

        let previous = self.get_latest()?;
        DirBuilder::new().mode(0o700).create(&root).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                SnapError::AlreadyExists {
                    path: format!("/snapshots/{id}"),
                }
            } else {
                e.into()
            }
        })?;
        log_chain_debug!("Snapshot directory created", id = id.as_str());

        let committed = write_pointer_file(
            &back,
            previous.as_ref().map(SnapshotId::as_str).unwrap_or(""),
        )
        .and_then(|()| self.set_latest(id));

        if let Err(e) = committed {
            log_chain_warn!(
                "Snapshot creation failed, rolling back",
                id = id.as_str(),
                error = tracing::field::display(&e)
            );
            if back.is_file() {
                let _ = fs::remove_file(&back);
            }
            let _ = fs::remove_dir(&root);
            return Err(e);
        }

        log_chain_info!(
            "Snapshot created",
            id = id.as_str(),
            previous = previous.as_ref().map(SnapshotId::as_str).unwrap_or("")
        );
        Ok(())
    }

    /// Probe extended attribute support on the namespace root.
    pub fn check_xattr_support(&self) -> bool {
        let supported = xattr::probe(self.resolver.snapshot_dir());
        log_chain_debug!("Extended attribute probe", supported = supported);
        supported
    }
}

/// Read a pointer file; `Ok(None)` for an empty id.
fn read_pointer_file(path: &Path) -> Result<Option<SnapshotId>> {
    let mut buf = vec![0u8; PATH_MAX];
    File::open(path)?.read_exact(&mut buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SnapError::consistency(format!("pointer file {} is truncated", path.display()))
        } else {
            SnapError::Io(e)
        }
    })?;

    let end = buf.iter().position(|b| *b == 0).ok_or_else(|| {
        SnapError::consistency(format!(
            "pointer file {} is not NUL-terminated",
            path.display()
        ))
    })?;
    if end == 0 {
        return Ok(None);
    }
    let id = std::str::from_utf8(&buf[..end]).map_err(|_| {
        SnapError::consistency(format!("pointer file {} is not UTF-8", path.display()))
    })?;
    SnapshotId::new(id).map(Some)
}

/// Replace a pointer file with one full-length write, published by rename.
fn write_pointer_file(path: &Path, id: &str) -> Result<()> {
    if id.len() >= PATH_MAX {
        return Err(SnapError::NameTooLong {
            len: id.len(),
            limit: PATH_MAX - 1,
        });
    }
    let mut buf = vec![0u8; PATH_MAX];
    buf[..id.len()].copy_from_slice(id.as_bytes());

    let temp = crate::path::with_suffix(
        path,
        &format!(
            ".{}.{:?}.tmp",
            std::process::id(),
            std::thread::current().id()
        ),
    );
    let written = (|| -> io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&temp, path)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
mod xattr {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    const PROBE_NAME: &[u8] = b"user.snapfs.probe\0";
    const PROBE_VALUE: &[u8] = b"1";

    pub(super) fn probe(path: &Path) -> bool {
        let Ok(path) = CString::new(path.as_os_str().as_bytes()) else {
            return false;
        };
        let name = PROBE_NAME.as_ptr().cast::<libc::c_char>();

        // SAFETY: both strings are NUL-terminated and outlive the calls;
        // buffers are valid for the lengths passed.
        unsafe {
            if libc::lsetxattr(
                path.as_ptr(),
                name,
                PROBE_VALUE.as_ptr().cast(),
                PROBE_VALUE.len(),
                0,
            ) != 0
            {
                return false;
            }
            let mut back = [0u8; 8];
            let read = libc::lgetxattr(path.as_ptr(), name, back.as_mut_ptr().cast(), back.len());
            let matches = read == PROBE_VALUE.len() as isize && &back[..1] == PROBE_VALUE;
            let removed = libc::lremovexattr(path.as_ptr(), name) == 0;
            matches && removed
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod xattr {
    use std::path::Path;

    pub(super) fn probe(_path: &Path) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chain() -> (TempDir, SnapshotChain) {
        let dir = TempDir::new().unwrap();
        let chain = SnapshotChain::open(PathResolver::new(dir.path())).unwrap();
        (dir, chain)
    }

    fn id(s: &str) -> SnapshotId {
        SnapshotId::new(s).unwrap()
    }

    #[test]
    fn test_snapshot_id_validation() {
        assert!(SnapshotId::new("2024-01-01").is_ok());
        for bad in ["", ".", "..", ".hidden", ".create.lock", "a/b", "x.hid", "x.map", "x.dat", "nul\0"] {
            assert!(
                matches!(SnapshotId::new(bad), Err(SnapError::InvalidSnapshotId(_))),
                "{bad:?} accepted"
            );
        }
        assert!(SnapshotId::new("a".repeat(NAME_MAX + 1)).is_err());
    }

    #[test]
    fn test_no_snapshots_is_not_an_error() {
        let (dir, chain) = chain();
        assert!(dir.path().join("snapshots").is_dir());
        assert_eq!(chain.get_latest().unwrap(), None);
        assert!(chain.chain().unwrap().is_empty());
    }

    #[test]
    fn test_create_links_snapshots() {
        let (dir, chain) = chain();
        chain.create(&id("s1")).unwrap();
        chain.create(&id("s2")).unwrap();
        chain.create(&id("s3")).unwrap();

        assert_eq!(chain.get_latest().unwrap(), Some(id("s3")));
        assert_eq!(chain.cached_latest(), Some(id("s3")));
        assert_eq!(chain.predecessor(&id("s3")).unwrap(), Some(id("s2")));
        assert_eq!(chain.predecessor(&id("s1")).unwrap(), None);
        assert_eq!(chain.chain().unwrap(), vec![id("s3"), id("s2"), id("s1")]);
        assert_eq!(
            chain.layers_from(&id("s2")).unwrap(),
            vec![id("s2"), id("s3")]
        );

        let latest = fs::read(dir.path().join("snapshots/.hid")).unwrap();
        assert_eq!(latest.len(), PATH_MAX);
        assert_eq!(&latest[..3], b"s3");
        assert_eq!(latest[3], 0);
    }

    #[test]
    fn test_duplicate_create_is_rejected() {
        let (_dir, chain) = chain();
        chain.create(&id("s1")).unwrap();
        assert!(matches!(
            chain.create(&id("s1")),
            Err(SnapError::AlreadyExists { .. })
        ));
        assert_eq!(chain.chain().unwrap(), vec![id("s1")]);
    }

    #[test]
    fn test_failed_create_leaves_no_trace() {
        let (dir, chain) = chain();
        chain.create(&id("s1")).unwrap();

        // a directory squatting on the back-pointer path makes its write fail
        fs::create_dir(dir.path().join("snapshots/s2.hid")).unwrap();
        assert!(chain.create(&id("s2")).is_err());

        assert!(!dir.path().join("snapshots/s2").exists());
        assert_eq!(chain.get_latest().unwrap(), Some(id("s1")));
    }

    #[test]
    fn test_namespace_root_must_be_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("snapshots"), b"not a dir").unwrap();
        assert!(matches!(
            SnapshotChain::open(PathResolver::new(dir.path())),
            Err(SnapError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_corrupt_pointer_files() {
        let (dir, chain) = chain();
        fs::write(dir.path().join("snapshots/.hid"), b"short").unwrap();
        assert!(chain.get_latest().unwrap_err().is_consistency_fault());

        fs::write(dir.path().join("snapshots/.hid"), vec![b'a'; PATH_MAX]).unwrap();
        assert!(chain.get_latest().unwrap_err().is_consistency_fault());
    }

    #[test]
    fn test_cycle_is_detected() {
        let (dir, chain) = chain();
        chain.create(&id("s1")).unwrap();
        chain.create(&id("s2")).unwrap();
        // s1 now claims s2 came before it
        write_pointer_file(&dir.path().join("snapshots/s1.hid"), "s2").unwrap();
        assert!(chain.chain().unwrap_err().is_consistency_fault());
    }

    #[test]
    fn test_xattr_probe_does_not_panic() {
        let (_dir, chain) = chain();
        let _ = chain.check_xattr_support();
    }
}
