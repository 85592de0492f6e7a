//! Virtual path classification and virtual → real path mapping.
//!
//! The virtual tree is the backing root, with one reserved subtree,
//! `/snapshots`, that exposes the read-only snapshot chain.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::{Result, SnapError};

/// Name of the reserved namespace directory, both virtually and on disk.
pub const SNAPSHOT_DIR: &str = "snapshots";
/// Virtual path of the namespace root.
pub const SNAPSHOT_VIRTUAL_ROOT: &str = "/snapshots";
/// Suffix of per-file block-pointer maps.
pub const MAP_SUFFIX: &str = ".map";
/// Suffix of per-file preserved-block logs.
pub const LOG_SUFFIX: &str = ".dat";
/// Suffix of chain pointer files; `.hid` alone is the latest pointer.
pub const HID_SUFFIX: &str = ".hid";
/// Longest real path the store will construct, including the NUL.
pub const PATH_MAX: usize = 4096;
/// Longest single name component (snapshot ids included).
pub const NAME_MAX: usize = 255;

/// A decomposed virtual path. Borrows from the input; never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualPath<'a> {
    /// Anywhere in the live tree
    Main(&'a str),
    /// `/snapshots` itself (also `/snapshots/` and `/snapshots//...`)
    SnapshotRoot,
    /// `/snapshots/ID` or `/snapshots/ID/`
    Snapshot { id: &'a str },
    /// `/snapshots/ID/rest`; `rel` keeps its leading `/`
    SnapshotEntry { id: &'a str, rel: &'a str },
}

impl<'a> VirtualPath<'a> {
    pub fn parse(path: &'a str) -> Self {
        if !is_in_snapshot_space(path) {
            return VirtualPath::Main(path);
        }

        // "" or "/..." after the namespace root
        let rest = &path[SNAPSHOT_VIRTUAL_ROOT.len()..];
        if rest.len() <= 1 {
            return VirtualPath::SnapshotRoot;
        }

        let after = &rest[1..];
        match after.find('/') {
            None => VirtualPath::Snapshot { id: after },
            Some(0) => VirtualPath::SnapshotRoot,
            Some(i) if i == after.len() - 1 => VirtualPath::Snapshot { id: &after[..i] },
            Some(i) => VirtualPath::SnapshotEntry {
                id: &after[..i],
                rel: &after[i..],
            },
        }
    }

    pub fn is_snapshot_space(&self) -> bool {
        !matches!(self, VirtualPath::Main(_))
    }
}

/// True for `/snapshots` and anything below it, but not `/snapshotsX`.
pub fn is_in_snapshot_space(path: &str) -> bool {
    path.strip_prefix(SNAPSHOT_VIRTUAL_ROOT)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// What a physical entry inside a snapshot layer stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind<'a> {
    /// A preserved-block log; never listed
    Log,
    /// A map file tracking the logical name it carries
    Tracked(&'a str),
    /// Anything else: intermediate directories, stray files
    Hidden,
}

impl<'a> EntryKind<'a> {
    pub fn classify(name: &'a str) -> Self {
        if name.len() > LOG_SUFFIX.len() && name.ends_with(LOG_SUFFIX) {
            EntryKind::Log
        } else if let Some(logical) = name.strip_suffix(MAP_SUFFIX).filter(|l| !l.is_empty()) {
            EntryKind::Tracked(logical)
        } else {
            EntryKind::Hidden
        }
    }
}

/// Append a suffix to the final component of a path.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(path.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

/// Maps virtual paths onto the backing root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    snapshot_dir: PathBuf,
}

impl PathResolver {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        let snapshot_dir = root.join(SNAPSHOT_DIR);
        Self { root, snapshot_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Real directory backing `/snapshots`.
    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Real path of a virtual path, with no classification applied.
    pub fn map_path(&self, virtual_path: &str) -> Result<PathBuf> {
        Self::check_len(&self.root, virtual_path, 0)?;
        Ok(Self::join(&self.root, virtual_path))
    }

    /// Root directory of one snapshot.
    pub fn snapshot_root(&self, id: &str) -> PathBuf {
        self.snapshot_dir.join(id)
    }

    /// `snapshots/.hid`
    pub fn latest_pointer_path(&self) -> PathBuf {
        self.snapshot_dir.join(HID_SUFFIX)
    }

    /// `snapshots/<id>.hid`
    pub fn back_pointer_path(&self, id: &str) -> PathBuf {
        with_suffix(&self.snapshot_root(id), HID_SUFFIX)
    }

    /// Path of `rel` inside snapshot `id` (the directory layer for listings).
    pub fn snapshot_entry_path(&self, id: &str, rel: &str) -> Result<PathBuf> {
        let base = self.snapshot_root(id);
        Self::check_len(&base, rel, 0)?;
        Ok(Self::join(&base, rel))
    }

    /// Map and log paths for the main-space file `rel` inside snapshot `id`.
    pub fn companion_paths(&self, id: &str, rel: &str) -> Result<(PathBuf, PathBuf)> {
        let base = self.snapshot_root(id);
        Self::check_len(&base, rel, MAP_SUFFIX.len().max(LOG_SUFFIX.len()))?;
        let entry = Self::join(&base, rel);
        Ok((
            with_suffix(&entry, MAP_SUFFIX),
            with_suffix(&entry, LOG_SUFFIX),
        ))
    }

    fn join(base: &Path, rel: &str) -> PathBuf {
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            base.to_path_buf()
        } else {
            base.join(rel)
        }
    }

    fn check_len(base: &Path, rel: &str, suffix_len: usize) -> Result<()> {
        // base + '/' + rel + suffix + NUL
        let len = base.as_os_str().len() + 1 + rel.len() + suffix_len;
        if len >= PATH_MAX {
            return Err(SnapError::NameTooLong {
                len,
                limit: PATH_MAX,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_space_paths() {
        assert_eq!(VirtualPath::parse("/"), VirtualPath::Main("/"));
        assert_eq!(VirtualPath::parse("/docs/a"), VirtualPath::Main("/docs/a"));
        assert_eq!(
            VirtualPath::parse("/snapshotsX/a"),
            VirtualPath::Main("/snapshotsX/a")
        );
        assert!(!VirtualPath::parse("/snapshot").is_snapshot_space());
    }

    #[test]
    fn test_namespace_root_forms() {
        assert_eq!(VirtualPath::parse("/snapshots"), VirtualPath::SnapshotRoot);
        assert_eq!(VirtualPath::parse("/snapshots/"), VirtualPath::SnapshotRoot);
        assert_eq!(VirtualPath::parse("/snapshots//"), VirtualPath::SnapshotRoot);
        assert_eq!(
            VirtualPath::parse("/snapshots//x/y"),
            VirtualPath::SnapshotRoot
        );
    }

    #[test]
    fn test_snapshot_id_forms() {
        assert_eq!(
            VirtualPath::parse("/snapshots/s1"),
            VirtualPath::Snapshot { id: "s1" }
        );
        assert_eq!(
            VirtualPath::parse("/snapshots/s1/"),
            VirtualPath::Snapshot { id: "s1" }
        );
    }

    #[test]
    fn test_snapshot_entry_forms() {
        assert_eq!(
            VirtualPath::parse("/snapshots/s1/docs/a.txt"),
            VirtualPath::SnapshotEntry {
                id: "s1",
                rel: "/docs/a.txt"
            }
        );
        assert_eq!(
            VirtualPath::parse("/snapshots/2024-01/x/"),
            VirtualPath::SnapshotEntry {
                id: "2024-01",
                rel: "/x/"
            }
        );
    }

    #[test]
    fn test_entry_classification() {
        assert_eq!(EntryKind::classify("a.txt.dat"), EntryKind::Log);
        assert_eq!(
            EntryKind::classify("a.txt.map"),
            EntryKind::Tracked("a.txt")
        );
        assert_eq!(EntryKind::classify("docs"), EntryKind::Hidden);
        assert_eq!(EntryKind::classify(".map"), EntryKind::Hidden);
        assert_eq!(EntryKind::classify("notes.txt"), EntryKind::Hidden);
    }

    #[test]
    fn test_resolver_paths() {
        let r = PathResolver::new("/data");
        assert_eq!(r.map_path("/a/b").unwrap(), PathBuf::from("/data/a/b"));
        assert_eq!(r.map_path("/").unwrap(), PathBuf::from("/data"));
        assert_eq!(r.snapshot_dir(), Path::new("/data/snapshots"));
        assert_eq!(
            r.latest_pointer_path(),
            PathBuf::from("/data/snapshots/.hid")
        );
        assert_eq!(
            r.back_pointer_path("s1"),
            PathBuf::from("/data/snapshots/s1.hid")
        );
        let (map, log) = r.companion_paths("s1", "/docs/a.txt").unwrap();
        assert_eq!(map, PathBuf::from("/data/snapshots/s1/docs/a.txt.map"));
        assert_eq!(log, PathBuf::from("/data/snapshots/s1/docs/a.txt.dat"));
    }

    #[test]
    fn test_name_too_long() {
        let r = PathResolver::new("/data");
        let long = format!("/{}", "x".repeat(PATH_MAX));
        assert!(matches!(
            r.map_path(&long),
            Err(SnapError::NameTooLong { .. })
        ));
        assert!(matches!(
            r.companion_paths("s1", &long),
            Err(SnapError::NameTooLong { .. })
        ));
    }
}
