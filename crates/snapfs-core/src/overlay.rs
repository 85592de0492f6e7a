//! Directory listings merged across snapshot layers.
//!
//! Listing `/snapshots/S/dir` walks `S`, then every newer snapshot, then the
//! live tree. The first layer that mentions a name settles it: a live map
//! header shows the name with its recorded stat, a tombstone hides it from
//! every later layer.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::path::Path;

use snapfs_config::log_overlay_debug;
use tracing::instrument;

use crate::chain::{SnapshotChain, SnapshotId};
use crate::map::{FileStat, MapFile};
use crate::path::{EntryKind, PathResolver, SNAPSHOT_DIR};
use crate::{Result, SnapError};

/// Receives one visible entry; `Break` means the caller's buffer is full.
pub type Filler<'f> = dyn FnMut(&str, Option<&FileStat>) -> ControlFlow<()> + 'f;

#[derive(Debug, Clone)]
pub struct Overlay {
    resolver: PathResolver,
}

impl Overlay {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    /// List `/snapshots`: one entry per committed snapshot, oldest first.
    /// A directory left behind by an interrupted `create` is not listed.
    pub fn readdir_snapshot_root(
        &self,
        chain: &SnapshotChain,
        filler: &mut Filler<'_>,
    ) -> Result<()> {
        for id in chain.chain()?.iter().rev() {
            let root = self.resolver.snapshot_root(id.as_str());
            let stat = FileStat::lstat(&root).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    SnapError::consistency(format!("snapshot {id} has no root directory"))
                } else {
                    SnapError::Io(e)
                }
            })?;
            if filler(id.as_str(), Some(&stat)).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// List a live directory as is.
    pub fn readdir_main(&self, rel: &str, filler: &mut Filler<'_>) -> Result<()> {
        let mut resolved = HashSet::new();
        self.list_main(rel, &mut resolved, filler)?;
        Ok(())
    }

    /// List `/snapshots/<id><rel>`.
    #[instrument(skip(self, chain, filler), level = "debug")]
    pub fn readdir_snapshot(
        &self,
        chain: &SnapshotChain,
        id: &SnapshotId,
        rel: &str,
        filler: &mut Filler<'_>,
    ) -> Result<()> {
        let layers = chain.layers_from(id)?;
        let mut resolved: HashSet<String> = HashSet::new();
        if rel.trim_matches('/').is_empty() {
            // the live namespace directory is not part of any snapshot
            resolved.insert(SNAPSHOT_DIR.to_string());
        }

        for layer in &layers {
            let dir = self.resolver.snapshot_entry_path(layer.as_str(), rel)?;
            if self.list_layer(&dir, &mut resolved, filler)?.is_break() {
                return Ok(());
            }
        }
        self.list_main(rel, &mut resolved, filler)?;

        log_overlay_debug!(
            "Merged listing",
            snapshot = id.as_str(),
            path = rel,
            layers = layers.len() + 1,
            names = resolved.len()
        );
        Ok(())
    }

    fn list_layer(
        &self,
        dir: &Path,
        resolved: &mut HashSet<String>,
        filler: &mut Filler<'_>,
    ) -> Result<ControlFlow<()>> {
        let Some(entries) = read_dir_if_present(dir)? else {
            return Ok(ControlFlow::Continue(()));
        };
        for entry in entries {
            let entry = entry?;
            let name = entry_name(&entry)?;
            let EntryKind::Tracked(logical) = EntryKind::classify(&name) else {
                continue;
            };
            if !resolved.insert(logical.to_string()) {
                continue;
            }

            let header = MapFile::read_header(&entry.path())?;
            if header.exists && filler(logical, Some(&header.stat)).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn list_main(
        &self,
        rel: &str,
        resolved: &mut HashSet<String>,
        filler: &mut Filler<'_>,
    ) -> Result<ControlFlow<()>> {
        let dir = self.resolver.map_path(rel)?;
        let Some(entries) = read_dir_if_present(&dir)? else {
            return Ok(ControlFlow::Continue(()));
        };
        for entry in entries {
            let entry = entry?;
            let name = entry_name(&entry)?;
            if !resolved.insert(name.clone()) {
                continue;
            }
            let stat = match FileStat::lstat(&entry.path()) {
                Ok(stat) => stat,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if filler(&name, Some(&stat)).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}

/// Names are handed to fillers as UTF-8; any other name fails the listing.
fn entry_name(entry: &fs::DirEntry) -> Result<String> {
    entry
        .file_name()
        .into_string()
        .map_err(|raw| SnapError::unrepresentable(&raw))
}

/// `read_dir`, with a missing directory (or a file in its place) as `None`.
fn read_dir_if_present(dir: &Path) -> Result<Option<fs::ReadDir>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(Some(entries)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Companions;
    use crate::map::MapHeader;
    use crate::path::PATH_MAX;
    use snapfs_config::testing::TestEnvironment;
    use std::collections::BTreeMap;

    fn setup() -> (TestEnvironment, PathResolver, SnapshotChain, Overlay) {
        let env = TestEnvironment::new().unwrap();
        let resolver = PathResolver::new(&env.root);
        let chain = SnapshotChain::open(resolver.clone()).unwrap();
        let overlay = Overlay::new(resolver.clone());
        (env, resolver, chain, overlay)
    }

    fn id(s: &str) -> SnapshotId {
        SnapshotId::new(s).unwrap()
    }

    fn list(overlay: &Overlay, chain: &SnapshotChain, snap: &str, rel: &str) -> BTreeMap<String, u64> {
        let mut names = BTreeMap::new();
        overlay
            .readdir_snapshot(chain, &id(snap), rel, &mut |name, stat| {
                names.insert(name.to_string(), stat.map_or(0, |s| s.size));
                ControlFlow::Continue(())
            })
            .unwrap();
        names
    }

    fn record_deletion(env: &TestEnvironment, resolver: &PathResolver, snap: &str, rel: &str) {
        let stat = FileStat::lstat(&env.real_path(rel)).unwrap();
        Companions::open_or_create(resolver, &id(snap), rel, Some(&stat)).unwrap();
        fs::remove_file(env.real_path(rel)).unwrap();
    }

    #[test]
    fn test_files_created_between_snapshots() {
        let (env, resolver, chain, overlay) = setup();
        chain.create(&id("s1")).unwrap();
        env.create_file("/f", b"v1").unwrap();
        // f appeared after s1
        MapFile::publish(
            &resolver.companion_paths("s1", "/f").unwrap().0,
            &MapHeader::tombstone(),
        )
        .unwrap();
        chain.create(&id("s2")).unwrap();

        // at s2 time f was live; it is deleted afterwards
        record_deletion(&env, &resolver, "s2", "/f");
        env.create_file("/g", b"later").unwrap();
        MapFile::publish(
            &resolver.companion_paths("s2", "/g").unwrap().0,
            &MapHeader::tombstone(),
        )
        .unwrap();

        let s2 = list(&overlay, &chain, "s2", "/");
        assert_eq!(s2.get("f"), Some(&2));
        assert!(!s2.contains_key("g"));
        assert!(!s2.contains_key("snapshots"));

        let s1 = list(&overlay, &chain, "s1", "/");
        assert!(!s1.contains_key("f"));
        assert!(!s1.contains_key("g"));
    }

    #[test]
    fn test_tombstone_in_newer_snapshot_hides_file() {
        let (env, resolver, chain, overlay) = setup();
        env.create_file("/f", b"abc").unwrap();
        chain.create(&id("s1")).unwrap();
        chain.create(&id("s2")).unwrap();
        // s1 saw f live, s2 records it as deleted
        record_deletion(&env, &resolver, "s1", "/f");
        MapFile::publish(
            &resolver.companion_paths("s2", "/f").unwrap().0,
            &MapHeader::tombstone(),
        )
        .unwrap();

        assert_eq!(list(&overlay, &chain, "s1", "/").get("f"), Some(&3));
        assert!(!list(&overlay, &chain, "s2", "/").contains_key("f"));
    }

    #[test]
    fn test_logs_and_plain_entries_in_layers_are_hidden() {
        let (env, resolver, chain, overlay) = setup();
        env.create_file("/d/a", b"1").unwrap();
        chain.create(&id("s1")).unwrap();
        let layer = resolver.snapshot_entry_path("s1", "/d").unwrap();
        fs::create_dir_all(&layer).unwrap();
        fs::write(layer.join("stray"), b"").unwrap();
        fs::write(layer.join("a.dat"), b"").unwrap();

        let names = list(&overlay, &chain, "s1", "/d");
        assert_eq!(names.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_full_filler_stops_without_error() {
        let (env, _resolver, chain, overlay) = setup();
        for n in 0..10 {
            env.create_file(&format!("/f{n}"), b"x").unwrap();
        }
        chain.create(&id("s1")).unwrap();

        let mut seen = 0;
        overlay
            .readdir_snapshot(&chain, &id("s1"), "/", &mut |_, _| {
                seen += 1;
                if seen == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_corrupt_header_aborts_listing() {
        let (env, resolver, chain, overlay) = setup();
        env.create_file("/f", b"x").unwrap();
        chain.create(&id("s1")).unwrap();
        fs::write(resolver.companion_paths("s1", "/f").unwrap().0, b"tiny").unwrap();

        let err = overlay
            .readdir_snapshot(&chain, &id("s1"), "/", &mut |_, _| ControlFlow::Continue(()))
            .unwrap_err();
        assert!(err.is_consistency_fault());
    }

    fn list_root(overlay: &Overlay, chain: &SnapshotChain) -> Vec<String> {
        let mut names = Vec::new();
        overlay
            .readdir_snapshot_root(chain, &mut |name, _| {
                names.push(name.to_string());
                ControlFlow::Continue(())
            })
            .unwrap();
        names
    }

    #[test]
    fn test_snapshot_root_hides_pointer_files() {
        let (_env, _resolver, chain, overlay) = setup();
        chain.create(&id("s1")).unwrap();
        chain.create(&id("s2")).unwrap();

        assert_eq!(list_root(&overlay, &chain), vec!["s1", "s2"]);
    }

    #[test]
    fn test_snapshot_root_hides_uncommitted_directories() {
        let (_env, resolver, chain, overlay) = setup();
        chain.create(&id("s1")).unwrap();
        // interrupted create: directory and back-pointer, latest never moved
        fs::create_dir(resolver.snapshot_root("crashed")).unwrap();
        fs::write(resolver.back_pointer_path("crashed"), vec![0u8; PATH_MAX]).unwrap();
        fs::create_dir(resolver.snapshot_root("stray")).unwrap();

        assert_eq!(list_root(&overlay, &chain), vec!["s1"]);
    }

    #[test]
    fn test_non_utf8_names_fail_the_listing() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (env, _resolver, chain, overlay) = setup();
        env.create_file("/ok", b"1").unwrap();
        fs::write(env.root.join(OsStr::from_bytes(b"caf\xe9")), b"2").unwrap();
        chain.create(&id("s1")).unwrap();

        let live = overlay
            .readdir_main("/", &mut |_, _| ControlFlow::Continue(()))
            .unwrap_err();
        assert_eq!(live.errno(), libc::EILSEQ);

        let snap = overlay
            .readdir_snapshot(&chain, &id("s1"), "/", &mut |_, _| ControlFlow::Continue(()))
            .unwrap_err();
        assert!(matches!(snap, SnapError::UnrepresentableName { .. }));
    }
}
