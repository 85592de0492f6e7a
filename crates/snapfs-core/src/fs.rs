//! Path-level operations over the live tree and the snapshot namespace.
//!
//! [`SnapFs`] classifies every virtual path, routes live-tree mutations
//! through block preservation and keeps the snapshot namespace read-only.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::ops::ControlFlow;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use snapfs_config::{log_block_debug, log_chain_info, Config};
use tracing::instrument;

use crate::block::{read_full_at, record_header, BlockStore, Companions};
use crate::chain::{SnapshotChain, SnapshotId};
use crate::lock::LockManager;
use crate::map::{FileStat, MapHeader};
use crate::overlay::{Filler, Overlay};
use crate::path::{PathResolver, VirtualPath};
use crate::versioned::{resolve_stat, SnapshotFile};
use crate::{Result, SnapError};

/// Which snapshot a live handle's companions belong to.
#[derive(Debug, Default)]
struct Versioning {
    snapshot: Option<SnapshotId>,
    companions: Option<Arc<Companions>>,
}

/// An open live-tree file.
#[derive(Debug)]
pub struct MainFile {
    rel: String,
    file: File,
    writable: bool,
    versioning: Mutex<Versioning>,
}

impl MainFile {
    pub fn path(&self) -> &str {
        &self.rel
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

/// An open file handle, tagged by where it lives.
#[derive(Debug)]
pub enum OpenFile {
    Main(MainFile),
    Snapshot(SnapshotFile),
}

impl OpenFile {
    pub fn kind(&self) -> &'static str {
        match self {
            OpenFile::Main(_) => "main",
            OpenFile::Snapshot(_) => "snapshot file",
        }
    }
}

/// An open directory handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDir {
    Main { rel: String },
    SnapshotRoot,
    Snapshot { id: SnapshotId, rel: String },
}

/// The versioned filesystem over one backing root.
#[derive(Debug)]
pub struct SnapFs {
    resolver: PathResolver,
    chain: SnapshotChain,
    store: BlockStore,
    overlay: Overlay,
    block_size: u64,
    cross_process: bool,
    /// Held shared by preserve + write, exclusively by snapshot creation.
    gate: RwLock<()>,
}

impl SnapFs {
    /// Open the filesystem rooted at `config.storage.root`. The root must
    /// exist; the snapshot namespace is created on demand.
    pub fn new(config: &Config) -> Result<Self> {
        let resolver = PathResolver::new(&config.storage.root);
        let chain = SnapshotChain::open(resolver.clone())?;
        let locks = Arc::new(LockManager::new(config.locking.table_capacity));
        let store = BlockStore::new(&config.storage, locks, config.locking.cross_process);
        Ok(Self {
            overlay: Overlay::new(resolver.clone()),
            resolver,
            chain,
            store,
            block_size: u64::from(config.storage.block_size),
            cross_process: config.locking.cross_process,
            gate: RwLock::new(()),
        })
    }

    pub fn chain(&self) -> &SnapshotChain {
        &self.chain
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Take snapshot `id` of the live tree.
    pub fn snapshot(&self, id: &str) -> Result<SnapshotId> {
        let id = SnapshotId::new(id)?;
        let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        self.chain.create(&id)?;
        Ok(id)
    }

    pub fn getattr(&self, vpath: &str) -> Result<FileStat> {
        match VirtualPath::parse(vpath) {
            VirtualPath::Main(rel) => lstat(&self.resolver.map_path(rel)?, vpath),
            VirtualPath::SnapshotRoot => lstat(self.resolver.snapshot_dir(), vpath),
            VirtualPath::Snapshot { id } => {
                let id = self.committed(id, vpath)?;
                lstat(&self.resolver.snapshot_root(id.as_str()), vpath)
            }
            VirtualPath::SnapshotEntry { id, rel } => {
                let id = self.committed(id, vpath)?;
                let layers = self.chain.layers_from(&id)?;
                resolve_stat(&self.resolver, &layers, rel)
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub fn open(&self, vpath: &str, writable: bool) -> Result<OpenFile> {
        match VirtualPath::parse(vpath) {
            VirtualPath::Main(rel) => {
                let real = self.resolver.map_path(rel)?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(writable)
                    .open(&real)
                    .map_err(|e| not_found_or(e, vpath))?;
                Ok(OpenFile::Main(MainFile {
                    rel: rel.to_string(),
                    file,
                    writable,
                    versioning: Mutex::new(Versioning::default()),
                }))
            }
            _ if writable => Err(read_only(vpath)),
            VirtualPath::SnapshotEntry { id, rel } => {
                let id = self.committed(id, vpath)?;
                let file = SnapshotFile::open(&self.resolver, &self.chain, &id, rel, self.block_size)?;
                Ok(OpenFile::Snapshot(file))
            }
            VirtualPath::SnapshotRoot | VirtualPath::Snapshot { .. } => {
                Err(io::Error::from_raw_os_error(libc::EISDIR).into())
            }
        }
    }

    pub fn opendir(&self, vpath: &str) -> Result<OpenDir> {
        let stat = self.getattr(vpath)?;
        if !stat.is_dir() {
            return Err(SnapError::NotADirectory {
                path: vpath.into(),
            });
        }
        Ok(match VirtualPath::parse(vpath) {
            VirtualPath::Main(rel) => OpenDir::Main {
                rel: rel.to_string(),
            },
            VirtualPath::SnapshotRoot => OpenDir::SnapshotRoot,
            VirtualPath::Snapshot { id } => OpenDir::Snapshot {
                id: SnapshotId::new(id)?,
                rel: "/".to_string(),
            },
            VirtualPath::SnapshotEntry { id, rel } => OpenDir::Snapshot {
                id: SnapshotId::new(id)?,
                rel: rel.to_string(),
            },
        })
    }

    pub fn readdir(&self, dir: &OpenDir, filler: &mut Filler<'_>) -> Result<()> {
        match dir {
            OpenDir::Main { rel } => self.overlay.readdir_main(rel, filler),
            OpenDir::SnapshotRoot => self.overlay.readdir_snapshot_root(&self.chain, filler),
            OpenDir::Snapshot { id, rel } => {
                self.overlay.readdir_snapshot(&self.chain, id, rel, filler)
            }
        }
    }

    /// Convenience listing of a whole directory, in name order.
    pub fn list(&self, vpath: &str) -> Result<Vec<(String, FileStat)>> {
        let dir = self.opendir(vpath)?;
        let mut entries = Vec::new();
        self.readdir(&dir, &mut |name, stat| {
            if let Some(stat) = stat {
                entries.push((name.to_string(), *stat));
            }
            ControlFlow::Continue(())
        })?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    pub fn read(&self, handle: &OpenFile, size: usize, offset: u64) -> Result<Vec<u8>> {
        match handle {
            OpenFile::Main(main) => {
                let mut buf = Vec::new();
                buf.try_reserve_exact(size)
                    .map_err(|_| SnapError::OutOfMemory { bytes: size })?;
                buf.resize(size, 0);
                let n = read_full_at(&main.file, &mut buf, offset)?;
                buf.truncate(n);
                Ok(buf)
            }
            OpenFile::Snapshot(file) => file.read_versioned(size, offset),
        }
    }

    /// Preserve the blocks `data` overwrites, then write it.
    #[instrument(skip(self, handle, data), fields(len = data.len()), level = "debug")]
    pub fn write(&self, handle: &OpenFile, data: &[u8], offset: u64) -> Result<usize> {
        let main = self.writable_main(handle, "write")?;
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(companions) = self.validate(main)? {
            self.store
                .write_preserve(&main.file, &companions, data.len() as u64, offset)?;
        }
        main.file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    /// Preserve the blocks a shrink would cut, then resize.
    #[instrument(skip(self, handle), level = "debug")]
    pub fn truncate(&self, handle: &OpenFile, size: u64) -> Result<()> {
        let main = self.writable_main(handle, "truncate")?;
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(companions) = self.validate(main)? {
            self.store.truncate_preserve(&main.file, &companions, size)?;
        }
        main.file.set_len(size)?;
        Ok(())
    }

    /// Truncate by path, for callers without an open handle.
    pub fn truncate_path(&self, vpath: &str, size: u64) -> Result<()> {
        let handle = self.open(vpath, true)?;
        self.truncate(&handle, size)?;
        self.release(handle)
    }

    pub fn fsync(&self, handle: &OpenFile, datasync: bool) -> Result<()> {
        let OpenFile::Main(main) = handle else {
            return Ok(());
        };
        if datasync {
            main.file.sync_data()?;
        } else {
            main.file.sync_all()?;
        }
        let companions = self.lock_versioning(main).companions.clone();
        if let Some(companions) = companions {
            companions.sync(datasync)?;
        }
        Ok(())
    }

    pub fn release(&self, handle: OpenFile) -> Result<()> {
        if let OpenFile::Main(main) = &handle {
            log_block_debug!("Released handle", path = main.rel.as_str());
        }
        Ok(())
    }

    /// Create (or open) a live file, recording that the name is new.
    #[instrument(skip(self), level = "debug")]
    pub fn create(&self, vpath: &str, mode: u32) -> Result<OpenFile> {
        let rel = self.main_only(vpath)?;
        let real = self.resolver.map_path(rel)?;
        {
            let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
            if !exists(&real)? {
                self.record_new_name(rel)?;
            }
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .mode(mode)
                .open(&real)
                .map_err(|e| not_found_or(e, vpath))?;
        }
        self.open(vpath, true)
    }

    /// Create a live directory, or take a snapshot for `/snapshots/<id>`.
    #[instrument(skip(self), level = "debug")]
    pub fn mkdir(&self, vpath: &str, mode: u32) -> Result<()> {
        match VirtualPath::parse(vpath) {
            VirtualPath::Main(rel) => {
                let real = self.resolver.map_path(rel)?;
                let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
                if exists(&real)? {
                    return Err(SnapError::AlreadyExists {
                        path: vpath.to_string(),
                    });
                }
                self.record_new_name(rel)?;
                DirBuilder::new()
                    .mode(mode)
                    .create(&real)
                    .map_err(|e| not_found_or(e, vpath))
            }
            VirtualPath::Snapshot { id } => {
                let id = self.snapshot(id)?;
                log_chain_info!("Snapshot taken via mkdir", id = id.as_str());
                Ok(())
            }
            VirtualPath::SnapshotRoot => Err(SnapError::AlreadyExists {
                path: vpath.to_string(),
            }),
            VirtualPath::SnapshotEntry { .. } => Err(read_only(vpath)),
        }
    }

    /// Remove a live file after preserving all of its snapshot-time blocks.
    #[instrument(skip(self), level = "debug")]
    pub fn unlink(&self, vpath: &str) -> Result<()> {
        let rel = self.main_only(vpath)?;
        let real = self.resolver.map_path(rel)?;
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        let stat = lstat(&real, vpath)?;
        if stat.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::EISDIR).into());
        }

        if let Some(latest) = self.current_latest()? {
            if stat.is_file() {
                let main = File::open(&real)?;
                if let Some(companions) =
                    Companions::open_or_create(&self.resolver, &latest, rel, Some(&stat))?
                {
                    self.store.truncate_preserve(&main, &companions, 0)?;
                }
            } else {
                record_header(&self.resolver, &latest, rel, &MapHeader::live(stat))?;
            }
        }
        fs::remove_file(&real)?;
        Ok(())
    }

    /// Remove an empty live directory, recording it in the latest snapshot.
    #[instrument(skip(self), level = "debug")]
    pub fn rmdir(&self, vpath: &str) -> Result<()> {
        let rel = self.main_only(vpath)?;
        let real = self.resolver.map_path(rel)?;
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        let stat = lstat(&real, vpath)?;
        if !stat.is_dir() {
            return Err(SnapError::NotADirectory {
                path: vpath.into(),
            });
        }
        if fs::read_dir(&real)?.next().is_some() {
            return Err(io::Error::from_raw_os_error(libc::ENOTEMPTY).into());
        }
        if let Some(latest) = self.current_latest()? {
            record_header(&self.resolver, &latest, rel, &MapHeader::live(stat))?;
        }
        fs::remove_dir(&real)?;
        Ok(())
    }

    /// Renames are refused with `EXDEV`; tools fall back to copy + unlink,
    /// which both go through preservation.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.main_only(from)?;
        self.main_only(to)?;
        Err(SnapError::Unsupported("rename"))
    }

    fn writable_main<'h>(&self, handle: &'h OpenFile, operation: &'static str) -> Result<&'h MainFile> {
        match handle {
            OpenFile::Main(main) if main.writable => Ok(main),
            OpenFile::Main(_) => Err(io::Error::from_raw_os_error(libc::EBADF).into()),
            other => Err(SnapError::WrongHandle {
                operation,
                kind: other.kind(),
            }),
        }
    }

    fn main_only<'p>(&self, vpath: &'p str) -> Result<&'p str> {
        match VirtualPath::parse(vpath) {
            VirtualPath::Main(rel) => Ok(rel),
            _ => Err(read_only(vpath)),
        }
    }

    fn committed(&self, id: &str, vpath: &str) -> Result<SnapshotId> {
        let id = SnapshotId::new(id).map_err(|_| SnapError::not_found(vpath))?;
        if self.chain.is_committed(&id)? {
            Ok(id)
        } else {
            Err(SnapError::not_found(vpath))
        }
    }

    fn current_latest(&self) -> Result<Option<SnapshotId>> {
        if self.cross_process {
            self.chain.get_latest()
        } else {
            Ok(self.chain.cached_latest())
        }
    }

    /// Tombstone a name that is about to appear in the live tree.
    fn record_new_name(&self, rel: &str) -> Result<()> {
        if let Some(latest) = self.current_latest()? {
            record_header(&self.resolver, &latest, rel, &MapHeader::tombstone())?;
        }
        Ok(())
    }

    fn lock_versioning<'a>(&self, main: &'a MainFile) -> std::sync::MutexGuard<'a, Versioning> {
        main.versioning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring a handle's companions up to date with the latest snapshot.
    fn validate(&self, main: &MainFile) -> Result<Option<Arc<Companions>>> {
        let latest = self.current_latest()?;
        let mut state = self.lock_versioning(main);
        if state.snapshot != latest {
            state.companions = match &latest {
                Some(id) => {
                    let stat = FileStat::from_metadata(&main.file.metadata()?);
                    Companions::open_or_create(&self.resolver, id, &main.rel, Some(&stat))?
                        .map(Arc::new)
                }
                None => None,
            };
            state.snapshot = latest;
        }
        Ok(state.companions.clone())
    }
}

fn read_only(vpath: &str) -> SnapError {
    SnapError::ReadOnly {
        path: vpath.to_string(),
    }
}

fn not_found_or(e: io::Error, vpath: &str) -> SnapError {
    if e.kind() == io::ErrorKind::NotFound {
        SnapError::not_found(vpath)
    } else {
        e.into()
    }
}

fn lstat(real: &std::path::Path, vpath: &str) -> Result<FileStat> {
    FileStat::lstat(real).map_err(|e| not_found_or(e, vpath))
}

fn exists(real: &std::path::Path) -> Result<bool> {
    match fs::symlink_metadata(real) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapfs_config::testing::TestEnvironment;

    fn setup(block_size: u32) -> (TestEnvironment, SnapFs) {
        let env = TestEnvironment::with_block_size(block_size).unwrap();
        let fs = SnapFs::new(&env.config()).unwrap();
        (env, fs)
    }

    fn read_all(fs: &SnapFs, vpath: &str) -> Vec<u8> {
        let handle = fs.open(vpath, false).unwrap();
        fs.read(&handle, 1 << 20, 0).unwrap()
    }

    fn names(fs: &SnapFs, vpath: &str) -> Vec<String> {
        fs.list(vpath).unwrap().into_iter().map(|(n, _)| n).collect()
    }

    #[test]
    fn test_write_after_snapshot_keeps_old_version() {
        let (env, fs) = setup(4096);
        env.create_file("/doc.txt", b"version one").unwrap();
        fs.snapshot("s1").unwrap();

        let handle = fs.open("/doc.txt", true).unwrap();
        fs.write(&handle, b"VERSION", 0).unwrap();
        fs.release(handle).unwrap();

        assert_eq!(read_all(&fs, "/doc.txt"), b"VERSION one");
        assert_eq!(read_all(&fs, "/snapshots/s1/doc.txt"), b"version one");
    }

    #[test]
    fn test_handle_follows_new_snapshots() {
        let (env, fs) = setup(512);
        env.create_file("/f", &[b'a'; 512]).unwrap();
        let handle = fs.open("/f", true).unwrap();

        fs.snapshot("s1").unwrap();
        fs.write(&handle, &[b'b'; 512], 0).unwrap();
        fs.snapshot("s2").unwrap();
        fs.write(&handle, &[b'c'; 512], 0).unwrap();

        assert_eq!(read_all(&fs, "/snapshots/s1/f"), vec![b'a'; 512]);
        assert_eq!(read_all(&fs, "/snapshots/s2/f"), vec![b'b'; 512]);
        assert_eq!(read_all(&fs, "/f"), vec![b'c'; 512]);
    }

    #[test]
    fn test_truncate_and_unlink_preserve_content() {
        let (env, fs) = setup(512);
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 97) as u8).collect();
        env.create_file("/t", &data).unwrap();
        env.create_file("/u", &data).unwrap();
        fs.snapshot("s1").unwrap();

        fs.truncate_path("/t", 100).unwrap();
        fs.unlink("/u").unwrap();

        assert_eq!(read_all(&fs, "/t").len(), 100);
        assert_eq!(read_all(&fs, "/snapshots/s1/t"), data);
        assert_eq!(read_all(&fs, "/snapshots/s1/u"), data);
        assert!(matches!(fs.getattr("/u"), Err(SnapError::NotFound { .. })));
        assert_eq!(names(&fs, "/snapshots/s1"), vec!["t", "u"]);
    }

    #[test]
    fn test_new_names_are_hidden_from_older_snapshots() {
        let (env, fs) = setup(4096);
        env.create_file("/old", b"x").unwrap();
        fs.snapshot("s1").unwrap();

        let handle = fs.create("/new", 0o644).unwrap();
        fs.write(&handle, b"fresh", 0).unwrap();
        fs.mkdir("/dir", 0o755).unwrap();

        assert_eq!(names(&fs, "/snapshots/s1"), vec!["old"]);
        assert!(matches!(
            fs.getattr("/snapshots/s1/new"),
            Err(SnapError::NotFound { .. })
        ));
        assert_eq!(names(&fs, "/"), vec!["dir", "new", "old", "snapshots"]);
    }

    #[test]
    fn test_removed_directory_stays_in_snapshot() {
        let (env, fs) = setup(4096);
        env.create_file("/d/inner", b"keep").unwrap();
        fs.snapshot("s1").unwrap();

        fs.unlink("/d/inner").unwrap();
        fs.rmdir("/d").unwrap();

        assert!(fs.getattr("/snapshots/s1/d").unwrap().is_dir());
        assert_eq!(names(&fs, "/snapshots/s1/d"), vec!["inner"]);
        assert_eq!(read_all(&fs, "/snapshots/s1/d/inner"), b"keep");
    }

    #[test]
    fn test_snapshot_namespace_is_read_only() {
        let (env, fs) = setup(4096);
        env.create_file("/f", b"x").unwrap();
        fs.snapshot("s1").unwrap();

        assert!(matches!(fs.open("/snapshots/s1/f", true), Err(SnapError::ReadOnly { .. })));
        assert!(matches!(fs.unlink("/snapshots/s1/f"), Err(SnapError::ReadOnly { .. })));
        assert!(matches!(fs.mkdir("/snapshots/s1/d", 0o755), Err(SnapError::ReadOnly { .. })));
        assert!(matches!(fs.create("/snapshots/s1/g", 0o644), Err(SnapError::ReadOnly { .. })));

        let handle = fs.open("/snapshots/s1/f", false).unwrap();
        let err = fs.write(&handle, b"y", 0).unwrap_err();
        assert!(matches!(err, SnapError::WrongHandle { operation: "write", .. }));
        assert!(matches!(fs.truncate(&handle, 0), Err(SnapError::WrongHandle { .. })));
    }

    #[test]
    fn test_mkdir_in_namespace_takes_snapshot() {
        let (env, fs) = setup(4096);
        env.create_file("/f", b"x").unwrap();
        fs.mkdir("/snapshots/monday", 0o755).unwrap();
        fs.mkdir("/snapshots/tuesday", 0o755).unwrap();

        assert_eq!(names(&fs, "/snapshots"), vec!["monday", "tuesday"]);
        assert_eq!(
            fs.chain().chain().unwrap(),
            vec![SnapshotId::new("tuesday").unwrap(), SnapshotId::new("monday").unwrap()]
        );
        assert_eq!(names(&fs, "/snapshots/monday"), vec!["f"]);
    }

    #[test]
    fn test_rename_is_refused() {
        let (env, fs) = setup(4096);
        env.create_file("/a", b"x").unwrap();
        let err = fs.rename("/a", "/b").unwrap_err();
        assert_eq!(err.errno(), libc::EXDEV);
        assert!(matches!(fs.rename("/a", "/snapshots/x"), Err(SnapError::ReadOnly { .. })));
    }

    #[test]
    fn test_unknown_snapshot_paths() {
        let (_env, fs) = setup(4096);
        assert!(matches!(fs.getattr("/snapshots/none"), Err(SnapError::NotFound { .. })));
        assert!(matches!(fs.open("/snapshots/none/f", false), Err(SnapError::NotFound { .. })));
        assert!(fs.getattr("/snapshots").unwrap().is_dir());
    }

    #[test]
    fn test_interrupted_snapshot_is_neither_listed_nor_reachable() {
        let (_env, fs) = setup(4096);
        fs.snapshot("s1").unwrap();
        let resolver = fs.resolver();
        std::fs::create_dir(resolver.snapshot_root("half")).unwrap();
        std::fs::write(resolver.back_pointer_path("half"), vec![0u8; crate::path::PATH_MAX])
            .unwrap();

        assert_eq!(names(&fs, "/snapshots"), vec!["s1"]);
        assert!(matches!(fs.getattr("/snapshots/half"), Err(SnapError::NotFound { .. })));
        assert!(matches!(fs.opendir("/snapshots/half"), Err(SnapError::NotFound { .. })));
    }
}
