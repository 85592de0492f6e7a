//! # snapfs-fuse
//!
//! FUSE adapter for snapfs.
//!
//! Translates kernel requests into [`snapfs_core::SnapFs`] calls:
//! - inodes are assigned per virtual path on first lookup
//! - file and directory handles map onto `OpenFile` / `OpenDir`
//! - errors are reported with `SnapError::errno()`

pub mod inode;

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod imp {
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::ops::ControlFlow;
    use std::path::Path;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use fuser::{
        FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
        ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
    };
    use libc::{c_int, ENOENT};
    use snapfs_config::{log_fuse_debug, log_fuse_warn, MountConfig};
    use snapfs_core::{FileStat, OpenDir, OpenFile, SnapError, SnapFs};

    use crate::inode::{InodeTable, ROOT_INO};

    const TTL: Duration = Duration::from_secs(1);

    pub struct SnapFuse {
        fs: SnapFs,
        mount: MountConfig,
        inodes: InodeTable,
        files: HashMap<u64, OpenFile>,
        dirs: HashMap<u64, OpenDir>,
        next_fh: u64,
    }

    impl SnapFuse {
        pub fn new(fs: SnapFs, mount: MountConfig) -> Self {
            Self {
                fs,
                mount,
                inodes: InodeTable::new(),
                files: HashMap::new(),
                dirs: HashMap::new(),
                next_fh: 1,
            }
        }

        /// Mount the filesystem at the given path (Ref: <https://docs.rs/fuser>)
        pub fn mount(self, mountpoint: &Path) -> anyhow::Result<()> {
            let mut opts = vec![
                fuser::MountOption::RW,
                fuser::MountOption::FSName(self.mount.fsname.clone()),
            ];
            if self.mount.allow_other {
                opts.push(fuser::MountOption::AllowOther);
            }
            fuser::mount2(self, mountpoint, &opts)?;
            Ok(())
        }

        fn next_handle(&mut self) -> u64 {
            let fh = self.next_fh;
            self.next_fh += 1;
            fh
        }

        fn attr(&self, ino: u64, stat: &FileStat) -> FileAttr {
            to_attr(ino, stat, self.fs.block_size())
        }

        /// Resolve `name` under `parent` to a path and its stat.
        fn entry(&mut self, parent: u64, name: &OsStr) -> Result<(u64, FileAttr), SnapError> {
            let path = self.child(parent, name)?;
            let stat = self.fs.getattr(&path)?;
            let ino = self.inodes.assign(&path);
            Ok((ino, self.attr(ino, &stat)))
        }

        fn child(&self, parent: u64, name: &OsStr) -> Result<String, SnapError> {
            let name = name.to_str().ok_or_else(|| SnapError::unrepresentable(name))?;
            self.inodes
                .child_path(parent, name)
                .ok_or_else(|| SnapError::NotFound { path: format!("inode {parent}") })
        }

        fn path(&self, ino: u64) -> Result<String, SnapError> {
            self.inodes
                .path(ino)
                .map(str::to_owned)
                .ok_or_else(|| SnapError::NotFound { path: format!("inode {ino}") })
        }
    }

    fn fail(operation: &str, err: &SnapError) -> c_int {
        let errno = err.errno();
        if err.is_consistency_fault() {
            log_fuse_warn!("Consistency fault", operation = operation, error = tracing::field::display(err));
        } else {
            log_fuse_debug!("Request failed", operation = operation, errno = errno);
        }
        errno
    }

    fn timestamp(sec: i64, nsec: i64) -> SystemTime {
        let nanos = u32::try_from(nsec).unwrap_or(0);
        if sec >= 0 {
            UNIX_EPOCH + Duration::new(sec as u64, nanos)
        } else {
            UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs())
        }
    }

    fn to_attr(ino: u64, stat: &FileStat, block_size: u64) -> FileAttr {
        let kind = match stat.mode & libc::S_IFMT {
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            _ => FileType::RegularFile,
        };
        FileAttr {
            ino,
            size: stat.size,
            blocks: stat.blocks,
            atime: timestamp(stat.atime, stat.atime_nsec),
            mtime: timestamp(stat.mtime, stat.mtime_nsec),
            ctime: timestamp(stat.ctime, stat.ctime_nsec),
            crtime: timestamp(stat.ctime, stat.ctime_nsec),
            kind,
            perm: stat.perm(),
            nlink: stat.nlink,
            uid: stat.uid,
            gid: stat.gid,
            rdev: stat.rdev as u32,
            flags: 0,
            blksize: block_size as u32,
        }
    }

    fn kind_of(stat: Option<&FileStat>) -> FileType {
        match stat {
            Some(s) if s.is_dir() => FileType::Directory,
            _ => FileType::RegularFile,
        }
    }

    fn wants_write(flags: i32) -> bool {
        flags & libc::O_ACCMODE != libc::O_RDONLY
    }

    impl Filesystem for SnapFuse {
        fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
            match self.entry(parent, name) {
                Ok((_, attr)) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(fail("lookup", &e)),
            }
        }

        fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
            let result = self.path(ino).and_then(|p| self.fs.getattr(&p));
            match result {
                Ok(stat) => reply.attr(&TTL, &self.attr(ino, &stat)),
                Err(e) => reply.error(fail("getattr", &e)),
            }
        }

        fn setattr(
            &mut self,
            _req: &Request,
            ino: u64,
            _mode: Option<u32>,
            _uid: Option<u32>,
            _gid: Option<u32>,
            size: Option<u64>,
            _atime: Option<TimeOrNow>,
            _mtime: Option<TimeOrNow>,
            _ctime: Option<SystemTime>,
            fh: Option<u64>,
            _crtime: Option<SystemTime>,
            _chgtime: Option<SystemTime>,
            _bkuptime: Option<SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            let result = self.path(ino).and_then(|path| {
                if let Some(size) = size {
                    match fh.and_then(|fh| self.files.get(&fh)) {
                        Some(handle) => self.fs.truncate(handle, size)?,
                        None => self.fs.truncate_path(&path, size)?,
                    }
                }
                self.fs.getattr(&path)
            });
            match result {
                Ok(stat) => reply.attr(&TTL, &self.attr(ino, &stat)),
                Err(e) => reply.error(fail("setattr", &e)),
            }
        }

        fn mkdir(
            &mut self,
            _req: &Request,
            parent: u64,
            name: &OsStr,
            mode: u32,
            umask: u32,
            reply: ReplyEntry,
        ) {
            let result = self
                .child(parent, name)
                .and_then(|path| self.fs.mkdir(&path, mode & !umask))
                .and_then(|()| self.entry(parent, name));
            match result {
                Ok((_, attr)) => reply.entry(&TTL, &attr, 0),
                Err(e) => reply.error(fail("mkdir", &e)),
            }
        }

        fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let result = self.child(parent, name).and_then(|path| {
                self.fs.unlink(&path)?;
                self.inodes.forget(&path);
                Ok(())
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(fail("unlink", &e)),
            }
        }

        fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let result = self.child(parent, name).and_then(|path| {
                self.fs.rmdir(&path)?;
                self.inodes.forget(&path);
                Ok(())
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(fail("rmdir", &e)),
            }
        }

        fn rename(
            &mut self,
            _req: &Request,
            parent: u64,
            name: &OsStr,
            newparent: u64,
            newname: &OsStr,
            _flags: u32,
            reply: ReplyEmpty,
        ) {
            let result = self.child(parent, name).and_then(|from| {
                let to = self.child(newparent, newname)?;
                self.fs.rename(&from, &to)
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(fail("rename", &e)),
            }
        }

        fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
            let result = self
                .path(ino)
                .and_then(|path| self.fs.open(&path, wants_write(flags)));
            match result {
                Ok(handle) => {
                    let fh = self.next_handle();
                    self.files.insert(fh, handle);
                    reply.opened(fh, 0);
                }
                Err(e) => reply.error(fail("open", &e)),
            }
        }

        fn read(
            &mut self,
            _req: &Request,
            _ino: u64,
            fh: u64,
            offset: i64,
            size: u32,
            _flags: c_int,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            let Some(handle) = self.files.get(&fh) else {
                reply.error(libc::EBADF);
                return;
            };
            match self.fs.read(handle, size as usize, offset.max(0) as u64) {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(fail("read", &e)),
            }
        }

        fn write(
            &mut self,
            _req: &Request,
            _ino: u64,
            fh: u64,
            offset: i64,
            data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            let Some(handle) = self.files.get(&fh) else {
                reply.error(libc::EBADF);
                return;
            };
            match self.fs.write(handle, data, offset.max(0) as u64) {
                Ok(n) => reply.written(n as u32),
                Err(e) => reply.error(fail("write", &e)),
            }
        }

        fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
            let Some(handle) = self.files.get(&fh) else {
                reply.error(libc::EBADF);
                return;
            };
            match self.fs.fsync(handle, datasync) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(fail("fsync", &e)),
            }
        }

        fn release(
            &mut self,
            _req: &Request,
            _ino: u64,
            fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            match self.files.remove(&fh).map(|h| self.fs.release(h)) {
                Some(Err(e)) => reply.error(fail("release", &e)),
                _ => reply.ok(),
            }
        }

        fn create(
            &mut self,
            _req: &Request,
            parent: u64,
            name: &OsStr,
            mode: u32,
            umask: u32,
            _flags: i32,
            reply: ReplyCreate,
        ) {
            let result = self.child(parent, name).and_then(|path| {
                let handle = self.fs.create(&path, mode & !umask)?;
                let stat = self.fs.getattr(&path)?;
                Ok((path, handle, stat))
            });
            match result {
                Ok((path, handle, stat)) => {
                    let ino = self.inodes.assign(&path);
                    let fh = self.next_handle();
                    self.files.insert(fh, handle);
                    reply.created(&TTL, &self.attr(ino, &stat), 0, fh, 0);
                }
                Err(e) => reply.error(fail("create", &e)),
            }
        }

        fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
            match self.path(ino).and_then(|path| self.fs.opendir(&path)) {
                Ok(dir) => {
                    let fh = self.next_handle();
                    self.dirs.insert(fh, dir);
                    reply.opened(fh, 0);
                }
                Err(e) => reply.error(fail("opendir", &e)),
            }
        }

        fn readdir(
            &mut self,
            _req: &Request,
            ino: u64,
            fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            let Self {
                fs, inodes, dirs, ..
            } = self;
            let (Some(dir), Some(path)) = (dirs.get(&fh), inodes.path(ino).map(str::to_owned))
            else {
                reply.error(ENOENT);
                return;
            };

            // offsets: 1 = ".", 2 = "..", entry i = i + 3
            if offset < 1 && reply.add(ino, 1, FileType::Directory, ".") {
                reply.ok();
                return;
            }
            if offset < 2 && reply.add(ROOT_INO, 2, FileType::Directory, "..") {
                reply.ok();
                return;
            }

            let skip = (offset - 2).max(0);
            let mut index: i64 = 0;
            let result = fs.readdir(dir, &mut |name, stat| {
                let i = index;
                index += 1;
                if i < skip {
                    return ControlFlow::Continue(());
                }
                let child = inodes.assign(&crate::inode::join(&path, name));
                if reply.add(child, i + 3, kind_of(stat), name) {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(fail("readdir", &e)),
            }
        }

        fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
            self.dirs.remove(&fh);
            reply.ok();
        }
    }
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
mod imp {
    use snapfs_config::MountConfig;
    use snapfs_core::SnapFs;

    /// Dummy FUSE filesystem for non-Linux or non-feature builds
    pub struct SnapFuse;

    impl SnapFuse {
        pub fn new(_fs: SnapFs, _mount: MountConfig) -> Self {
            #[cfg(not(target_os = "linux"))]
            tracing::warn!(
                os = std::env::consts::OS,
                "FUSE support is only available on Linux"
            );
            #[cfg(all(target_os = "linux", not(feature = "fuse")))]
            tracing::warn!("SnapFuse is disabled. Compile with --features fuse to enable.");
            Self
        }

        pub fn mount(self, _mountpoint: &std::path::Path) -> anyhow::Result<()> {
            anyhow::bail!("FUSE not supported on this platform");
        }
    }
}

pub use imp::SnapFuse;
