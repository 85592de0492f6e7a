//! Lazy block preservation for versioned live files.
//!
//! Before a write or truncate changes bytes that existed when the latest
//! snapshot was taken, every affected block is copied once into that
//! snapshot's log and its position recorded in the map:
//!
//! 1. read the map slot without the lock; non-zero means already preserved
//! 2. otherwise take the file lock (once per call) and re-read the slot
//! 3. read the original block from the live file
//! 4. append it to the log at the current, block-aligned log length
//! 5. store `log_length / block_size + 1` in the slot
//!
//! The caller performs its own write only after this returns; that write is
//! not covered by the lock.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt};
use std::path::Path;
use std::sync::Arc;

use snapfs_config::{log_block_debug, log_block_error, StorageConfig};
use tracing::instrument;

use crate::chain::SnapshotId;
use crate::lock::{FileIdentity, LockGuard, LockManager};
use crate::map::{FileStat, MapFile, MapHeader};
use crate::path::PathResolver;
use crate::{Result, SnapError};

/// Map and log of one live file inside the latest snapshot.
#[derive(Debug)]
pub struct Companions {
    snapshot: SnapshotId,
    identity: FileIdentity,
    map: MapFile,
    log: File,
}

impl Companions {
    /// Open the companions of `rel` in `snapshot`, creating them if this is
    /// the first mutation since the snapshot was taken.
    ///
    /// `current` is the live file's stat, or `None` when the name does not
    /// exist yet (a tombstone is recorded instead). Returns `None` when the
    /// snapshot holds a tombstone: there is nothing to preserve.
    pub fn open_or_create(
        resolver: &PathResolver,
        snapshot: &SnapshotId,
        rel: &str,
        current: Option<&FileStat>,
    ) -> Result<Option<Self>> {
        let (map_path, log_path) = resolver.companion_paths(snapshot.as_str(), rel)?;
        if !map_path.is_file() {
            match current {
                Some(stat) => {
                    if let Some(parent) = log_path.parent() {
                        DirBuilder::new().recursive(true).mode(0o700).create(parent)?;
                    }
                    // the log must exist before a live header becomes visible
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .open(&log_path)?;
                    if !record_header(resolver, snapshot, rel, &MapHeader::live(*stat))? {
                        discard_unused_log(&map_path, &log_path)?;
                    }
                }
                None => {
                    record_header(resolver, snapshot, rel, &MapHeader::tombstone())?;
                }
            }
        }

        let identity = current.map(|s| FileIdentity {
            dev: s.dev,
            ino: s.ino,
        });
        Self::open(resolver, snapshot, rel, identity)
    }

    /// Open existing companions for writing. `None` if the snapshot has a
    /// tombstone for `rel`.
    fn open(
        resolver: &PathResolver,
        snapshot: &SnapshotId,
        rel: &str,
        identity: Option<FileIdentity>,
    ) -> Result<Option<Self>> {
        let (map_path, log_path) = resolver.companion_paths(snapshot.as_str(), rel)?;
        let map = MapFile::open(&map_path, true)?;
        if !map.header().exists {
            return Ok(None);
        }
        let log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&log_path)?;
        let identity = identity.unwrap_or(FileIdentity {
            dev: map.header().stat.dev,
            ino: map.header().stat.ino,
        });
        Ok(Some(Self {
            snapshot: snapshot.clone(),
            identity,
            map,
            log,
        }))
    }

    pub fn snapshot(&self) -> &SnapshotId {
        &self.snapshot
    }

    pub fn header(&self) -> &MapHeader {
        self.map.header()
    }

    pub fn map(&self) -> &MapFile {
        &self.map
    }

    pub fn log(&self) -> &File {
        &self.log
    }

    /// Key used for the file lock.
    pub fn identity(&self) -> FileIdentity {
        self.identity
    }

    pub fn sync(&self, datasync: bool) -> io::Result<()> {
        if datasync {
            self.map.file().sync_data()?;
            self.log.sync_data()
        } else {
            self.map.file().sync_all()?;
            self.log.sync_all()
        }
    }
}

/// Another creator published first; its tombstone leaves our log unused.
fn discard_unused_log(map_path: &Path, log_path: &Path) -> Result<()> {
    if MapFile::read_header(map_path)?.exists {
        return Ok(());
    }
    match fs::remove_file(log_path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Record `header` for `rel` in `snapshot` unless a header is already there.
/// Returns `true` if this call recorded it.
pub fn record_header(
    resolver: &PathResolver,
    snapshot: &SnapshotId,
    rel: &str,
    header: &MapHeader,
) -> Result<bool> {
    let (map_path, _) = resolver.companion_paths(snapshot.as_str(), rel)?;
    if let Some(parent) = map_path.parent() {
        DirBuilder::new().recursive(true).mode(0o700).create(parent)?;
    }
    let recorded = MapFile::publish(&map_path, header)?;
    if recorded {
        log_block_debug!(
            "Recorded map header",
            snapshot = snapshot.as_str(),
            path = rel,
            exists = header.exists
        );
    }
    Ok(recorded)
}

/// Scoped hold on a file's preservation lock: the in-process lock plus,
/// optionally, an advisory `flock` on the map for other processes.
struct PreserveSession<'a> {
    guard: Option<LockGuard<'a>>,
    flocked: Option<&'a File>,
}

impl PreserveSession<'_> {
    fn finish(mut self) -> Result<()> {
        if let Some(file) = self.flocked.take() {
            fs2::FileExt::unlock(file)?;
        }
        match self.guard.take() {
            Some(guard) => guard.release(),
            None => Ok(()),
        }
    }
}

impl Drop for PreserveSession<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.flocked.take() {
            let _ = fs2::FileExt::unlock(file);
        }
    }
}

/// Preserves original blocks ahead of writes and truncations.
#[derive(Debug, Clone)]
pub struct BlockStore {
    locks: Arc<LockManager>,
    block_size: u64,
    shift: u32,
    cross_process: bool,
}

impl BlockStore {
    pub fn new(storage: &StorageConfig, locks: Arc<LockManager>, cross_process: bool) -> Self {
        Self {
            locks,
            block_size: u64::from(storage.block_size),
            shift: storage.block_shift(),
            cross_process,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Preserve every snapshot-time block overlapping `[offset, offset + size)`.
    #[instrument(skip(self, main, companions), level = "debug")]
    pub fn write_preserve(
        &self,
        main: &File,
        companions: &Companions,
        size: u64,
        offset: u64,
    ) -> Result<()> {
        let end = offset.checked_add(size).ok_or_else(|| {
            SnapError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write range overflows u64",
            ))
        })?;
        let snapshot_size = companions.header().size();
        self.preserve_range(main, companions, offset, end.min(snapshot_size))
    }

    /// Preserve every snapshot-time block a shrink to `new_size` would cut.
    #[instrument(skip(self, main, companions), level = "debug")]
    pub fn truncate_preserve(
        &self,
        main: &File,
        companions: &Companions,
        new_size: u64,
    ) -> Result<()> {
        let snapshot_size = companions.header().size();
        self.preserve_range(main, companions, new_size, snapshot_size)
    }

    fn preserve_range(
        &self,
        main: &File,
        companions: &Companions,
        start: u64,
        end: u64,
    ) -> Result<()> {
        if start >= end {
            log_block_debug!("Nothing to preserve", start = start, end = end);
            return Ok(());
        }

        let block_size = usize::try_from(self.block_size)
            .map_err(|_| SnapError::OutOfMemory { bytes: usize::MAX })?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(block_size)
            .map_err(|_| SnapError::OutOfMemory { bytes: block_size })?;
        buf.resize(block_size, 0);

        let first = start >> self.shift;
        let last = (end - 1) >> self.shift;
        let mut session: Option<PreserveSession<'_>> = None;

        for position in first..=last {
            // Unlocked read: a non-zero pointer is final.
            if companions.map().read_pointer(position)? != 0 {
                continue;
            }

            if session.is_none() {
                session = Some(self.begin(companions)?);
                // Only a lock holder sees every completed preservation.
                if companions.map().read_pointer(position)? != 0 {
                    continue;
                }
            }

            self.preserve_block(main, companions, position, &mut buf)?;
        }

        match session {
            Some(session) => session.finish(),
            None => Ok(()),
        }
    }

    fn begin<'a>(&'a self, companions: &'a Companions) -> Result<PreserveSession<'a>> {
        let guard = self.locks.acquire(companions.identity())?;
        let mut session = PreserveSession {
            guard: Some(guard),
            flocked: None,
        };
        if self.cross_process {
            let file = companions.map().file();
            fs2::FileExt::lock_exclusive(file)?;
            session.flocked = Some(file);
        }
        Ok(session)
    }

    fn preserve_block(
        &self,
        main: &File,
        companions: &Companions,
        position: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let block_offset = position << self.shift;

        buf.fill(0);
        let read = read_full_at(main, buf, block_offset)?;
        if read == 0 {
            log_block_error!(
                "Live file ends before a snapshot-time block",
                position = position
            );
            return Err(SnapError::consistency(format!(
                "live file has no data for block {position} recorded at snapshot time"
            )));
        }

        let log_len = companions.log().metadata()?.len();
        if log_len & (self.block_size - 1) != 0 {
            log_block_error!(
                "Log length not block aligned",
                log_len = log_len,
                block_size = self.block_size
            );
            return Err(SnapError::consistency(format!(
                "log length {log_len} is not a multiple of block size {}",
                self.block_size
            )));
        }

        companions.log().write_all_at(buf, log_len)?;
        let pointer = (log_len >> self.shift) + 1;
        companions.map().write_pointer(position, pointer)?;

        log_block_debug!(
            "Preserved block",
            position = position,
            pointer = pointer,
            bytes = read
        );
        Ok(())
    }
}

/// `pread` until `buf` is full or EOF; returns bytes read.
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// Length of a log file in blocks; errors if it is not block aligned.
pub fn log_blocks(path: &Path, block_size: u64) -> Result<u64> {
    let len = fs::metadata(path)?.len();
    if len % block_size != 0 {
        return Err(SnapError::consistency(format!(
            "log {} is {len} bytes, not a multiple of {block_size}",
            path.display()
        )));
    }
    Ok(len / block_size)
}
