//! Map files: a fixed-size header capturing a file's metadata as of snapshot
//! time, followed by a sparse array of block pointers.
//!
//! ```text
//! offset 0            128          128 + 8n
//! ┌──────────────────┬────────────┬────────────┬───
//! │ MapHeader        │ pointer 0  │ pointer 1  │ ...   (u64 LE, 0 = not preserved)
//! └──────────────────┴────────────┴────────────┴───
//! ```
//!
//! Unwritten slots read back as zero, so the file may stay sparse.

use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};

use crate::path::with_suffix;
use crate::{Result, SnapError};

/// Size of the encoded [`MapHeader`].
pub const MAP_HEADER_SIZE: u64 = 128;
/// Size of one block-pointer slot.
pub const POINTER_WIDTH: u64 = 8;

const EXISTS_OFFSET: usize = 112;
const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// The parts of `stat(2)` a snapshot records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: i64,
    pub atime_nsec: i64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub ctime: i64,
    pub ctime_nsec: i64,
}

impl FileStat {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            mode: meta.mode(),
            nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size(),
            blksize: meta.blksize(),
            blocks: meta.blocks(),
            atime: meta.atime(),
            atime_nsec: meta.atime_nsec(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            ctime: meta.ctime(),
            ctime_nsec: meta.ctime_nsec(),
        }
    }

    /// `lstat` of a real path.
    pub fn lstat(path: &Path) -> io::Result<Self> {
        Ok(Self::from_metadata(&fs::symlink_metadata(path)?))
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Permission bits only.
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }
}

/// Header of a map file. Immutable once published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapHeader {
    pub stat: FileStat,
    /// `false` marks a tombstone: the name did not exist at snapshot time
    pub exists: bool,
}

impl MapHeader {
    pub fn live(stat: FileStat) -> Self {
        Self { stat, exists: true }
    }

    pub fn tombstone() -> Self {
        Self {
            stat: FileStat::default(),
            exists: false,
        }
    }

    /// Snapshot-time size of the file.
    pub fn size(&self) -> u64 {
        self.stat.size
    }

    pub fn encode(&self) -> [u8; MAP_HEADER_SIZE as usize] {
        let s = &self.stat;
        let mut buf = [0u8; MAP_HEADER_SIZE as usize];
        let mut at = 0;
        let mut put = |bytes: &[u8]| {
            buf[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };
        put(&s.dev.to_le_bytes());
        put(&s.ino.to_le_bytes());
        put(&s.mode.to_le_bytes());
        put(&s.nlink.to_le_bytes());
        put(&s.uid.to_le_bytes());
        put(&s.gid.to_le_bytes());
        put(&s.rdev.to_le_bytes());
        put(&s.size.to_le_bytes());
        put(&s.blksize.to_le_bytes());
        put(&s.blocks.to_le_bytes());
        put(&s.atime.to_le_bytes());
        put(&s.atime_nsec.to_le_bytes());
        put(&s.mtime.to_le_bytes());
        put(&s.mtime_nsec.to_le_bytes());
        put(&s.ctime.to_le_bytes());
        put(&s.ctime_nsec.to_le_bytes());
        debug_assert_eq!(at, EXISTS_OFFSET);
        buf[EXISTS_OFFSET] = u8::from(self.exists);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MAP_HEADER_SIZE as usize {
            return Err(SnapError::consistency(format!(
                "map header is {} bytes, expected {}",
                buf.len(),
                MAP_HEADER_SIZE
            )));
        }

        let mut at = 0;
        let stat = FileStat {
            dev: u64::from_le_bytes(field(buf, &mut at)),
            ino: u64::from_le_bytes(field(buf, &mut at)),
            mode: u32::from_le_bytes(field(buf, &mut at)),
            nlink: u32::from_le_bytes(field(buf, &mut at)),
            uid: u32::from_le_bytes(field(buf, &mut at)),
            gid: u32::from_le_bytes(field(buf, &mut at)),
            rdev: u64::from_le_bytes(field(buf, &mut at)),
            size: u64::from_le_bytes(field(buf, &mut at)),
            blksize: u64::from_le_bytes(field(buf, &mut at)),
            blocks: u64::from_le_bytes(field(buf, &mut at)),
            atime: i64::from_le_bytes(field(buf, &mut at)),
            atime_nsec: i64::from_le_bytes(field(buf, &mut at)),
            mtime: i64::from_le_bytes(field(buf, &mut at)),
            mtime_nsec: i64::from_le_bytes(field(buf, &mut at)),
            ctime: i64::from_le_bytes(field(buf, &mut at)),
            ctime_nsec: i64::from_le_bytes(field(buf, &mut at)),
        };
        debug_assert_eq!(at, EXISTS_OFFSET);

        let exists = match buf[EXISTS_OFFSET] {
            0 => false,
            1 => true,
            other => {
                return Err(SnapError::consistency(format!(
                    "map header exists flag is {other}"
                )))
            }
        };

        Ok(Self { stat, exists })
    }
}

/// Next `N` header bytes starting at `*at`; caller checked the length.
fn field<const N: usize>(buf: &[u8], at: &mut usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[*at..*at + N]);
    *at += N;
    out
}

/// An open map file with its header loaded.
#[derive(Debug)]
pub struct MapFile {
    file: File,
    header: MapHeader,
    path: PathBuf,
}

impl MapFile {
    /// Open an existing map file and load its header.
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let file = match OpenOptions::new().read(true).write(writable).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SnapError::not_found(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let header = Self::load_header(&file)?;
        Ok(Self {
            file,
            header,
            path: path.to_path_buf(),
        })
    }

    /// Read only the header of the map file at `path`.
    pub fn read_header(path: &Path) -> Result<MapHeader> {
        let file = File::open(path)?;
        Self::load_header(&file)
    }

    fn load_header(file: &File) -> Result<MapHeader> {
        let mut buf = [0u8; MAP_HEADER_SIZE as usize];
        file.read_exact_at(&mut buf, 0).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                SnapError::consistency("map file shorter than its header")
            } else {
                SnapError::Io(e)
            }
        })?;
        MapHeader::decode(&buf)
    }

    /// Create the map file at `path` holding `header` unless one already
    /// exists. Readers never observe a half-written header: the header is
    /// written to a private temp file and published with `link(2)`, which
    /// fails atomically when another creator got there first.
    ///
    /// Returns `true` if this call published the file.
    pub fn publish(path: &Path, header: &MapHeader) -> Result<bool> {
        let temp = with_suffix(
            path,
            &format!(
                ".{}.{:?}.tmp",
                std::process::id(),
                std::thread::current().id()
            ),
        );

        let written = (|| -> io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(&header.encode())?;
            file.sync_all()
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        let linked = fs::hard_link(&temp, path);
        let _ = fs::remove_file(&temp);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn header(&self) -> &MapHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    fn slot_offset(position: u64) -> Result<u64> {
        position
            .checked_mul(POINTER_WIDTH)
            .and_then(|o| o.checked_add(MAP_HEADER_SIZE))
            .ok_or_else(|| {
                SnapError::consistency(format!("block position {position} overflows the map"))
            })
    }

    /// Read the pointer for a block position. Holes and slots past the end
    /// of the file read as zero.
    pub fn read_pointer(&self, position: u64) -> Result<u64> {
        let offset = Self::slot_offset(position)?;
        let mut buf = [0u8; POINTER_WIDTH as usize];
        let n = self.file.read_at(&mut buf, offset)?;
        match n {
            0 => Ok(0),
            n if n == buf.len() => Ok(u64::from_le_bytes(buf)),
            n => Err(SnapError::consistency(format!(
                "short pointer read ({n} bytes) at slot {position} of {}",
                self.path.display()
            ))),
        }
    }

    /// Store a pointer for a block position.
    pub fn write_pointer(&self, position: u64, pointer: u64) -> Result<()> {
        let offset = Self::slot_offset(position)?;
        self.file.write_all_at(&pointer.to_le_bytes(), offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stat() -> FileStat {
        FileStat {
            dev: 0x801,
            ino: 123456,
            mode: 0o100644,
            nlink: 1,
            uid: 1000,
            gid: 100,
            rdev: 0,
            size: 10000,
            blksize: 4096,
            blocks: 24,
            atime: 1_700_000_000,
            atime_nsec: 5,
            mtime: 1_700_000_100,
            mtime_nsec: 6,
            ctime: -3,
            ctime_nsec: 999_999_999,
        }
    }

    #[test]
    fn test_header_round_trip_is_byte_identical() {
        for header in [MapHeader::live(sample_stat()), MapHeader::tombstone()] {
            let bytes = header.encode();
            let decoded = MapHeader::decode(&bytes).unwrap();
            assert_eq!(decoded, header);
            assert_eq!(decoded.encode(), bytes);
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = MapHeader::live(sample_stat()).encode();
        assert_eq!(bytes.len(), 128);
        assert_eq!(&bytes[0..8], &0x801u64.to_le_bytes());
        assert_eq!(&bytes[40..48], &10000u64.to_le_bytes());
        assert_eq!(bytes[112], 1);
        assert!(bytes[113..].iter().all(|b| *b == 0));
        assert_eq!(MapHeader::tombstone().encode()[112], 0);
    }

    #[test]
    fn test_decode_rejects_bad_flag_and_short_input() {
        let mut bytes = MapHeader::live(sample_stat()).encode();
        bytes[112] = 7;
        assert!(MapHeader::decode(&bytes).unwrap_err().is_consistency_fault());
        assert!(MapHeader::decode(&bytes[..64])
            .unwrap_err()
            .is_consistency_fault());
    }

    #[test]
    fn test_stat_kind() {
        let mut stat = sample_stat();
        assert!(stat.is_file());
        assert_eq!(stat.perm(), 0o644);
        stat.mode = 0o040755;
        assert!(stat.is_dir());
    }

    #[test]
    fn test_publish_once_and_sparse_pointers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.map");
        let header = MapHeader::live(sample_stat());

        assert!(MapFile::publish(&path, &header).unwrap());
        assert!(!MapFile::publish(&path, &MapHeader::tombstone()).unwrap());

        let map = MapFile::open(&path, true).unwrap();
        assert_eq!(map.header(), &header);
        assert_eq!(map.read_pointer(0).unwrap(), 0);
        assert_eq!(map.read_pointer(1_000_000).unwrap(), 0);

        map.write_pointer(5, 3).unwrap();
        assert_eq!(map.read_pointer(5).unwrap(), 3);
        assert_eq!(map.read_pointer(4).unwrap(), 0);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            MAP_HEADER_SIZE + 6 * POINTER_WIDTH
        );

        // no temp files left behind
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("f.map")]);
    }

    #[test]
    fn test_short_pointer_slot_is_consistency_fault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.map");
        MapFile::publish(&path, &MapHeader::live(sample_stat())).unwrap();
        let map = MapFile::open(&path, true).unwrap();
        map.file().set_len(MAP_HEADER_SIZE + 3).unwrap();
        assert!(map.read_pointer(0).unwrap_err().is_consistency_fault());
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            MapFile::open(&dir.path().join("nope.map"), false),
            Err(SnapError::NotFound { .. })
        ));
    }
}
