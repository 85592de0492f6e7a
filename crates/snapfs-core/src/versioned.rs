//! Reading a file as it was when a snapshot was taken.
//!
//! A block's snapshot-time content lives in the log of the first snapshot,
//! from the target towards the latest, that preserved it. Blocks nobody
//! preserved were never overwritten and are read from the live file.

use std::fs::{File, OpenOptions};
use std::io;

use snapfs_config::log_overlay_debug;
use tracing::instrument;

use crate::block::read_full_at;
use crate::chain::{SnapshotChain, SnapshotId};
use crate::map::{FileStat, MapFile};
use crate::path::PathResolver;
use crate::{Result, SnapError};

/// One snapshot layer of a versioned file.
#[derive(Debug)]
struct Step {
    id: SnapshotId,
    map: Option<MapFile>,
    log: Option<File>,
}

/// A read-only handle on `/snapshots/<id>/<rel>`.
#[derive(Debug)]
pub struct SnapshotFile {
    rel: String,
    snapshot: SnapshotId,
    steps: Vec<Step>,
    main: Option<File>,
    stat: FileStat,
    block_size: u64,
    shift: u32,
}

/// Snapshot-time stat of `rel` as seen from the first of `layers`.
pub fn resolve_stat(resolver: &PathResolver, layers: &[SnapshotId], rel: &str) -> Result<FileStat> {
    for id in layers {
        let (map_path, _) = resolver.companion_paths(id.as_str(), rel)?;
        match MapFile::read_header(&map_path) {
            Ok(header) if header.exists => return Ok(header.stat),
            Ok(_) => return Err(not_found(id, rel)),
            Err(SnapError::Io(e)) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }
    let real = resolver.map_path(rel)?;
    FileStat::lstat(&real).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => not_found(&layers[0], rel),
        _ => e.into(),
    })
}

fn not_found(id: &SnapshotId, rel: &str) -> SnapError {
    SnapError::not_found(format!("/snapshots/{id}{rel}"))
}

impl SnapshotFile {
    #[instrument(skip(resolver, chain), level = "debug")]
    pub fn open(
        resolver: &PathResolver,
        chain: &SnapshotChain,
        snapshot: &SnapshotId,
        rel: &str,
        block_size: u64,
    ) -> Result<Self> {
        let layers = chain.layers_from(snapshot)?;
        let stat = resolve_stat(resolver, &layers, rel)?;

        let mut steps = Vec::with_capacity(layers.len());
        for id in layers {
            let (map_path, log_path) = resolver.companion_paths(id.as_str(), rel)?;
            let map = match MapFile::open(&map_path, false) {
                Ok(map) => Some(map),
                Err(SnapError::NotFound { .. }) => None,
                Err(e) => return Err(e),
            };
            let log = match &map {
                Some(map) if map.header().exists => open_optional(&log_path)?,
                _ => None,
            };
            steps.push(Step { id, map, log });
        }

        let main = open_optional(&resolver.map_path(rel)?)?;

        log_overlay_debug!(
            "Opened snapshot file",
            snapshot = snapshot.as_str(),
            path = rel,
            layers = steps.len(),
            size = stat.size
        );
        Ok(Self {
            rel: rel.to_string(),
            snapshot: snapshot.clone(),
            steps,
            main,
            stat,
            block_size,
            shift: block_size.trailing_zeros(),
        })
    }

    pub fn stat(&self) -> &FileStat {
        &self.stat
    }

    pub fn snapshot(&self) -> &SnapshotId {
        &self.snapshot
    }

    /// Read up to `size` bytes at `offset`, clamped to the snapshot-time size.
    pub fn read_versioned(&self, size: usize, offset: u64) -> Result<Vec<u8>> {
        let total = self.stat.size;
        if offset >= total || size == 0 {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(size as u64).min(total);
        let wanted = (end - offset) as usize;

        let block_size = self.block_size as usize;
        let mut out = Vec::new();
        out.try_reserve_exact(wanted)
            .map_err(|_| SnapError::OutOfMemory { bytes: wanted })?;
        let mut block = Vec::new();
        block
            .try_reserve_exact(block_size)
            .map_err(|_| SnapError::OutOfMemory { bytes: block_size })?;
        block.resize(block_size, 0);

        for position in (offset >> self.shift)..=((end - 1) >> self.shift) {
            self.read_block(position, &mut block)?;
            let block_start = position << self.shift;
            let from = offset.max(block_start) - block_start;
            let to = end.min(block_start + self.block_size) - block_start;
            out.extend_from_slice(&block[from as usize..to as usize]);
        }
        Ok(out)
    }

    fn read_block(&self, position: u64, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        for step in &self.steps {
            let Some(map) = &step.map else { continue };
            if !map.header().exists {
                return Err(SnapError::consistency(format!(
                    "{} is a tombstone in {} but block {position} was never preserved",
                    self.rel, step.id
                )));
            }
            let pointer = map.read_pointer(position)?;
            if pointer == 0 {
                continue;
            }
            let log = step.log.as_ref().ok_or_else(|| {
                SnapError::consistency(format!("{} has no log in {}", self.rel, step.id))
            })?;
            let read = read_full_at(log, buf, (pointer - 1) << self.shift)?;
            if read != buf.len() {
                return Err(SnapError::consistency(format!(
                    "pointer {pointer} for block {position} of {} runs past the log in {}",
                    self.rel, step.id
                )));
            }
            return Ok(());
        }

        if let Some(main) = &self.main {
            read_full_at(main, buf, position << self.shift)?;
        }
        Ok(())
    }
}

fn open_optional(path: &std::path::Path) -> Result<Option<File>> {
    match OpenOptions::new().read(true).open(path) {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
