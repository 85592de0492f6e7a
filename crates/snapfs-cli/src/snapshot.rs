use std::fs::OpenOptions;

use anyhow::{Context, Result};
use fs2::FileExt;
use snapfs_config::log_cli_info;
use snapfs_core::{SnapFs, SnapshotId};

/// Serialises snapshot creation across processes sharing a root.
const CREATE_LOCK: &str = ".create.lock";

/// Take snapshot `id` while holding the namespace creation lock.
pub fn run(fs: &SnapFs, id: &str) -> Result<SnapshotId> {
    let lock_path = fs.resolver().snapshot_dir().join(CREATE_LOCK);
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to open {}", lock_path.display()))?;
    lock.lock_exclusive()
        .with_context(|| format!("Failed to lock {}", lock_path.display()))?;

    let created = fs.snapshot(id);
    let _ = fs2::FileExt::unlock(&lock);

    let id = created.with_context(|| format!("Failed to create snapshot {id}"))?;
    log_cli_info!("Snapshot created", id = id.as_str());
    Ok(id)
}
