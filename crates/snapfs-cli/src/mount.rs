use anyhow::{Context, Result};
use clap::Args;
use snapfs_config::Config;
use std::fs;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct MountArgs {
    /// Mount point directory
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,
}

/// Execute the mount command
pub fn run(args: MountArgs, config: &Config) -> Result<()> {
    let root = &config.storage.root;
    let mountpoint = &args.mountpoint;
    if !root.is_dir() {
        anyhow::bail!("Backing root not found: {}", root.display());
    }

    // Ensure mountpoint exists
    if !mountpoint.exists() {
        fs::create_dir_all(mountpoint)
            .with_context(|| format!("Failed to create mountpoint: {}", mountpoint.display()))?;
    }

    tracing::info!("Mounting snapfs...");
    tracing::info!("  Root:       {}", root.display());
    tracing::info!("  Mountpoint: {}", mountpoint.display());
    tracing::info!("  Block size: {}", config.storage.block_size);

    #[cfg(feature = "fuse")]
    {
        let fs = snapfs_core::SnapFs::new(config)?;
        let mut mount = config.mount.clone();
        mount.allow_other |= args.allow_other;

        // This will block until unmounted
        snapfs_fuse::SnapFuse::new(fs, mount).mount(mountpoint)?;
    }

    #[cfg(not(feature = "fuse"))]
    {
        let _ = args.allow_other;
        tracing::warn!("FUSE support disabled. Recompile with --features fuse to enable.");
        tracing::warn!("    cargo build -p snapfs-cli --features fuse");
    }

    Ok(())
}
