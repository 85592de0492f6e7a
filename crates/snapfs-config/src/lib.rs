//! # snapfs-config
//!
//! Configuration management for snapfs.
//!
//! Loads configuration from:
//! 1. `~/.snapfs/config.toml` (global)
//! 2. `.snapfs/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! There is no process-wide instance: callers load a [`Config`]
//! once and hand it to every component they construct.

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default block size for copy-on-write preservation.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 1 << 20;

/// Default backing root when nothing else is configured.
pub const DEFAULT_ROOT: &str = "~/.snapfs/root";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("block size {0} must be a power of two between 512 and 1048576")]
    InvalidBlockSize(u32),
    #[error("lock table capacity must be at least 1")]
    InvalidLockCapacity,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub locking: LockingConfig,
    pub mount: MountConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::load_file(&global_path)?;
            }
        }

        let project_path = Path::new(".snapfs/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::load_file(project_path)?;
            config.merge(project_config);
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load a single TOML file without merging or env overrides.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.snapfs/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".snapfs/config.toml"))
    }

    /// Merge a project config over this one. Only values that differ from
    /// the defaults override.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();
        if other.storage.root != defaults.storage.root {
            self.storage.root = other.storage.root;
        }
        if other.storage.block_size != defaults.storage.block_size {
            self.storage.block_size = other.storage.block_size;
        }
        if other.locking.table_capacity != defaults.locking.table_capacity {
            self.locking.table_capacity = other.locking.table_capacity;
        }
        if other.locking.cross_process != defaults.locking.cross_process {
            self.locking.cross_process = other.locking.cross_process;
        }
        if other.mount.fsname != defaults.mount.fsname {
            self.mount.fsname = other.mount.fsname;
        }
        if other.mount.allow_other != defaults.mount.allow_other {
            self.mount.allow_other = other.mount.allow_other;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("SNAPFS_ROOT") {
            self.storage.root = PathBuf::from(path);
        }
        if let Ok(size) = std::env::var("SNAPFS_BLOCK_SIZE") {
            if let Ok(n) = size.parse() {
                self.storage.block_size = n;
            }
        }
    }

    /// Reject settings the storage layer cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bs = self.storage.block_size;
        if !bs.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bs) {
            return Err(ConfigError::InvalidBlockSize(bs));
        }
        if self.locking.table_capacity == 0 {
            return Err(ConfigError::InvalidLockCapacity);
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Backing storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Real directory holding the live tree and the `snapshots/` directory
    pub root: PathBuf,
    /// Unit of copy-on-write preservation, in bytes
    pub block_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl StorageConfig {
    /// The root with a leading `~/` expanded to the home directory.
    pub fn resolved_root(&self) -> PathBuf {
        match (self.root.strip_prefix("~"), dirs::home_dir()) {
            (Ok(rest), Some(home)) => home.join(rest),
            _ => self.root.clone(),
        }
    }

    /// `log2(block_size)`; only meaningful after [`Config::validate`].
    pub fn block_shift(&self) -> u32 {
        self.block_size.trailing_zeros()
    }
}

/// Lock manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Maximum number of file locks held at the same time
    pub table_capacity: usize,
    /// Also take an advisory flock on the map file while preserving blocks
    pub cross_process: bool,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            table_capacity: 1024,
            cross_process: true,
        }
    }
}

/// FUSE mount configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub fsname: String,
    pub allow_other: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fsname: "snapfs".to_string(),
            allow_other: false,
        }
    }
}
