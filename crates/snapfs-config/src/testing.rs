//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary backing root (live tree + snapshot namespace)
//! - A ready-to-use [`Config`](crate::Config) pointing at it
//!
//! # Usage
//!
//! ```ignore
//! use snapfs_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new().unwrap();
//! env.create_file("docs/a.txt", b"hello").unwrap();
//! let config = env.config();
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with its own backing root
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Real directory backing the virtual tree
    pub root: PathBuf,
    /// Block size used by [`TestEnvironment::config`]
    pub block_size: u32,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment with the default block size
    pub fn new() -> anyhow::Result<Self> {
        Self::with_block_size(crate::DEFAULT_BLOCK_SIZE)
    }

    /// Create a new isolated test environment with a custom block size
    pub fn with_block_size(block_size: u32) -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("root");
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            block_size,
            test_id,
        })
    }

    /// Config pointing at this environment's backing root
    pub fn config(&self) -> crate::Config {
        let mut cfg = crate::Config::default();
        cfg.storage.root = self.root.clone();
        cfg.storage.block_size = self.block_size;
        cfg
    }

    /// Real path of a virtual path (leading `/` optional)
    pub fn real_path(&self, virtual_path: &str) -> PathBuf {
        self.root.join(virtual_path.trim_start_matches('/'))
    }

    /// Create a live-tree file with content
    pub fn create_file(&self, virtual_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.real_path(virtual_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a live-tree directory
    pub fn create_dir(&self, virtual_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.real_path(virtual_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
