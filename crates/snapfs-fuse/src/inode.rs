//! Path ↔ inode bookkeeping for the kernel interface.
//!
//! The backing store is addressed by path, the kernel by inode number.
//! Numbers are handed out on first sight of a path and live until the path
//! is removed.

use std::collections::HashMap;

pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
pub struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.by_ino.insert(ROOT_INO, "/".to_string());
        table.by_path.insert("/".to_string(), ROOT_INO);
        table
    }

    pub fn path(&self, ino: u64) -> Option<&str> {
        self.by_ino.get(&ino).map(String::as_str)
    }

    /// Virtual path of `name` inside directory `parent`.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        self.path(parent).map(|p| join(p, name))
    }

    /// Inode for `path`, allocating one if it has none yet.
    pub fn assign(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_string());
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Drop the mapping for a removed path.
    pub fn forget(&mut self, path: &str) {
        if path == "/" {
            return;
        }
        if let Some(ino) = self.by_path.remove(path) {
            self.by_ino.remove(&ino);
        }
    }

    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}

/// Join a directory path and an entry name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some("/"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_assign_is_stable() {
        let mut table = InodeTable::new();
        let a = table.assign("/a");
        let b = table.assign("/snapshots/s1/a");
        assert_ne!(a, b);
        assert_eq!(table.assign("/a"), a);
        assert_eq!(table.path(b), Some("/snapshots/s1/a"));
    }

    #[test]
    fn test_child_paths() {
        let mut table = InodeTable::new();
        assert_eq!(table.child_path(ROOT_INO, "docs").as_deref(), Some("/docs"));
        let docs = table.assign("/docs");
        assert_eq!(table.child_path(docs, "x").as_deref(), Some("/docs/x"));
        assert_eq!(table.child_path(999, "x"), None);
    }

    #[test]
    fn test_forget_frees_path_but_not_root() {
        let mut table = InodeTable::new();
        let a = table.assign("/a");
        table.forget("/a");
        assert_eq!(table.path(a), None);
        assert_ne!(table.assign("/a"), a);
        table.forget("/");
        assert_eq!(table.path(ROOT_INO), Some("/"));
    }
}
