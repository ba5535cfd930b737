//! Inode table for bidirectional inode ↔ local path mapping.
//!
//! The driver core addresses entries by local path; the kernel addresses
//! them by inode number. Inode numbers are assigned on first sight and stay
//! stable until the entry is deleted, so they survive cache evictions.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use davdrive_core::domain::{is_local_descendant, rebase_local, LOCAL_ROOT};

/// Inode number of the mount root.
pub const ROOT_INO: u64 = 1;

/// Bidirectional mapping between inode numbers and local paths.
///
/// Uses DashMap for lock-free concurrent access from multiple FUSE threads.
pub struct InodeTable {
    /// inode -> local path
    by_inode: DashMap<u64, String>,
    /// local path -> inode
    by_path: DashMap<String, u64>,
    next_ino: AtomicU64,
}

impl InodeTable {
    /// Creates a table holding only the root.
    pub fn new() -> Self {
        let table = Self {
            by_inode: DashMap::new(),
            by_path: DashMap::new(),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        };
        table.by_inode.insert(ROOT_INO, LOCAL_ROOT.to_string());
        table.by_path.insert(LOCAL_ROOT.to_string(), ROOT_INO);
        table
    }

    /// Returns the inode of `path`, assigning a fresh one if needed.
    pub fn get_or_assign(&self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }
        let ino = *self
            .by_path
            .entry(path.to_string())
            .or_insert_with(|| self.next_ino.fetch_add(1, Ordering::Relaxed));
        self.by_inode.insert(ino, path.to_string());
        ino
    }

    /// Local path of an inode.
    pub fn path(&self, ino: u64) -> Option<String> {
        self.by_inode.get(&ino).map(|r| r.clone())
    }

    pub fn ino(&self, path: &str) -> Option<u64> {
        self.by_path.get(path).map(|r| *r)
    }

    /// Forgets `path` and everything below it. The root is never removed.
    pub fn remove_path(&self, path: &str) -> usize {
        let doomed: Vec<(String, u64)> = self
            .by_path
            .iter()
            .filter(|r| r.key() == path || is_local_descendant(r.key(), path))
            .filter(|r| *r.value() != ROOT_INO)
            .map(|r| (r.key().clone(), *r.value()))
            .collect();
        for (path, ino) in &doomed {
            self.by_path.remove(path);
            self.by_inode.remove(ino);
        }
        doomed.len()
    }

    /// Moves `old` and everything below it to `new`, keeping inode numbers.
    ///
    /// Any inode previously assigned to a path under `new` is dropped.
    pub fn rename(&self, old: &str, new: &str) {
        if old == new {
            return;
        }
        self.remove_path(new);
        let moved: Vec<(String, String, u64)> = self
            .by_path
            .iter()
            .filter_map(|r| {
                rebase_local(r.key(), old, new).map(|target| (r.key().clone(), target, *r.value()))
            })
            .collect();
        for (source, target, ino) in moved {
            self.by_path.remove(&source);
            self.by_path.insert(target.clone(), ino);
            self.by_inode.insert(ino, target);
        }
    }

    pub fn len(&self) -> usize {
        self.by_inode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_inode.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
