//! Inode table.
//!
//! The kernel addresses files by inode number while the host thinks in absolute paths. The table
//! hands out inode numbers for paths the kernel looked up and keeps them until the kernel
//! forgets them.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Inode number of the mount root.
pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
struct Node {
    path: PathBuf,
    lookups: u64,
}

/// Bidirectional map between inode numbers and absolute paths.
#[derive(Debug)]
pub struct InodeTable {
    nodes: HashMap<u64, Node>,
    inodes: HashMap<PathBuf, u64>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Create a table containing only the root directory.
    pub fn new() -> Self {
        let root = PathBuf::from("/");
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node { path: root.clone(), lookups: 1 });
        let mut inodes = HashMap::new();
        inodes.insert(root, ROOT_INO);
        Self { nodes, inodes, next: ROOT_INO + 1 }
    }

    /// Returns the path of an inode.
    pub fn path(&self, ino: u64) -> Option<&Path> {
        self.nodes.get(&ino).map(|node| node.path.as_path())
    }

    /// Returns the path of entry `name` in directory `parent`.
    pub fn child(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|path| path.join(name))
    }

    /// Returns the inode of a path if the kernel currently knows it.
    pub fn find(&self, path: &Path) -> Option<u64> {
        self.inodes.get(path).copied()
    }

    /// Record a kernel lookup of `path`, allocating an inode on first sight.
    pub fn lookup(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.inodes.get(path) {
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.lookups += 1;
            }
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.nodes.insert(ino, Node { path: path.to_owned(), lookups: 1 });
        self.inodes.insert(path.to_owned(), ino);
        ino
    }

    /// Drop `nlookup` kernel references; the inode is released once none are left.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let released = match self.nodes.get_mut(&ino) {
            Some(node) => {
                node.lookups = node.lookups.saturating_sub(nlookup);
                node.lookups == 0
            }
            None => false,
        };
        if released {
            if let Some(node) = self.nodes.remove(&ino) {
                if self.inodes.get(&node.path) == Some(&ino) {
                    self.inodes.remove(&node.path);
                }
            }
        }
    }

    /// Move `from` and everything below it to `to`.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        // Whatever was at the target is replaced
        self.inodes.remove(to);
        let moved: Vec<(u64, PathBuf)> = self
            .nodes
            .iter()
            .filter_map(|(&ino, node)| {
                let rest = node.path.strip_prefix(from).ok()?;
                let path = if rest.as_os_str().is_empty() { to.to_owned() } else { to.join(rest) };
                Some((ino, path))
            })
            .collect();
        for (ino, path) in moved {
            if let Some(node) = self.nodes.get_mut(&ino) {
                if self.inodes.get(&node.path) == Some(&ino) {
                    self.inodes.remove(&node.path);
                }
                node.path = path.clone();
            }
            self.inodes.insert(path, ino);
        }
    }

    /// Number of inodes currently known, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the table holds no inodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
