//! Inode tree
//!
//! Tree-structured filesystem nodes: directories, regular files and
//! symbolic links, each carrying permission bits and timestamps.
//! Directories exclusively own their children, so the ownership graph is
//! acyclic by construction (symlinks may still form cycles through their
//! string targets; resolution bounds the chase depth).
//!
//! File content is held behind an `Arc` and is replaced, never mutated,
//! on write. A cloned directory spine therefore shares content with the
//! original and sees a frozen view, which is what makes VFS snapshots
//! cheap.

use std::collections::BTreeMap;
use std::sync::Arc;

/// Reference-counted file content. Writes replace the whole `Arc`.
pub type FileContent = Arc<Vec<u8>>;

/// What kind of node a path resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Symbolic link.
    Symlink,
}

impl NodeKind {
    /// Short name used in stat payloads and the state blob.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
            NodeKind::Symlink => "symlink",
        }
    }
}

/// Per-node metadata: Unix-style permission bits plus timestamps in
/// seconds since the epoch.
#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    /// Permission bits (octal, e.g. `0o644`). Type lives in the variant.
    pub permissions: u32,
    /// Last modification time.
    pub mtime: u64,
    /// Inode change time.
    pub ctime: u64,
    /// Last access time.
    pub atime: u64,
}

impl Metadata {
    /// Create metadata with all timestamps set to `now`.
    pub fn new(permissions: u32, now: u64) -> Self {
        Metadata {
            permissions,
            mtime: now,
            ctime: now,
            atime: now,
        }
    }
}

/// Default permission bits for files created without an explicit mode.
pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;
/// Default permission bits for directories.
pub const DEFAULT_DIR_PERMISSIONS: u32 = 0o755;
/// Default permission bits for symlinks.
pub const DEFAULT_SYMLINK_PERMISSIONS: u32 = 0o777;

/// A filesystem node: metadata plus exactly one content variant.
#[derive(Debug, Clone)]
pub struct Inode {
    pub meta: Metadata,
    pub content: InodeContent,
}

/// The three node variants. The set is closed so every consumer can
/// match exhaustively.
#[derive(Debug, Clone)]
pub enum InodeContent {
    /// Regular file owning its bytes (shared by reference, replaced on write).
    File(FileContent),
    /// Directory owning a name → child mapping. Name uniqueness is
    /// enforced by the map.
    Directory(BTreeMap<String, Inode>),
    /// Symbolic link owning its target path (absolute or relative).
    Symlink(String),
}

impl Inode {
    /// Create a regular file node.
    pub fn file(data: Vec<u8>, permissions: u32, now: u64) -> Self {
        Inode {
            meta: Metadata::new(permissions, now),
            content: InodeContent::File(Arc::new(data)),
        }
    }

    /// Create an empty directory node.
    pub fn dir(permissions: u32, now: u64) -> Self {
        Inode {
            meta: Metadata::new(permissions, now),
            content: InodeContent::Directory(BTreeMap::new()),
        }
    }

    /// Create a symlink node pointing at `target`.
    pub fn symlink(target: impl Into<String>, now: u64) -> Self {
        Inode {
            meta: Metadata::new(DEFAULT_SYMLINK_PERMISSIONS, now),
            content: InodeContent::Symlink(target.into()),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self.content {
            InodeContent::File(_) => NodeKind::File,
            InodeContent::Directory(_) => NodeKind::Dir,
            InodeContent::Symlink(_) => NodeKind::Symlink,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.content, InodeContent::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.content, InodeContent::File(_))
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.content, InodeContent::Symlink(_))
    }

    /// Logical size: content length for files, target length for
    /// symlinks, zero for directories.
    pub fn size(&self) -> u64 {
        match &self.content {
            InodeContent::File(data) => data.len() as u64,
            InodeContent::Directory(_) => 0,
            InodeContent::Symlink(target) => target.len() as u64,
        }
    }

    /// Child map of a directory node.
    pub fn children(&self) -> Option<&BTreeMap<String, Inode>> {
        match &self.content {
            InodeContent::Directory(entries) => Some(entries),
            _ => None,
        }
    }

    /// Mutable child map of a directory node.
    pub fn children_mut(&mut self) -> Option<&mut BTreeMap<String, Inode>> {
        match &mut self.content {
            InodeContent::Directory(entries) => Some(entries),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(Inode::file(vec![1, 2], 0o644, 0).kind(), NodeKind::File);
        assert_eq!(Inode::dir(0o755, 0).kind(), NodeKind::Dir);
        assert_eq!(Inode::symlink("/tmp", 0).kind(), NodeKind::Symlink);
    }

    #[test]
    fn test_clone_shares_file_content() {
        let a = Inode::file(vec![0u8; 1024], 0o644, 0);
        let b = a.clone();
        let (InodeContent::File(ca), InodeContent::File(cb)) = (&a.content, &b.content) else {
            panic!("expected files");
        };
        assert!(Arc::ptr_eq(ca, cb));
    }

    #[test]
    fn test_clone_deep_copies_directory_spine() {
        let mut root = Inode::dir(0o755, 0);
        root.children_mut()
            .unwrap()
            .insert("a.txt".into(), Inode::file(b"abc".to_vec(), 0o644, 0));
        let snap = root.clone();

        // Mutating the original map must not show up in the clone.
        root.children_mut().unwrap().remove("a.txt");
        assert!(snap.children().unwrap().contains_key("a.txt"));
    }

    #[test]
    fn test_size() {
        assert_eq!(Inode::file(b"hello".to_vec(), 0o644, 0).size(), 5);
        assert_eq!(Inode::dir(0o755, 0).size(), 0);
        assert_eq!(Inode::symlink("/x", 0).size(), 2);
    }
}
