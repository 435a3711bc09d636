//! Virtual File System
//!
//! Path resolution, quotas, write policy, snapshots and virtual mounts
//! over the inode tree. Every operation takes an absolute path; virtual
//! mount prefixes are consulted before the physical tree, so a provider
//! fully shadows the subtree under its prefix.
//!
//! Mutations outside the writable prefix set fail with `EROFS` unless
//! performed inside a bypass scope (used for the default layout and for
//! state import). `write_file` replaces content rather than mutating it,
//! which is what keeps snapshot views frozen.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::inode::{
    Inode, InodeContent, NodeKind, DEFAULT_DIR_PERMISSIONS, DEFAULT_FILE_PERMISSIONS,
};
use crate::provider::VirtualProvider;

/// Maximum number of symlinks chased during one resolution.
pub const MAX_SYMLINK_DEPTH: usize = 40;

/// A VFS shared between the kernel, the WASI hosts and the facade.
pub type SharedVfs = Arc<parking_lot::Mutex<Vfs>>;

/// VFS error taxonomy. A closed set; every operation fails with exactly
/// one of these kinds. The display form carries both the POSIX-style
/// code and a short message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VfsError {
    /// Missing path component, or symlink depth exceeded.
    #[error("ENOENT: {0}")]
    NotFound(String),
    /// Traversal through (or readdir on) a non-directory.
    #[error("ENOTDIR: not a directory: {0}")]
    NotDirectory(String),
    /// Read/write/unlink applied to a directory.
    #[error("EISDIR: is a directory: {0}")]
    IsDirectory(String),
    /// Creating a name that already exists.
    #[error("EEXIST: file exists: {0}")]
    AlreadyExists(String),
    /// rmdir on a non-empty directory.
    #[error("ENOTEMPTY: directory not empty: {0}")]
    NotEmpty(String),
    /// Mutation outside the writable prefix set.
    #[error("EROFS: read-only file system: {0}")]
    ReadOnly(String),
    /// Byte quota or entry-count quota exceeded.
    #[error("ENOSPC: no space left on device")]
    NoSpace,
}

impl VfsError {
    /// The POSIX-style code alone, e.g. `"ENOENT"`.
    pub fn code(&self) -> &'static str {
        match self {
            VfsError::NotFound(_) => "ENOENT",
            VfsError::NotDirectory(_) => "ENOTDIR",
            VfsError::IsDirectory(_) => "EISDIR",
            VfsError::AlreadyExists(_) => "EEXIST",
            VfsError::NotEmpty(_) => "ENOTEMPTY",
            VfsError::ReadOnly(_) => "EROFS",
            VfsError::NoSpace => "ENOSPC",
        }
    }

    fn not_found(path: &str) -> Self {
        VfsError::NotFound(format!("no such file or directory: {path}"))
    }

    fn symlink_loop(path: &str) -> Self {
        VfsError::NotFound(format!("too many levels of symbolic links: {path}"))
    }
}

/// Stat information for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub kind: NodeKind,
    pub size: u64,
    pub permissions: u32,
    pub mtime: u64,
    pub ctime: u64,
    pub atime: u64,
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// Identifier of a snapshot held in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(pub u64);

/// Resource limits applied to the tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct VfsLimits {
    /// Maximum total file-content bytes (`None` = unlimited).
    pub fs_limit: Option<u64>,
    /// Maximum number of entries, files plus directories (`None` = unlimited).
    pub entry_limit: Option<u64>,
}

// ─── Path helpers ──────────────────────────────────────────────

/// Split an absolute path into segments, dropping empty and `.` parts
/// and applying `..` as pop (never underflowing the root).
pub fn normalize(path: &str) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other.to_string()),
        }
    }
    parts
}

/// Join segments back into an absolute textual path.
pub fn join_segments(segments: &[String]) -> String {
    if segments.is_empty() {
        String::from("/")
    } else {
        let mut out = String::new();
        for seg in segments {
            out.push('/');
            out.push_str(seg);
        }
        out
    }
}

/// Normalized textual form of an absolute path.
pub fn normalize_path(path: &str) -> String {
    join_segments(&normalize(path))
}

/// Prefix containment on normalized textual paths.
fn under_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

struct Mount {
    prefix: String,
    provider: Arc<dyn VirtualProvider>,
}

struct Snapshot {
    root: Inode,
    total_bytes: u64,
    entry_count: u64,
}

/// The virtual filesystem.
pub struct Vfs {
    root: Inode,
    total_bytes: u64,
    entry_count: u64,
    limits: VfsLimits,
    writable: Vec<String>,
    bypass: bool,
    snapshots: BTreeMap<SnapshotId, Snapshot>,
    next_snapshot: u64,
    mounts: Vec<Mount>,
    wall_base: u64,
    started: Instant,
}

impl Vfs {
    /// Create an empty VFS with the default writable set (`/home`, `/tmp`)
    /// and no limits.
    pub fn new() -> Self {
        Self::with_limits(VfsLimits::default())
    }

    /// Create an empty VFS with the given limits.
    pub fn with_limits(limits: VfsLimits) -> Self {
        let wall_base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Vfs {
            root: Inode::dir(DEFAULT_DIR_PERMISSIONS, wall_base),
            total_bytes: 0,
            entry_count: 1, // the root itself
            limits,
            writable: vec![String::from("/home"), String::from("/tmp")],
            bypass: false,
            snapshots: BTreeMap::new(),
            next_snapshot: 1,
            mounts: Vec::new(),
            wall_base,
            started: Instant::now(),
        }
    }

    /// Current wall-clock seconds used for timestamps.
    pub fn now_secs(&self) -> u64 {
        self.wall_base + self.started.elapsed().as_secs()
    }

    /// Total file-content bytes currently charged against the quota.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Number of entries (files + directories + symlinks), root included.
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Replace the writable prefix set.
    pub fn set_writable_paths(&mut self, prefixes: Vec<String>) {
        self.writable = prefixes.into_iter().map(|p| normalize_path(&p)).collect();
    }

    pub fn writable_paths(&self) -> &[String] {
        &self.writable
    }

    /// Run `f` with the write policy bypassed. Used for the default
    /// layout and for state import.
    pub fn with_bypass<R>(&mut self, f: impl FnOnce(&mut Vfs) -> R) -> R {
        let prev = self.bypass;
        self.bypass = true;
        let out = f(self);
        self.bypass = prev;
        out
    }

    // ─── Mounts ────────────────────────────────────────────────

    /// Mount a virtual provider at an absolute prefix. Prefixes must not
    /// overlap each other or shadow the root.
    pub fn mount(
        &mut self,
        prefix: &str,
        provider: Arc<dyn VirtualProvider>,
    ) -> Result<(), VfsError> {
        let prefix = normalize_path(prefix);
        if prefix == "/" {
            return Err(VfsError::AlreadyExists(String::from("/")));
        }
        for m in &self.mounts {
            if under_prefix(&prefix, &m.prefix) || under_prefix(&m.prefix, &prefix) {
                return Err(VfsError::AlreadyExists(prefix));
            }
        }
        self.mounts.push(Mount { prefix, provider });
        Ok(())
    }

    /// Provider and sub-path for a path under a mount, if any.
    fn mount_for(&self, path: &str) -> Option<(&Arc<dyn VirtualProvider>, String)> {
        let norm = normalize_path(path);
        for m in &self.mounts {
            if under_prefix(&norm, &m.prefix) {
                let sub = norm[m.prefix.len()..].trim_start_matches('/').to_string();
                return Some((&m.provider, sub));
            }
        }
        None
    }

    /// Whether a normalized path lies under any mount prefix.
    pub fn is_mounted(&self, path: &str) -> bool {
        self.mount_for(path).is_some()
    }

    // ─── Resolution ────────────────────────────────────────────

    fn node_at(&self, segments: &[String]) -> Option<&Inode> {
        let mut node = &self.root;
        for seg in segments {
            node = node.children()?.get(seg)?;
        }
        Some(node)
    }

    fn node_at_mut(&mut self, segments: &[String]) -> Option<&mut Inode> {
        let mut node = &mut self.root;
        for seg in segments {
            node = node.children_mut()?.get_mut(seg)?;
        }
        Some(node)
    }

    /// Resolve a path to canonical physical segments, chasing symlinks
    /// with a bounded depth. `follow_leaf` selects whether a symlink in
    /// final position is chased (true for read/stat/write, false for
    /// readlink/unlink/rename).
    fn resolve_segments(&self, path: &str, follow_leaf: bool) -> Result<Vec<String>, VfsError> {
        // `.` and `..` in the request are applied at parse time; the
        // in-loop cases below only fire for segments injected by symlink
        // targets.
        let mut queue: VecDeque<String> = normalize(path).into();
        let mut resolved: Vec<String> = Vec::new();
        let mut depth = 0usize;

        while let Some(seg) = queue.pop_front() {
            match seg.as_str() {
                "." => continue,
                ".." => {
                    resolved.pop();
                    continue;
                }
                _ => {}
            }

            let node = self
                .node_at(&resolved)
                .ok_or_else(|| VfsError::not_found(path))?;
            let children = match node.children() {
                Some(c) => c,
                None => return Err(VfsError::NotDirectory(join_segments(&resolved))),
            };
            let child = children.get(&seg).ok_or_else(|| VfsError::not_found(path))?;

            if let InodeContent::Symlink(target) = &child.content {
                if queue.is_empty() && !follow_leaf {
                    resolved.push(seg);
                    return Ok(resolved);
                }
                depth += 1;
                if depth > MAX_SYMLINK_DEPTH {
                    return Err(VfsError::symlink_loop(path));
                }
                if target.starts_with('/') {
                    resolved.clear();
                }
                for part in target.split('/').rev().filter(|s| !s.is_empty()) {
                    queue.push_front(part.to_string());
                }
                continue;
            }

            resolved.push(seg);
        }

        Ok(resolved)
    }

    /// Resolve the parent of `path`, chasing intermediate symlinks, and
    /// return `(canonical parent segments, final name)`. The root itself
    /// is never a valid mutation target.
    fn resolve_parent(&self, path: &str) -> Result<(Vec<String>, String), VfsError> {
        let norm = normalize(path);
        let name = match norm.last() {
            Some(n) => n.clone(),
            None => return Err(VfsError::IsDirectory(String::from("/"))),
        };
        let parent_txt = join_segments(&norm[..norm.len() - 1]);
        let parent = self.resolve_segments(&parent_txt, true)?;
        // The parent must actually be a directory.
        match self.node_at(&parent) {
            Some(node) if node.is_dir() => Ok((parent, name)),
            Some(_) => Err(VfsError::NotDirectory(parent_txt)),
            None => Err(VfsError::not_found(path)),
        }
    }

    // ─── Policy / quota ────────────────────────────────────────

    fn check_writable(&self, canonical: &str) -> Result<(), VfsError> {
        if self.bypass {
            return Ok(());
        }
        if self.writable.iter().any(|p| under_prefix(canonical, p)) {
            Ok(())
        } else {
            Err(VfsError::ReadOnly(canonical.to_string()))
        }
    }

    fn charge(&mut self, byte_delta: i64, entry_delta: i64) -> Result<(), VfsError> {
        let bytes = self.total_bytes as i64 + byte_delta;
        let entries = self.entry_count as i64 + entry_delta;
        debug_assert!(bytes >= 0 && entries >= 0);
        if let Some(limit) = self.limits.fs_limit {
            if bytes as u64 > limit {
                return Err(VfsError::NoSpace);
            }
        }
        if let Some(limit) = self.limits.entry_limit {
            if entries as u64 > limit {
                return Err(VfsError::NoSpace);
            }
        }
        self.total_bytes = bytes as u64;
        self.entry_count = entries as u64;
        Ok(())
    }

    // ─── Read side ─────────────────────────────────────────────

    /// Read the full content of a regular file.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        if let Some((provider, sub)) = self.mount_for(path) {
            return provider.read(&sub);
        }
        let segs = self.resolve_segments(path, true)?;
        match self.node_at(&segs) {
            Some(node) => match &node.content {
                InodeContent::File(data) => Ok(data.as_ref().clone()),
                InodeContent::Directory(_) => Err(VfsError::IsDirectory(join_segments(&segs))),
                InodeContent::Symlink(_) => unreachable!("leaf symlink was followed"),
            },
            None => Err(VfsError::not_found(path)),
        }
    }

    /// Read a window of a file, used by open-descriptor reads.
    pub fn read_file_at(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, VfsError> {
        if let Some((provider, sub)) = self.mount_for(path) {
            return provider.read_at(&sub, offset, len);
        }
        let data = self.read_file(path)?;
        let start = (offset as usize).min(data.len());
        let end = (start + len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    /// Whether a path resolves at all (mounts included).
    pub fn exists(&self, path: &str) -> bool {
        if let Some((provider, sub)) = self.mount_for(path) {
            return provider.exists(&sub);
        }
        self.resolve_segments(path, true)
            .ok()
            .and_then(|segs| self.node_at(&segs))
            .is_some()
    }

    /// Stat a path, following a leaf symlink.
    pub fn stat(&self, path: &str) -> Result<FileStat, VfsError> {
        if let Some((provider, sub)) = self.mount_for(path) {
            return provider.stat(&sub);
        }
        let segs = self.resolve_segments(path, true)?;
        let node = self.node_at(&segs).ok_or_else(|| VfsError::not_found(path))?;
        Ok(FileStat {
            kind: node.kind(),
            size: node.size(),
            permissions: node.meta.permissions,
            mtime: node.meta.mtime,
            ctime: node.meta.ctime,
            atime: node.meta.atime,
        })
    }

    /// List a directory, sorted by name.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, VfsError> {
        if let Some((provider, sub)) = self.mount_for(path) {
            return provider.readdir(&sub);
        }
        let segs = self.resolve_segments(path, true)?;
        let node = self.node_at(&segs).ok_or_else(|| VfsError::not_found(path))?;
        match node.children() {
            Some(entries) => Ok(entries
                .iter()
                .map(|(name, child)| DirEntry {
                    name: name.clone(),
                    kind: child.kind(),
                })
                .collect()),
            None => Err(VfsError::NotDirectory(join_segments(&segs))),
        }
    }

    /// Read a symlink's target without following it.
    pub fn read_link(&self, path: &str) -> Result<String, VfsError> {
        let segs = self.resolve_segments(path, false)?;
        let node = self.node_at(&segs).ok_or_else(|| VfsError::not_found(path))?;
        match &node.content {
            InodeContent::Symlink(target) => Ok(target.clone()),
            _ => Err(VfsError::NotFound(format!(
                "not a symbolic link: {}",
                join_segments(&segs)
            ))),
        }
    }

    // ─── Write side ────────────────────────────────────────────

    /// Write a file, replacing its content (creating it if missing).
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), VfsError> {
        if let Some((provider, sub)) = self.mount_for(path) {
            return provider.write(&sub, data);
        }
        let now = self.now_secs();

        // Follow a leaf symlink if the target exists; otherwise create at
        // the textual location.
        let (parent, name) = match self.resolve_segments(path, true) {
            Ok(mut segs) => {
                let name = match segs.pop() {
                    Some(n) => n,
                    None => return Err(VfsError::IsDirectory(String::from("/"))),
                };
                (segs, name)
            }
            Err(VfsError::NotFound(_)) => self.resolve_parent(path)?,
            Err(e) => return Err(e),
        };
        let canonical = format!("{}/{}", join_segments(&parent).trim_end_matches('/'), name);
        self.check_writable(&canonical)?;

        let existing_len = {
            let dir = self
                .node_at(&parent)
                .ok_or_else(|| VfsError::not_found(path))?;
            let children = dir
                .children()
                .ok_or_else(|| VfsError::NotDirectory(join_segments(&parent)))?;
            match children.get(&name) {
                Some(node) => match &node.content {
                    InodeContent::File(old) => Some(old.len() as i64),
                    InodeContent::Directory(_) => {
                        return Err(VfsError::IsDirectory(canonical));
                    }
                    InodeContent::Symlink(_) => {
                        // Dangling leaf symlink: replace the link itself.
                        Some(0)
                    }
                },
                None => None,
            }
        };

        match existing_len {
            Some(old_len) => {
                self.charge(data.len() as i64 - old_len, 0)?;
                let dir = self.node_at_mut(&parent).expect("parent resolved");
                let entry = dir.children_mut().expect("parent is dir").get_mut(&name);
                if let Some(node) = entry {
                    node.content = InodeContent::File(Arc::new(data.to_vec()));
                    node.meta.mtime = now;
                }
            }
            None => {
                self.charge(data.len() as i64, 1)?;
                let dir = self.node_at_mut(&parent).expect("parent resolved");
                dir.children_mut()
                    .expect("parent is dir")
                    .insert(name, Inode::file(data.to_vec(), DEFAULT_FILE_PERMISSIONS, now));
            }
        }
        Ok(())
    }

    /// Append to a file, creating it if missing. Content is replaced, not
    /// mutated in place, so snapshot sharing stays intact.
    pub fn append_file(&mut self, path: &str, data: &[u8]) -> Result<(), VfsError> {
        if let Some((provider, sub)) = self.mount_for(path) {
            return provider.write(&sub, data);
        }
        let mut combined = match self.read_file(path) {
            Ok(existing) => existing,
            Err(VfsError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        combined.extend_from_slice(data);
        self.write_file(path, &combined)
    }

    /// Create a directory. The parent must exist.
    pub fn mkdir(&mut self, path: &str) -> Result<(), VfsError> {
        if self.mount_for(path).is_some() {
            return Err(VfsError::ReadOnly(normalize_path(path)));
        }
        if normalize(path).is_empty() {
            return Err(VfsError::AlreadyExists(String::from("/")));
        }
        let (parent, name) = self.resolve_parent(path)?;
        let canonical = format!("{}/{}", join_segments(&parent).trim_end_matches('/'), name);
        self.check_writable(&canonical)?;

        {
            let dir = self.node_at(&parent).expect("parent resolved");
            if dir.children().expect("parent is dir").contains_key(&name) {
                return Err(VfsError::AlreadyExists(canonical));
            }
        }
        self.charge(0, 1)?;
        let now = self.now_secs();
        let dir = self.node_at_mut(&parent).expect("parent resolved");
        dir.children_mut()
            .expect("parent is dir")
            .insert(name, Inode::dir(DEFAULT_DIR_PERMISSIONS, now));
        Ok(())
    }

    /// Create a directory and all missing ancestors. Idempotent.
    pub fn mkdirp(&mut self, path: &str) -> Result<(), VfsError> {
        let segments = normalize(path);
        let mut current = Vec::new();
        for seg in segments {
            current.push(seg);
            let txt = join_segments(&current);
            match self.mkdir(&txt) {
                Ok(()) => {}
                Err(VfsError::AlreadyExists(_)) => {
                    // Fine as long as the existing entry is a directory.
                    let segs = self.resolve_segments(&txt, true)?;
                    let node = self
                        .node_at(&segs)
                        .ok_or_else(|| VfsError::not_found(&txt))?;
                    if !node.is_dir() {
                        return Err(VfsError::NotDirectory(txt));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Unlink a file or symlink. Directories fail with `EISDIR`.
    pub fn rm(&mut self, path: &str) -> Result<(), VfsError> {
        if self.mount_for(path).is_some() {
            return Err(VfsError::ReadOnly(normalize_path(path)));
        }
        let segs = self.resolve_segments(path, false)?;
        let (parent, name) = match segs.split_last() {
            Some((name, parent)) => (parent.to_vec(), name.clone()),
            None => return Err(VfsError::IsDirectory(String::from("/"))),
        };
        let canonical = join_segments(&segs);
        self.check_writable(&canonical)?;

        let removed_bytes = {
            let dir = self
                .node_at(&parent)
                .ok_or_else(|| VfsError::not_found(path))?;
            let children = dir
                .children()
                .ok_or_else(|| VfsError::NotDirectory(join_segments(&parent)))?;
            let node = children.get(&name).ok_or_else(|| VfsError::not_found(path))?;
            match &node.content {
                InodeContent::Directory(_) => return Err(VfsError::IsDirectory(canonical)),
                InodeContent::File(data) => data.len() as i64,
                InodeContent::Symlink(_) => 0,
            }
        };
        let dir = self.node_at_mut(&parent).expect("parent resolved");
        dir.children_mut().expect("parent is dir").remove(&name);
        self.charge(-removed_bytes, -1).expect("removal frees quota");
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<(), VfsError> {
        if self.mount_for(path).is_some() {
            return Err(VfsError::ReadOnly(normalize_path(path)));
        }
        let segs = self.resolve_segments(path, false)?;
        let (parent, name) = match segs.split_last() {
            Some((name, parent)) => (parent.to_vec(), name.clone()),
            None => return Err(VfsError::IsDirectory(String::from("/"))),
        };
        let canonical = join_segments(&segs);
        self.check_writable(&canonical)?;

        {
            let dir = self
                .node_at(&parent)
                .ok_or_else(|| VfsError::not_found(path))?;
            let children = dir
                .children()
                .ok_or_else(|| VfsError::NotDirectory(join_segments(&parent)))?;
            let node = children.get(&name).ok_or_else(|| VfsError::not_found(path))?;
            match node.children() {
                Some(entries) if entries.is_empty() => {}
                Some(_) => return Err(VfsError::NotEmpty(canonical)),
                None => return Err(VfsError::NotDirectory(canonical)),
            }
        }
        let dir = self.node_at_mut(&parent).expect("parent resolved");
        dir.children_mut().expect("parent is dir").remove(&name);
        self.charge(0, -1).expect("removal frees quota");
        Ok(())
    }

    /// Rename a file, symlink or whole subtree. The destination must not
    /// already exist (except replacing a regular file with another).
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), VfsError> {
        if self.mount_for(old).is_some() || self.mount_for(new).is_some() {
            return Err(VfsError::ReadOnly(normalize_path(old)));
        }
        let old_segs = self.resolve_segments(old, false)?;
        let (old_parent, old_name) = match old_segs.split_last() {
            Some((name, parent)) => (parent.to_vec(), name.clone()),
            None => return Err(VfsError::IsDirectory(String::from("/"))),
        };
        self.check_writable(&join_segments(&old_segs))?;
        let (new_parent, new_name) = self.resolve_parent(new)?;
        let new_canonical = format!(
            "{}/{}",
            join_segments(&new_parent).trim_end_matches('/'),
            new_name
        );
        self.check_writable(&new_canonical)?;

        // Take the node out of the old parent.
        let node = {
            let dir = self
                .node_at_mut(&old_parent)
                .ok_or_else(|| VfsError::not_found(old))?;
            let children = dir
                .children_mut()
                .ok_or_else(|| VfsError::NotDirectory(join_segments(&old_parent)))?;
            children
                .remove(&old_name)
                .ok_or_else(|| VfsError::not_found(old))?
        };

        let replaced_bytes = {
            let dir = self.node_at(&new_parent).expect("parent resolved");
            let children = dir.children().expect("parent is dir");
            match children.get(&new_name) {
                None => None,
                Some(existing) if existing.is_file() && node.is_file() => {
                    Some(existing.size() as i64)
                }
                Some(_) => {
                    // Put the node back before failing.
                    let dir = self.node_at_mut(&old_parent).expect("parent resolved");
                    dir.children_mut()
                        .expect("parent is dir")
                        .insert(old_name, node);
                    return Err(VfsError::AlreadyExists(new_canonical));
                }
            }
        };

        if let Some(old_len) = replaced_bytes {
            // Replacing a file frees its bytes and one entry.
            self.charge(-old_len, -1).expect("replacement frees quota");
        }
        let dir = self.node_at_mut(&new_parent).expect("parent resolved");
        dir.children_mut()
            .expect("parent is dir")
            .insert(new_name, node);
        Ok(())
    }

    /// Create a symlink at `linkpath` pointing at `target`.
    pub fn symlink(&mut self, target: &str, linkpath: &str) -> Result<(), VfsError> {
        if self.mount_for(linkpath).is_some() {
            return Err(VfsError::ReadOnly(normalize_path(linkpath)));
        }
        let (parent, name) = self.resolve_parent(linkpath)?;
        let canonical = format!("{}/{}", join_segments(&parent).trim_end_matches('/'), name);
        self.check_writable(&canonical)?;
        {
            let dir = self.node_at(&parent).expect("parent resolved");
            if dir.children().expect("parent is dir").contains_key(&name) {
                return Err(VfsError::AlreadyExists(canonical));
            }
        }
        self.charge(0, 1)?;
        let now = self.now_secs();
        let dir = self.node_at_mut(&parent).expect("parent resolved");
        dir.children_mut()
            .expect("parent is dir")
            .insert(name, Inode::symlink(target, now));
        Ok(())
    }

    /// Set permission bits on an existing node.
    pub fn set_permissions(&mut self, path: &str, permissions: u32) -> Result<(), VfsError> {
        if self.mount_for(path).is_some() {
            return Err(VfsError::ReadOnly(normalize_path(path)));
        }
        let segs = self.resolve_segments(path, true)?;
        self.check_writable(&join_segments(&segs))?;
        let now = self.now_secs();
        let node = self
            .node_at_mut(&segs)
            .ok_or_else(|| VfsError::not_found(path))?;
        node.meta.permissions = permissions;
        node.meta.ctime = now;
        Ok(())
    }

    // ─── Snapshots ─────────────────────────────────────────────

    /// Take a snapshot: the directory spine is cloned, file content is
    /// shared by reference.
    pub fn snapshot(&mut self) -> SnapshotId {
        let id = SnapshotId(self.next_snapshot);
        self.next_snapshot += 1;
        self.snapshots.insert(
            id,
            Snapshot {
                root: self.root.clone(),
                total_bytes: self.total_bytes,
                entry_count: self.entry_count,
            },
        );
        id
    }

    /// Restore a snapshot into the live root. The snapshot stays
    /// registered, so restoring the same id twice is idempotent.
    pub fn restore(&mut self, id: SnapshotId) -> Result<(), VfsError> {
        let snap = self
            .snapshots
            .get(&id)
            .ok_or_else(|| VfsError::NotFound(format!("no such snapshot: {}", id.0)))?;
        self.root = snap.root.clone();
        self.total_bytes = snap.total_bytes;
        self.entry_count = snap.entry_count;
        Ok(())
    }

    /// Read a file as it appears in a snapshot.
    pub fn read_file_in_snapshot(&self, id: SnapshotId, path: &str) -> Result<Vec<u8>, VfsError> {
        let snap = self
            .snapshots
            .get(&id)
            .ok_or_else(|| VfsError::NotFound(format!("no such snapshot: {}", id.0)))?;
        let mut node = &snap.root;
        for seg in normalize(path) {
            node = node
                .children()
                .and_then(|c| c.get(&seg))
                .ok_or_else(|| VfsError::not_found(path))?;
        }
        match &node.content {
            InodeContent::File(data) => Ok(data.as_ref().clone()),
            _ => Err(VfsError::IsDirectory(normalize_path(path))),
        }
    }

    /// Produce an independent VFS sharing file content with this one.
    pub fn cow_clone(&self) -> Vfs {
        Vfs {
            root: self.root.clone(),
            total_bytes: self.total_bytes,
            entry_count: self.entry_count,
            limits: self.limits,
            writable: self.writable.clone(),
            bypass: false,
            snapshots: BTreeMap::new(),
            next_snapshot: 1,
            mounts: self.mounts.iter().map(|m| Mount {
                prefix: m.prefix.clone(),
                provider: Arc::clone(&m.provider),
            }).collect(),
            wall_base: self.wall_base,
            started: self.started,
        }
    }

    // ─── Traversal (export / glob) ─────────────────────────────

    /// Pre-order walk over the physical tree, excluding mount subtrees.
    /// The callback receives the normalized absolute path and the node.
    pub fn visit(&self, mut f: impl FnMut(&str, &Inode)) {
        fn walk(
            vfs: &Vfs,
            path: &str,
            node: &Inode,
            f: &mut impl FnMut(&str, &Inode),
        ) {
            if vfs.is_mounted(path) {
                return;
            }
            f(path, node);
            if let Some(children) = node.children() {
                for (name, child) in children {
                    let child_path = if path == "/" {
                        format!("/{name}")
                    } else {
                        format!("{path}/{name}")
                    };
                    walk(vfs, &child_path, child, f);
                }
            }
        }
        let root = self.root.clone();
        walk(self, "/", &root, &mut f);
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writable_vfs() -> Vfs {
        let mut vfs = Vfs::new();
        vfs.with_bypass(|v| {
            v.mkdirp("/home/user").unwrap();
            v.mkdirp("/tmp").unwrap();
            v.mkdirp("/etc").unwrap();
        });
        vfs
    }

    #[test]
    fn test_write_then_read() {
        let mut vfs = writable_vfs();
        vfs.write_file("/home/user/a.txt", b"abc").unwrap();
        assert_eq!(vfs.read_file("/home/user/a.txt").unwrap(), b"abc");
    }

    #[test]
    fn test_write_zero_bytes_creates_empty_file() {
        let mut vfs = writable_vfs();
        vfs.write_file("/home/user/empty", b"").unwrap();
        assert_eq!(vfs.read_file("/home/user/empty").unwrap(), b"");
        assert_eq!(vfs.stat("/home/user/empty").unwrap().size, 0);
    }

    #[test]
    fn test_missing_path_is_enoent() {
        let vfs = writable_vfs();
        let err = vfs.read_file("/home/user/nope").unwrap_err();
        assert_eq!(err.code(), "ENOENT");
    }

    #[test]
    fn test_read_dir_as_file_is_eisdir() {
        let vfs = writable_vfs();
        assert_eq!(vfs.read_file("/home").unwrap_err().code(), "EISDIR");
    }

    #[test]
    fn test_traverse_through_file_is_enotdir() {
        let mut vfs = writable_vfs();
        vfs.write_file("/home/user/f", b"x").unwrap();
        let err = vfs.read_file("/home/user/f/deeper").unwrap_err();
        assert_eq!(err.code(), "ENOTDIR");
    }

    #[test]
    fn test_write_outside_writable_set_is_erofs() {
        let mut vfs = writable_vfs();
        let err = vfs.write_file("/etc/passwd", b"root").unwrap_err();
        assert_eq!(err.code(), "EROFS");
        // Inside the writable set the same operation succeeds.
        vfs.write_file("/tmp/passwd", b"root").unwrap();
    }

    #[test]
    fn test_bypass_scope_allows_readonly_paths() {
        let mut vfs = writable_vfs();
        vfs.with_bypass(|v| v.write_file("/etc/passwd", b"root")).unwrap();
        assert_eq!(vfs.read_file("/etc/passwd").unwrap(), b"root");
    }

    #[test]
    fn test_mkdir_existing_is_eexist_and_mkdirp_is_idempotent() {
        let mut vfs = writable_vfs();
        vfs.mkdir("/tmp/d").unwrap();
        assert_eq!(vfs.mkdir("/tmp/d").unwrap_err().code(), "EEXIST");
        vfs.mkdirp("/tmp/d").unwrap();
        vfs.mkdirp("/tmp/d/e/f").unwrap();
        assert!(vfs.exists("/tmp/d/e/f"));
    }

    #[test]
    fn test_rmdir_non_empty_is_enotempty() {
        let mut vfs = writable_vfs();
        vfs.mkdirp("/tmp/d").unwrap();
        vfs.write_file("/tmp/d/f", b"x").unwrap();
        assert_eq!(vfs.rmdir("/tmp/d").unwrap_err().code(), "ENOTEMPTY");
        vfs.rm("/tmp/d/f").unwrap();
        vfs.rmdir("/tmp/d").unwrap();
        assert!(!vfs.exists("/tmp/d"));
    }

    #[test]
    fn test_unlink_directory_is_eisdir() {
        let mut vfs = writable_vfs();
        vfs.mkdirp("/tmp/d").unwrap();
        assert_eq!(vfs.rm("/tmp/d").unwrap_err().code(), "EISDIR");
    }

    #[test]
    fn test_quota_byte_accounting() {
        let mut vfs = Vfs::with_limits(VfsLimits {
            fs_limit: Some(10),
            entry_limit: None,
        });
        vfs.with_bypass(|v| v.mkdirp("/home/user")).unwrap();
        vfs.write_file("/home/user/a", b"12345").unwrap();
        assert_eq!(vfs.total_bytes(), 5);
        // Replacement charges only the delta.
        vfs.write_file("/home/user/a", b"1234567890").unwrap();
        assert_eq!(vfs.total_bytes(), 10);
        // Exactly at the limit: one more byte fails.
        let err = vfs.write_file("/home/user/b", b"x").unwrap_err();
        assert_eq!(err.code(), "ENOSPC");
        // Rewriting the same bytes does not change the total.
        vfs.write_file("/home/user/a", b"1234567890").unwrap();
        assert_eq!(vfs.total_bytes(), 10);
    }

    #[test]
    fn test_entry_limit() {
        let mut vfs = Vfs::with_limits(VfsLimits {
            fs_limit: None,
            entry_limit: Some(3), // root + 2
        });
        vfs.with_bypass(|v| v.mkdirp("/home")).unwrap();
        vfs.write_file("/home/a", b"").unwrap();
        assert_eq!(vfs.write_file("/home/b", b"").unwrap_err().code(), "ENOSPC");
    }

    #[test]
    fn test_symlink_resolution_and_readlink() {
        let mut vfs = writable_vfs();
        vfs.write_file("/home/user/real.txt", b"data").unwrap();
        vfs.symlink("/home/user/real.txt", "/home/user/link").unwrap();
        assert_eq!(vfs.read_file("/home/user/link").unwrap(), b"data");
        assert_eq!(vfs.read_link("/home/user/link").unwrap(), "/home/user/real.txt");
        // stat follows, readlink does not.
        assert_eq!(vfs.stat("/home/user/link").unwrap().kind, NodeKind::File);
    }

    #[test]
    fn test_relative_symlink() {
        let mut vfs = writable_vfs();
        vfs.mkdirp("/home/user/sub").unwrap();
        vfs.write_file("/home/user/sub/target", b"t").unwrap();
        vfs.symlink("sub/target", "/home/user/rel").unwrap();
        assert_eq!(vfs.read_file("/home/user/rel").unwrap(), b"t");
    }

    #[test]
    fn test_symlink_cycle_is_bounded() {
        let mut vfs = writable_vfs();
        vfs.symlink("/home/user/b", "/home/user/a").unwrap();
        vfs.symlink("/home/user/a", "/home/user/b").unwrap();
        let err = vfs.read_file("/home/user/a").unwrap_err();
        assert_eq!(err.code(), "ENOENT");
        assert!(err.to_string().contains("too many levels"));
    }

    #[test]
    fn test_unlink_removes_link_not_target() {
        let mut vfs = writable_vfs();
        vfs.write_file("/home/user/real", b"keep").unwrap();
        vfs.symlink("/home/user/real", "/home/user/link").unwrap();
        vfs.rm("/home/user/link").unwrap();
        assert!(!vfs.exists("/home/user/link"));
        assert_eq!(vfs.read_file("/home/user/real").unwrap(), b"keep");
    }

    #[test]
    fn test_dot_and_dotdot_normalization() {
        let mut vfs = writable_vfs();
        // `..` is applied at parse time, so the missing `x` never gets looked up.
        vfs.write_file("/home/user/./x/../a.txt", b"n").unwrap();
        vfs.rm("/home/user/a.txt").unwrap();
        vfs.write_file("/home/user/././a.txt", b"n").unwrap();
        assert_eq!(vfs.read_file("/home/../home/user/a.txt").unwrap(), b"n");
        // `..` never underflows the root.
        assert!(vfs.exists("/../../home/user/a.txt"));
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let mut vfs = writable_vfs();
        vfs.write_file("/home/user/a", b"v1").unwrap();
        let snap = vfs.snapshot();
        vfs.write_file("/home/user/a", b"v2").unwrap();
        vfs.write_file("/home/user/new", b"x").unwrap();

        assert_eq!(vfs.read_file_in_snapshot(snap, "/home/user/a").unwrap(), b"v1");
        assert_eq!(vfs.read_file("/home/user/a").unwrap(), b"v2");
    }

    #[test]
    fn test_restore_is_idempotent() {
        let mut vfs = writable_vfs();
        vfs.write_file("/home/user/a", b"v1").unwrap();
        let snap = vfs.snapshot();
        let bytes_at_snap = vfs.total_bytes();
        vfs.write_file("/home/user/a", b"longer content").unwrap();

        vfs.restore(snap).unwrap();
        assert_eq!(vfs.read_file("/home/user/a").unwrap(), b"v1");
        assert_eq!(vfs.total_bytes(), bytes_at_snap);
        vfs.restore(snap).unwrap();
        assert_eq!(vfs.read_file("/home/user/a").unwrap(), b"v1");
    }

    #[test]
    fn test_cow_clone_is_independent() {
        let mut vfs = writable_vfs();
        vfs.write_file("/home/user/a", b"orig").unwrap();
        let mut clone = vfs.cow_clone();
        clone.write_file("/home/user/a", b"clone").unwrap();
        assert_eq!(vfs.read_file("/home/user/a").unwrap(), b"orig");
        assert_eq!(clone.read_file("/home/user/a").unwrap(), b"clone");
    }

    #[test]
    fn test_rename_file_and_subtree() {
        let mut vfs = writable_vfs();
        vfs.write_file("/home/user/a", b"1").unwrap();
        vfs.rename("/home/user/a", "/home/user/b").unwrap();
        assert!(!vfs.exists("/home/user/a"));
        assert_eq!(vfs.read_file("/home/user/b").unwrap(), b"1");

        vfs.mkdirp("/home/user/d/sub").unwrap();
        vfs.write_file("/home/user/d/sub/f", b"deep").unwrap();
        let before = vfs.entry_count();
        vfs.rename("/home/user/d", "/tmp/d2").unwrap();
        assert_eq!(vfs.entry_count(), before);
        assert_eq!(vfs.read_file("/tmp/d2/sub/f").unwrap(), b"deep");
    }

    #[test]
    fn test_append_file() {
        let mut vfs = writable_vfs();
        vfs.append_file("/home/user/log", b"one\n").unwrap();
        vfs.append_file("/home/user/log", b"two\n").unwrap();
        assert_eq!(vfs.read_file("/home/user/log").unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn test_read_dir_sorted() {
        let mut vfs = writable_vfs();
        vfs.write_file("/home/user/b", b"").unwrap();
        vfs.write_file("/home/user/a", b"").unwrap();
        vfs.mkdirp("/home/user/c").unwrap();
        let names: Vec<String> = vfs
            .read_dir("/home/user")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_read_file_at_window() {
        let mut vfs = writable_vfs();
        vfs.write_file("/home/user/f", b"0123456789").unwrap();
        assert_eq!(vfs.read_file_at("/home/user/f", 3, 4).unwrap(), b"3456");
        assert_eq!(vfs.read_file_at("/home/user/f", 9, 4).unwrap(), b"9");
        assert_eq!(vfs.read_file_at("/home/user/f", 100, 4).unwrap(), b"");
    }

    #[test]
    fn test_mutating_root_rejected() {
        let mut vfs = writable_vfs();
        assert!(vfs.rm("/").is_err());
        assert!(vfs.write_file("/", b"x").is_err());
        assert_eq!(vfs.mkdir("/").unwrap_err().code(), "EEXIST");
    }
}
