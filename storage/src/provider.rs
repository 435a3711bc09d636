//! Virtual mount providers
//!
//! A provider synthesizes a subtree under a mounted prefix and
//! intercepts every VFS operation on it. Providers receive the sub-path
//! after the mount prefix (empty string for the mount root) and share
//! the VFS error taxonomy.

use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use crate::inode::NodeKind;
use crate::vfs::{DirEntry, FileStat, VfsError};

/// The capability contract every synthetic mount implements.
pub trait VirtualProvider: Send + Sync {
    /// Read the full content at `sub`.
    fn read(&self, sub: &str) -> Result<Vec<u8>, VfsError>;

    /// Write content at `sub`. Read-only providers fail with `EROFS`.
    fn write(&self, sub: &str, data: &[u8]) -> Result<(), VfsError>;

    /// Whether `sub` names an entry in the synthetic subtree.
    fn exists(&self, sub: &str) -> bool;

    /// Stat an entry.
    fn stat(&self, sub: &str) -> Result<FileStat, VfsError>;

    /// List a synthetic directory.
    fn readdir(&self, sub: &str) -> Result<Vec<DirEntry>, VfsError>;

    /// Windowed read for open-descriptor access. The default slices
    /// `read`; stream-like providers (zero, random) override it so the
    /// offset does not exhaust them.
    fn read_at(&self, sub: &str, offset: u64, len: usize) -> Result<Vec<u8>, VfsError> {
        let data = self.read(sub)?;
        let start = (offset as usize).min(data.len());
        let end = (start + len).min(data.len());
        Ok(data[start..end].to_vec())
    }
}

fn file_stat(size: u64, permissions: u32) -> FileStat {
    FileStat {
        kind: NodeKind::File,
        size,
        permissions,
        mtime: 0,
        ctime: 0,
        atime: 0,
    }
}

fn dir_stat() -> FileStat {
    FileStat {
        kind: NodeKind::Dir,
        size: 0,
        permissions: 0o555,
        mtime: 0,
        ctime: 0,
        atime: 0,
    }
}

// ─── Device provider ───────────────────────────────────────────

/// Device-like sinks and sources, typically mounted at `/dev`.
///
/// `null` discards writes and reads empty; `zero` reads zero-filled
/// bytes; `random` and `urandom` read cryptographically strong bytes.
/// Writes anywhere except `null` fail read-only.
pub struct DeviceProvider;

/// Bytes served per unwindowed read of a stream device.
const DEVICE_READ_CHUNK: usize = 4096;

const DEVICE_NAMES: &[&str] = &["null", "zero", "random", "urandom"];

impl DeviceProvider {
    pub fn new() -> Self {
        DeviceProvider
    }

    fn fill_random(len: usize) -> Result<Vec<u8>, VfsError> {
        let mut buf = vec![0u8; len];
        getrandom::getrandom(&mut buf)
            .map_err(|_| VfsError::NotFound(String::from("random source unavailable")))?;
        Ok(buf)
    }
}

impl Default for DeviceProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualProvider for DeviceProvider {
    fn read(&self, sub: &str) -> Result<Vec<u8>, VfsError> {
        match sub {
            "null" => Ok(Vec::new()),
            "zero" => Ok(vec![0u8; DEVICE_READ_CHUNK]),
            "random" | "urandom" => Self::fill_random(DEVICE_READ_CHUNK),
            "" => Err(VfsError::IsDirectory(String::from("/"))),
            other => Err(VfsError::NotFound(format!("no such device: {other}"))),
        }
    }

    fn read_at(&self, sub: &str, _offset: u64, len: usize) -> Result<Vec<u8>, VfsError> {
        // Stream devices ignore the offset entirely.
        match sub {
            "null" => Ok(Vec::new()),
            "zero" => Ok(vec![0u8; len]),
            "random" | "urandom" => Self::fill_random(len),
            "" => Err(VfsError::IsDirectory(String::from("/"))),
            other => Err(VfsError::NotFound(format!("no such device: {other}"))),
        }
    }

    fn write(&self, sub: &str, _data: &[u8]) -> Result<(), VfsError> {
        match sub {
            "null" => Ok(()),
            _ => Err(VfsError::ReadOnly(format!("/{sub}"))),
        }
    }

    fn exists(&self, sub: &str) -> bool {
        sub.is_empty() || DEVICE_NAMES.contains(&sub)
    }

    fn stat(&self, sub: &str) -> Result<FileStat, VfsError> {
        if sub.is_empty() {
            return Ok(dir_stat());
        }
        if DEVICE_NAMES.contains(&sub) {
            Ok(file_stat(0, 0o666))
        } else {
            Err(VfsError::NotFound(format!("no such device: {sub}")))
        }
    }

    fn readdir(&self, sub: &str) -> Result<Vec<DirEntry>, VfsError> {
        if !sub.is_empty() {
            return Err(VfsError::NotDirectory(format!("/{sub}")));
        }
        Ok(DEVICE_NAMES
            .iter()
            .map(|n| DirEntry {
                name: n.to_string(),
                kind: NodeKind::File,
            })
            .collect())
    }
}

// ─── Process-info provider ─────────────────────────────────────

/// Synthetic process/system information text files, typically mounted at
/// `/proc`. The set of names is closed; all writes fail read-only.
pub struct ProcInfoProvider {
    started: Instant,
    version: String,
}

const PROC_NAMES: &[&str] = &["uptime", "version", "cpuinfo", "meminfo"];

impl ProcInfoProvider {
    pub fn new(version: impl Into<String>) -> Self {
        ProcInfoProvider {
            started: Instant::now(),
            version: version.into(),
        }
    }

    fn render(&self, name: &str) -> Option<String> {
        match name {
            "uptime" => {
                let secs = self.started.elapsed().as_secs_f64();
                Some(format!("{secs:.2} 0.00\n"))
            }
            "version" => Some(format!("{}\n", self.version)),
            "cpuinfo" => Some(String::from(
                "processor\t: 0\nmodel name\t: wasmbox virtual cpu\ncpu MHz\t\t: 1000.000\n",
            )),
            "meminfo" => Some(String::from(
                "MemTotal:       262144 kB\nMemFree:        262144 kB\nMemAvailable:   262144 kB\n",
            )),
            _ => None,
        }
    }
}

impl VirtualProvider for ProcInfoProvider {
    fn read(&self, sub: &str) -> Result<Vec<u8>, VfsError> {
        if sub.is_empty() {
            return Err(VfsError::IsDirectory(String::from("/")));
        }
        self.render(sub)
            .map(String::into_bytes)
            .ok_or_else(|| VfsError::NotFound(format!("no such entry: {sub}")))
    }

    fn write(&self, sub: &str, _data: &[u8]) -> Result<(), VfsError> {
        Err(VfsError::ReadOnly(format!("/{sub}")))
    }

    fn exists(&self, sub: &str) -> bool {
        sub.is_empty() || PROC_NAMES.contains(&sub)
    }

    fn stat(&self, sub: &str) -> Result<FileStat, VfsError> {
        if sub.is_empty() {
            return Ok(dir_stat());
        }
        match self.render(sub) {
            Some(text) => Ok(file_stat(text.len() as u64, 0o444)),
            None => Err(VfsError::NotFound(format!("no such entry: {sub}"))),
        }
    }

    fn readdir(&self, sub: &str) -> Result<Vec<DirEntry>, VfsError> {
        if !sub.is_empty() {
            return Err(VfsError::NotDirectory(format!("/{sub}")));
        }
        Ok(PROC_NAMES
            .iter()
            .map(|n| DirEntry {
                name: n.to_string(),
                kind: NodeKind::File,
            })
            .collect())
    }
}

// ─── Host-backed provider ──────────────────────────────────────

/// Maps a host directory into the sandbox. Every resolved sub-path must
/// lie strictly under the declared root; `..` escapes are rejected before
/// any host I/O happens. Writes are additionally gated behind a flag.
pub struct HostDirProvider {
    root: PathBuf,
    writable: bool,
}

impl HostDirProvider {
    pub fn new(root: impl Into<PathBuf>, writable: bool) -> Self {
        HostDirProvider {
            root: root.into(),
            writable,
        }
    }

    /// Resolve `sub` under the root, rejecting any traversal escape.
    /// `..` is allowed only while it stays strictly inside the root.
    fn resolve(&self, sub: &str) -> Result<PathBuf, VfsError> {
        let escape = || VfsError::NotFound(format!("path escapes mount root: {sub}"));
        let mut parts: Vec<std::ffi::OsString> = Vec::new();
        for component in Path::new(sub).components() {
            match component {
                Component::Normal(part) => parts.push(part.to_os_string()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(escape());
                    }
                }
                // Absolute prefixes and drive roots always escape.
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }
        let mut resolved = self.root.clone();
        resolved.extend(parts);
        if !resolved.starts_with(&self.root) {
            return Err(escape());
        }
        Ok(resolved)
    }
}

impl VirtualProvider for HostDirProvider {
    fn read(&self, sub: &str) -> Result<Vec<u8>, VfsError> {
        let path = self.resolve(sub)?;
        if path.is_dir() {
            return Err(VfsError::IsDirectory(format!("/{sub}")));
        }
        std::fs::read(&path).map_err(|_| VfsError::NotFound(format!("no such file: {sub}")))
    }

    fn write(&self, sub: &str, data: &[u8]) -> Result<(), VfsError> {
        if !self.writable {
            return Err(VfsError::ReadOnly(format!("/{sub}")));
        }
        let path = self.resolve(sub)?;
        std::fs::write(&path, data).map_err(|_| VfsError::NotFound(format!("no such file: {sub}")))
    }

    fn exists(&self, sub: &str) -> bool {
        self.resolve(sub).map(|p| p.exists()).unwrap_or(false)
    }

    fn stat(&self, sub: &str) -> Result<FileStat, VfsError> {
        let path = self.resolve(sub)?;
        let meta = std::fs::metadata(&path)
            .map_err(|_| VfsError::NotFound(format!("no such file: {sub}")))?;
        let kind = if meta.is_dir() {
            NodeKind::Dir
        } else {
            NodeKind::File
        };
        Ok(FileStat {
            kind,
            size: meta.len(),
            permissions: if self.writable { 0o644 } else { 0o444 },
            mtime: 0,
            ctime: 0,
            atime: 0,
        })
    }

    fn readdir(&self, sub: &str) -> Result<Vec<DirEntry>, VfsError> {
        let path = self.resolve(sub)?;
        if !path.is_dir() {
            return Err(VfsError::NotDirectory(format!("/{sub}")));
        }
        let mut entries = Vec::new();
        let iter = std::fs::read_dir(&path)
            .map_err(|_| VfsError::NotFound(format!("no such directory: {sub}")))?;
        for entry in iter.flatten() {
            let kind = match entry.file_type() {
                Ok(t) if t.is_dir() => NodeKind::Dir,
                Ok(t) if t.is_symlink() => NodeKind::Symlink,
                _ => NodeKind::File,
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_null_discards_and_reads_empty() {
        let dev = DeviceProvider::new();
        dev.write("null", b"anything").unwrap();
        assert_eq!(dev.read("null").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_device_zero_reads_zero_filled() {
        let dev = DeviceProvider::new();
        assert_eq!(dev.read_at("zero", 0, 4).unwrap(), vec![0, 0, 0, 0]);
        assert!(dev.read("zero").unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_device_writes_outside_null_are_erofs() {
        let dev = DeviceProvider::new();
        assert_eq!(dev.write("zero", b"x").unwrap_err().code(), "EROFS");
        assert_eq!(dev.write("random", b"x").unwrap_err().code(), "EROFS");
    }

    #[test]
    fn test_device_random_sources() {
        let dev = DeviceProvider::new();
        let a = dev.read_at("random", 0, 32).unwrap();
        let b = dev.read_at("urandom", 0, 32).unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(b.len(), 32);
        // Astronomically unlikely to collide.
        assert_ne!(a, b);
    }

    #[test]
    fn test_device_unknown_name_is_enoent() {
        let dev = DeviceProvider::new();
        assert_eq!(dev.read("tty0").unwrap_err().code(), "ENOENT");
    }

    #[test]
    fn test_procinfo_closed_set() {
        let proc = ProcInfoProvider::new("wasmbox 0.1.0");
        let names: Vec<String> = proc
            .readdir("")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["uptime", "version", "cpuinfo", "meminfo"]);
        assert_eq!(proc.read("modules").unwrap_err().code(), "ENOENT");
    }

    #[test]
    fn test_procinfo_stat_size_matches_text() {
        let proc = ProcInfoProvider::new("wasmbox 0.1.0");
        let text = proc.read("version").unwrap();
        assert_eq!(proc.stat("version").unwrap().size, text.len() as u64);
        assert!(String::from_utf8(text).unwrap().contains("wasmbox"));
    }

    #[test]
    fn test_procinfo_is_read_only() {
        let proc = ProcInfoProvider::new("v");
        assert_eq!(proc.write("uptime", b"0").unwrap_err().code(), "EROFS");
    }

    #[test]
    fn test_hostdir_rejects_traversal() {
        let host = HostDirProvider::new(std::env::temp_dir(), false);
        assert!(host.resolve("../etc/passwd").is_err());
        assert!(host.resolve("a/../../b").is_err());
        assert!(host.resolve("/etc/passwd").is_err());
        assert!(host.resolve("ok/inside.txt").is_ok());
    }

    #[test]
    fn test_hostdir_read_only_flag() {
        let host = HostDirProvider::new(std::env::temp_dir(), false);
        assert_eq!(host.write("f.txt", b"x").unwrap_err().code(), "EROFS");
    }
}
