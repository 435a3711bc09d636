//! WASI Preview 1 host
//!
//! Per-guest WASI context: errno mapping, the sandbox clock, directory
//! descriptors (preopens), and the path/fd operations that back the
//! `wasi_snapshot_preview1` imports. Byte shuffling in and out of guest
//! memory lives in `engine`; everything here works on plain Rust types
//! so it is testable without an instantiated module.
//!
//! Reads and writes on pipes suspend the guest; they are dispatched
//! through `kernel::io` from the engine glue. Everything below runs
//! synchronously.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use kernel::{CancelToken, FdTarget, Kernel, Pid, VfsFileHandle};
use storage::inode::NodeKind;
use storage::vfs::{self, SharedVfs, VfsError};

/// Monotonic + wall clock shared by every guest of one sandbox.
/// Monotonic time starts at zero when the sandbox is created.
#[derive(Clone)]
pub struct Clock {
    start: Instant,
    wall_base_nanos: u64,
}

impl Clock {
    pub fn new() -> Self {
        let wall_base_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Clock {
            start: Instant::now(),
            wall_base_nanos,
        }
    }

    /// Nanoseconds since sandbox creation.
    pub fn monotonic_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    /// Milliseconds since sandbox creation (the `time_ms` host call).
    pub fn monotonic_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Wall-clock nanoseconds since the epoch.
    pub fn wall_nanos(&self) -> u64 {
        self.wall_base_nanos + self.monotonic_nanos()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Errno ─────────────────────────────────────────────────────

/// WASI Preview 1 errno values the host actually raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Errno {
    /// Success.
    Success = 0,
    /// Permission denied.
    Acces = 2,
    /// Resource unavailable.
    Again = 6,
    /// Bad file descriptor.
    BadF = 8,
    /// No child processes.
    Child = 12,
    /// File exists.
    Exist = 20,
    /// Bad address.
    Fault = 21,
    /// Invalid argument.
    Inval = 28,
    /// I/O error.
    Io = 29,
    /// Is a directory.
    IsDir = 31,
    /// Too many levels of symbolic links.
    Loop = 32,
    /// No such file or directory.
    NoEnt = 44,
    /// No space left on device.
    NoSpc = 51,
    /// Function not supported.
    NoSys = 52,
    /// Not a directory.
    NotDir = 54,
    /// Directory not empty.
    NotEmpty = 55,
    /// Not supported.
    NotSup = 58,
    /// Operation not permitted.
    Perm = 63,
    /// Broken pipe.
    Pipe = 64,
    /// Read-only file system.
    RoFs = 69,
    /// Invalid seek.
    SPipe = 70,
    /// No such process.
    Srch = 71,
    /// Capabilities insufficient.
    NotCapable = 76,
}

impl Errno {
    pub fn raw(self) -> i32 {
        self as i32
    }

    /// Negative form used by the `wasmbox` host-ABI return convention.
    pub fn negative(self) -> i64 {
        -(self as i64)
    }
}

impl From<VfsError> for Errno {
    fn from(err: VfsError) -> Errno {
        match err {
            VfsError::NotFound(_) => Errno::NoEnt,
            VfsError::NotDirectory(_) => Errno::NotDir,
            VfsError::IsDirectory(_) => Errno::IsDir,
            VfsError::AlreadyExists(_) => Errno::Exist,
            VfsError::NotEmpty(_) => Errno::NotEmpty,
            VfsError::ReadOnly(_) => Errno::RoFs,
            VfsError::NoSpace => Errno::NoSpc,
        }
    }
}

impl From<kernel::IoError> for Errno {
    fn from(err: kernel::IoError) -> Errno {
        match err {
            kernel::IoError::BadFd(_) => Errno::BadF,
            kernel::IoError::Broken => Errno::Pipe,
            kernel::IoError::Vfs(e) => e.into(),
        }
    }
}

impl From<kernel::KernelError> for Errno {
    fn from(err: kernel::KernelError) -> Errno {
        match err {
            kernel::KernelError::NoSuchProcess(_) => Errno::Srch,
            kernel::KernelError::BadFd(_) => Errno::BadF,
            kernel::KernelError::Cancelled => Errno::Again,
        }
    }
}

// ─── Unwind markers ────────────────────────────────────────────

/// Raised (as a trap payload) when a guest calls `proc_exit`; the
/// engine catches it at the run boundary and records the code.
#[derive(Debug, Clone, Copy)]
pub struct ProcExit(pub i32);

impl std::fmt::Display for ProcExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "guest exited with code {}", self.0)
    }
}

impl std::error::Error for ProcExit {}

/// Raised when the deadline or an explicit cancel fires inside a host
/// call; unwinds the guest and resolves the process with the code.
#[derive(Debug, Clone, Copy)]
pub struct CancelUnwind {
    pub code: i32,
}

impl std::fmt::Display for CancelUnwind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "guest cancelled with code {}", self.code)
    }
}

impl std::error::Error for CancelUnwind {}

// ─── WASI constants ────────────────────────────────────────────

/// WASI filetype codes.
pub mod filetype {
    pub const UNKNOWN: u8 = 0;
    pub const CHAR_DEVICE: u8 = 2;
    pub const DIRECTORY: u8 = 3;
    pub const REGULAR_FILE: u8 = 4;
    pub const SYMLINK: u8 = 7;
}

/// `path_open` oflags bits.
pub mod oflags {
    pub const CREAT: u32 = 1;
    pub const DIRECTORY: u32 = 2;
    pub const EXCL: u32 = 4;
    pub const TRUNC: u32 = 8;
}

/// fdflags bits.
pub mod fdflags {
    pub const APPEND: u32 = 1;
}

pub fn filetype_of(kind: NodeKind) -> u8 {
    match kind {
        NodeKind::File => filetype::REGULAR_FILE,
        NodeKind::Dir => filetype::DIRECTORY,
        NodeKind::Symlink => filetype::SYMLINK,
    }
}

/// One wire-ready readdir entry.
#[derive(Debug, Clone)]
pub struct DirEntryWire {
    pub next: u64,
    pub ino: u64,
    pub filetype: u8,
    pub name: String,
}

/// A path filestat reduced to what the wire layout needs.
#[derive(Debug, Clone, Copy)]
pub struct FilestatWire {
    pub filetype: u8,
    pub size: u64,
    pub atim: u64,
    pub mtim: u64,
    pub ctim: u64,
}

// ─── WASI host ─────────────────────────────────────────────────

/// Per-guest WASI context. Owns the guest's view of the world: its pid
/// and fd table access, its argv/env snapshot, its directory
/// descriptors, its exit code and its deadline token.
pub struct WasiHost {
    pub pid: Pid,
    pub kernel: Arc<Kernel>,
    pub vfs: SharedVfs,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: String,
    pub cancel: CancelToken,
    pub clock: Clock,
    dirs: BTreeMap<u32, String>,
    preopen_fd: Option<u32>,
    exit_code: Option<i32>,
}

impl WasiHost {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pid: Pid,
        kernel: Arc<Kernel>,
        vfs: SharedVfs,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cwd: String,
        cancel: CancelToken,
        clock: Clock,
    ) -> Self {
        WasiHost {
            pid,
            kernel,
            vfs,
            args,
            env,
            cwd,
            cancel,
            clock,
            dirs: BTreeMap::new(),
            preopen_fd: None,
            exit_code: None,
        }
    }

    /// Install the `/` preopen. Call once after the fd table exists.
    pub fn preopen_root(&mut self) -> Result<u32, Errno> {
        let fd = {
            // Reserve the fd number in the kernel table so file fds never
            // collide with directory fds.
            let mut placeholder = None;
            for candidate in 3..64 {
                if self.kernel.get_fd_target(self.pid, candidate).is_none() {
                    placeholder = Some(candidate);
                    break;
                }
            }
            let fd = placeholder.ok_or(Errno::NoSpc)?;
            self.kernel
                .set_fd_target(self.pid, fd, FdTarget::Null)
                .map_err(Errno::from)?;
            fd
        };
        self.dirs.insert(fd, String::from("/"));
        self.preopen_fd = Some(fd);
        Ok(fd)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Record the exit code; the engine unwinds the guest.
    pub fn proc_exit(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    // ─── argv / environ ────────────────────────────────────────

    /// argv entries as NUL-terminated byte strings.
    pub fn args_bytes(&self) -> Vec<Vec<u8>> {
        self.args
            .iter()
            .map(|a| {
                let mut v = a.clone().into_bytes();
                v.push(0);
                v
            })
            .collect()
    }

    /// `KEY=value` environ entries as NUL-terminated byte strings.
    pub fn environ_bytes(&self) -> Vec<Vec<u8>> {
        self.env
            .iter()
            .map(|(k, v)| {
                let mut s = format!("{k}={v}").into_bytes();
                s.push(0);
                s
            })
            .collect()
    }

    // ─── Paths ─────────────────────────────────────────────────

    /// Resolve a guest-supplied path against a directory descriptor.
    pub fn resolve_path(&self, dirfd: u32, path: &str) -> Result<String, Errno> {
        if path.starts_with('/') {
            return Ok(vfs::normalize_path(path));
        }
        let base = self.dirs.get(&dirfd).ok_or(Errno::BadF)?;
        Ok(vfs::normalize_path(&format!("{base}/{path}")))
    }

    /// `path_open`: route to the VFS and hand back a kernel fd.
    pub fn path_open(
        &mut self,
        dirfd: u32,
        path: &str,
        oflags: u32,
        fdflags: u32,
    ) -> Result<u32, Errno> {
        let full = self.resolve_path(dirfd, path)?;
        let want_dir = oflags & oflags::DIRECTORY != 0;

        let existing = {
            let vfs = self.vfs.lock();
            match vfs.stat(&full) {
                Ok(stat) => Some(stat.kind),
                Err(VfsError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            }
        };

        if let Some(NodeKind::Dir) = existing {
            // Directory descriptors live in the kernel table as null
            // placeholders plus an entry in `dirs`.
            let mut vacant = 3;
            while self.kernel.get_fd_target(self.pid, vacant).is_some() {
                vacant += 1;
            }
            self.kernel
                .set_fd_target(self.pid, vacant, FdTarget::Null)
                .map_err(Errno::from)?;
            self.dirs.insert(vacant, full);
            return Ok(vacant);
        }
        if want_dir {
            return Err(Errno::NotDir);
        }

        let exists = existing.is_some();
        if oflags & oflags::EXCL != 0 && exists {
            return Err(Errno::Exist);
        }
        if !exists {
            if oflags & oflags::CREAT == 0 {
                return Err(Errno::NoEnt);
            }
            self.vfs.lock().write_file(&full, b"")?;
        } else if oflags & oflags::TRUNC != 0 {
            self.vfs.lock().write_file(&full, b"")?;
        }

        let append = fdflags & fdflags::APPEND != 0;
        let handle = VfsFileHandle::new(Arc::clone(&self.vfs), full, append);
        let mut vacant = 3;
        while self.kernel.get_fd_target(self.pid, vacant).is_some() {
            vacant += 1;
        }
        self.kernel
            .set_fd_target(self.pid, vacant, FdTarget::VfsFile(handle))
            .map_err(Errno::from)?;
        Ok(vacant)
    }

    pub fn path_create_directory(&self, dirfd: u32, path: &str) -> Result<(), Errno> {
        let full = self.resolve_path(dirfd, path)?;
        self.vfs.lock().mkdir(&full).map_err(Errno::from)
    }

    pub fn path_remove_directory(&self, dirfd: u32, path: &str) -> Result<(), Errno> {
        let full = self.resolve_path(dirfd, path)?;
        self.vfs.lock().rmdir(&full).map_err(Errno::from)
    }

    pub fn path_unlink_file(&self, dirfd: u32, path: &str) -> Result<(), Errno> {
        let full = self.resolve_path(dirfd, path)?;
        self.vfs.lock().rm(&full).map_err(Errno::from)
    }

    pub fn path_filestat(&self, dirfd: u32, path: &str) -> Result<FilestatWire, Errno> {
        let full = self.resolve_path(dirfd, path)?;
        let stat = self.vfs.lock().stat(&full)?;
        Ok(FilestatWire {
            filetype: filetype_of(stat.kind),
            size: stat.size,
            atim: stat.atime.saturating_mul(1_000_000_000),
            mtim: stat.mtime.saturating_mul(1_000_000_000),
            ctim: stat.ctime.saturating_mul(1_000_000_000),
        })
    }

    pub fn path_readlink(&self, dirfd: u32, path: &str) -> Result<String, Errno> {
        let full = self.resolve_path(dirfd, path)?;
        self.vfs.lock().read_link(&full).map_err(Errno::from)
    }

    pub fn path_rename(
        &self,
        old_dirfd: u32,
        old_path: &str,
        new_dirfd: u32,
        new_path: &str,
    ) -> Result<(), Errno> {
        let old = self.resolve_path(old_dirfd, old_path)?;
        let new = self.resolve_path(new_dirfd, new_path)?;
        self.vfs.lock().rename(&old, &new).map_err(Errno::from)
    }

    pub fn path_symlink(&self, target: &str, dirfd: u32, linkpath: &str) -> Result<(), Errno> {
        let link = self.resolve_path(dirfd, linkpath)?;
        self.vfs.lock().symlink(target, &link).map_err(Errno::from)
    }

    // ─── Descriptors ───────────────────────────────────────────

    pub fn is_dir_fd(&self, fd: u32) -> bool {
        self.dirs.contains_key(&fd)
    }

    /// The guest-visible path of the preopened root, if `fd` is it.
    pub fn prestat_dir(&self, fd: u32) -> Option<&str> {
        if self.preopen_fd == Some(fd) {
            self.dirs.get(&fd).map(String::as_str)
        } else {
            None
        }
    }

    pub fn fd_close(&mut self, fd: u32) -> Result<(), Errno> {
        if fd < 3 {
            return Err(Errno::Acces);
        }
        self.dirs.remove(&fd);
        if self.preopen_fd == Some(fd) {
            self.preopen_fd = None;
        }
        self.kernel.close_fd(self.pid, fd).map_err(Errno::from)
    }

    /// Filetype reported by `fd_fdstat_get` / `fd_filestat_get`.
    pub fn fd_filetype(&self, fd: u32) -> Result<u8, Errno> {
        if self.dirs.contains_key(&fd) {
            return Ok(filetype::DIRECTORY);
        }
        match self.kernel.get_fd_target(self.pid, fd) {
            Some(FdTarget::VfsFile(_)) => Ok(filetype::REGULAR_FILE),
            Some(FdTarget::Static(_)) | Some(FdTarget::Buffer(_)) | Some(FdTarget::Null) => {
                Ok(filetype::CHAR_DEVICE)
            }
            Some(FdTarget::PipeRead(_)) | Some(FdTarget::PipeWrite(_)) => {
                Ok(filetype::CHAR_DEVICE)
            }
            None => Err(Errno::BadF),
        }
    }

    pub fn fd_filestat(&self, fd: u32) -> Result<FilestatWire, Errno> {
        if let Some(path) = self.dirs.get(&fd) {
            let stat = self.vfs.lock().stat(path)?;
            return Ok(FilestatWire {
                filetype: filetype::DIRECTORY,
                size: stat.size,
                atim: 0,
                mtim: 0,
                ctim: 0,
            });
        }
        match self.kernel.get_fd_target(self.pid, fd) {
            Some(FdTarget::VfsFile(handle)) => {
                let size = handle.size().map_err(Errno::from)?;
                Ok(FilestatWire {
                    filetype: filetype::REGULAR_FILE,
                    size,
                    atim: 0,
                    mtim: 0,
                    ctim: 0,
                })
            }
            Some(_) => Ok(FilestatWire {
                filetype: filetype::CHAR_DEVICE,
                size: 0,
                atim: 0,
                mtim: 0,
                ctim: 0,
            }),
            None => Err(Errno::BadF),
        }
    }

    /// `fd_seek` for seekable targets; pipes and buffers are ESPIPE.
    pub fn fd_seek(&self, fd: u32, offset: i64, whence: u8) -> Result<u64, Errno> {
        match self.kernel.get_fd_target(self.pid, fd) {
            Some(FdTarget::VfsFile(handle)) => {
                let size = handle.size().map_err(Errno::from)?;
                let base = match whence {
                    0 => 0i64,
                    1 => handle.position() as i64,
                    2 => size as i64,
                    _ => return Err(Errno::Inval),
                };
                let next = base.checked_add(offset).ok_or(Errno::Inval)?;
                if next < 0 {
                    return Err(Errno::Inval);
                }
                handle.seek_to(next as u64);
                Ok(next as u64)
            }
            Some(FdTarget::Static(src)) => {
                let base = match whence {
                    0 => 0i64,
                    1 => src.position() as i64,
                    2 => src.len() as i64,
                    _ => return Err(Errno::Inval),
                };
                let next = base.checked_add(offset).ok_or(Errno::Inval)?;
                if next < 0 {
                    return Err(Errno::Inval);
                }
                src.seek_to(next as usize);
                Ok(next as u64)
            }
            Some(_) => Err(Errno::SPipe),
            None => Err(Errno::BadF),
        }
    }

    pub fn fd_tell(&self, fd: u32) -> Result<u64, Errno> {
        match self.kernel.get_fd_target(self.pid, fd) {
            Some(FdTarget::VfsFile(handle)) => Ok(handle.position()),
            Some(FdTarget::Static(src)) => Ok(src.position() as u64),
            Some(_) => Err(Errno::SPipe),
            None => Err(Errno::BadF),
        }
    }

    /// Directory entries from `cookie` onward, wire-ready.
    pub fn fd_readdir(&self, fd: u32, cookie: u64) -> Result<Vec<DirEntryWire>, Errno> {
        let path = self.dirs.get(&fd).ok_or(Errno::NotDir)?;
        let entries = self.vfs.lock().read_dir(path)?;
        Ok(entries
            .into_iter()
            .enumerate()
            .skip(cookie as usize)
            .map(|(i, entry)| DirEntryWire {
                next: i as u64 + 1,
                ino: i as u64 + 1,
                filetype: filetype_of(entry.kind),
                name: entry.name,
            })
            .collect())
    }

    // ─── Clocks / random ───────────────────────────────────────

    /// `clock_time_get` in nanoseconds. Realtime is wall clock, all
    /// monotonic-ish ids count from sandbox creation.
    pub fn clock_time_get(&self, clock_id: u32) -> Result<u64, Errno> {
        match clock_id {
            0 => Ok(self.clock.wall_nanos()),
            1..=3 => Ok(self.clock.monotonic_nanos()),
            _ => Err(Errno::Inval),
        }
    }

    /// `random_get`: cryptographically strong bytes.
    pub fn random_get(&self, buf: &mut [u8]) -> Result<(), Errno> {
        getrandom::getrandom(buf).map_err(|_| Errno::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::vfs::Vfs;

    fn host() -> WasiHost {
        let kernel = Arc::new(Kernel::new());
        let mut vfs = Vfs::new();
        vfs.with_bypass(|v| {
            v.mkdirp("/home/user").unwrap();
            v.mkdirp("/tmp").unwrap();
            v.write_file("/home/user/hello.txt", b"hi").unwrap();
        });
        let vfs: SharedVfs = Arc::new(parking_lot::Mutex::new(vfs));
        let pid = kernel.alloc_pid();
        kernel.init_process(pid);
        let mut host = WasiHost::new(
            pid,
            kernel,
            vfs,
            vec![String::from("tool")],
            vec![(String::from("HOME"), String::from("/home/user"))],
            String::from("/home/user"),
            CancelToken::new(),
            Clock::new(),
        );
        host.preopen_root().unwrap();
        host
    }

    #[test]
    fn test_preopen_is_fd3() {
        let host = host();
        assert_eq!(host.prestat_dir(3), Some("/"));
        assert!(host.is_dir_fd(3));
    }

    #[test]
    fn test_path_open_read_existing() {
        let mut host = host();
        let fd = host.path_open(3, "home/user/hello.txt", 0, 0).unwrap();
        assert!(fd > 3);
        assert_eq!(host.fd_filetype(fd).unwrap(), filetype::REGULAR_FILE);
        assert_eq!(host.fd_filestat(fd).unwrap().size, 2);
    }

    #[test]
    fn test_path_open_missing_without_creat_is_noent() {
        let mut host = host();
        assert_eq!(host.path_open(3, "home/user/nope", 0, 0), Err(Errno::NoEnt));
    }

    #[test]
    fn test_path_open_creat_excl_trunc() {
        let mut host = host();
        let fd = host
            .path_open(3, "/tmp/new.txt", oflags::CREAT, 0)
            .unwrap();
        host.fd_close(fd).unwrap();
        assert_eq!(
            host.path_open(3, "/tmp/new.txt", oflags::CREAT | oflags::EXCL, 0),
            Err(Errno::Exist)
        );
        host.vfs.lock().write_file("/tmp/new.txt", b"content").unwrap();
        let fd = host.path_open(3, "/tmp/new.txt", oflags::TRUNC, 0).unwrap();
        assert_eq!(host.fd_filestat(fd).unwrap().size, 0);
    }

    #[test]
    fn test_path_open_write_outside_writable_is_rofs() {
        let mut host = host();
        assert_eq!(
            host.path_open(3, "/etc/new", oflags::CREAT, 0),
            Err(Errno::RoFs)
        );
    }

    #[test]
    fn test_directory_fd_and_readdir() {
        let mut host = host();
        let fd = host.path_open(3, "home/user", oflags::DIRECTORY, 0).unwrap();
        assert!(host.is_dir_fd(fd));
        let entries = host.fd_readdir(fd, 0).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["hello.txt"]);
        // Cookie resumes past already-delivered entries.
        assert!(host.fd_readdir(fd, 1).unwrap().is_empty());
    }

    #[test]
    fn test_seek_and_tell_on_vfs_file() {
        let mut host = host();
        let fd = host.path_open(3, "home/user/hello.txt", 0, 0).unwrap();
        assert_eq!(host.fd_seek(fd, 1, 0).unwrap(), 1);
        assert_eq!(host.fd_tell(fd).unwrap(), 1);
        assert_eq!(host.fd_seek(fd, 0, 2).unwrap(), 2);
        assert_eq!(host.fd_seek(fd, -3, 1), Err(Errno::Inval));
    }

    #[test]
    fn test_seek_on_pipe_is_espipe() {
        let host = host();
        let (r, _w) = host.kernel.create_pipe(host.pid).unwrap();
        assert_eq!(host.fd_seek(r, 0, 0), Err(Errno::SPipe));
    }

    #[test]
    fn test_relative_path_resolution() {
        let host = host();
        assert_eq!(
            host.resolve_path(3, "home/user/hello.txt").unwrap(),
            "/home/user/hello.txt"
        );
        assert_eq!(host.resolve_path(3, "/abs/./p/../q").unwrap(), "/abs/q");
        assert_eq!(host.resolve_path(99, "x"), Err(Errno::BadF));
    }

    #[test]
    fn test_clock_monotonicity() {
        let host = host();
        let a = host.clock_time_get(1).unwrap();
        let b = host.clock_time_get(1).unwrap();
        assert!(b >= a);
        assert!(host.clock_time_get(0).unwrap() > 1_600_000_000_000_000_000);
        assert_eq!(host.clock_time_get(9), Err(Errno::Inval));
    }

    #[test]
    fn test_random_get_fills() {
        let host = host();
        let mut buf = [0u8; 32];
        host.random_get(&mut buf).unwrap();
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_environ_bytes_nul_terminated() {
        let host = host();
        let env = host.environ_bytes();
        assert_eq!(env[0], b"HOME=/home/user\0");
    }

    #[test]
    fn test_proc_exit_latches() {
        let mut host = host();
        assert_eq!(host.exit_code(), None);
        host.proc_exit(3);
        assert_eq!(host.exit_code(), Some(3));
    }

    #[test]
    fn test_fd_close_guards_stdio() {
        let mut host = host();
        assert_eq!(host.fd_close(1), Err(Errno::Acces));
    }
}
