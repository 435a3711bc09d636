//! Fd-targets and per-process fd tables
//!
//! An fd-target is what a descriptor means to a guest: a capture
//! buffer, a static byte source, a pipe endpoint, the null sink, or an
//! open VFS file handle. The set is closed so every dispatch site can
//! match exhaustively. Targets are cheap to clone; cloning a pipe
//! endpoint shares it (the kernel copies targets, never deep-clones, so
//! a child sees data its parent wrote).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use storage::vfs::{SharedVfs, VfsError};

use crate::pipe::{PipeReader, PipeWriter};

/// Lowest fd handed out by the allocator; 0/1/2 are always present.
pub const FIRST_USER_FD: u32 = 3;

// ─── Capture buffer ────────────────────────────────────────────

struct CaptureBuffer {
    data: Vec<u8>,
    cap: Option<usize>,
    truncated: bool,
}

/// A byte sink that accumulates writes under an optional cap and is
/// addressable after the owning process exits (this is how command
/// stdout/stderr reach the driver).
#[derive(Clone)]
pub struct CaptureHandle {
    inner: Arc<Mutex<CaptureBuffer>>,
}

impl CaptureHandle {
    pub fn new(cap: Option<usize>) -> Self {
        CaptureHandle {
            inner: Arc::new(Mutex::new(CaptureBuffer {
                data: Vec::new(),
                cap,
                truncated: false,
            })),
        }
    }

    /// Append bytes, keeping at most `cap` and latching the truncated
    /// flag on overflow. The caller always observes a full write.
    pub fn append(&self, data: &[u8]) -> usize {
        let mut buf = self.inner.lock();
        match buf.cap {
            Some(cap) => {
                let room = cap.saturating_sub(buf.data.len());
                let n = data.len().min(room);
                buf.data.extend_from_slice(&data[..n]);
                if n < data.len() {
                    buf.truncated = true;
                }
            }
            None => buf.data.extend_from_slice(data),
        }
        data.len()
    }

    /// Current content and whether an overflow was observed.
    pub fn snapshot(&self) -> (Vec<u8>, bool) {
        let buf = self.inner.lock();
        (buf.data.clone(), buf.truncated)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().data.is_empty()
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("len", &self.len())
            .finish()
    }
}

// ─── Static source ─────────────────────────────────────────────

/// An immutable byte slice with a read cursor; reads past the end
/// return nothing (EOF). Used for pre-seeded stdin.
#[derive(Clone)]
pub struct StaticSource {
    data: Arc<Vec<u8>>,
    offset: Arc<Mutex<usize>>,
}

impl StaticSource {
    pub fn new(data: Vec<u8>) -> Self {
        StaticSource {
            data: Arc::new(data),
            offset: Arc::new(Mutex::new(0)),
        }
    }

    pub fn read(&self, max: usize) -> Vec<u8> {
        let mut off = self.offset.lock();
        let start = (*off).min(self.data.len());
        let end = (start + max).min(self.data.len());
        *off = end;
        self.data[start..end].to_vec()
    }

    pub fn seek_to(&self, offset: usize) {
        *self.offset.lock() = offset;
    }

    pub fn position(&self) -> usize {
        *self.offset.lock()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for StaticSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSource")
            .field("len", &self.data.len())
            .finish()
    }
}

// ─── VFS file handle ───────────────────────────────────────────

struct FileCursor {
    offset: u64,
}

/// An open descriptor into a VFS file: path plus cursor. Writes go
/// through the VFS replacement semantics (read, splice, write back), so
/// snapshot sharing stays intact.
#[derive(Clone)]
pub struct VfsFileHandle {
    vfs: SharedVfs,
    path: String,
    cursor: Arc<Mutex<FileCursor>>,
    append: bool,
}

impl VfsFileHandle {
    pub fn new(vfs: SharedVfs, path: impl Into<String>, append: bool) -> Self {
        VfsFileHandle {
            vfs,
            path: path.into(),
            cursor: Arc::new(Mutex::new(FileCursor { offset: 0 })),
            append,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn read(&self, max: usize) -> Result<Vec<u8>, VfsError> {
        let mut cursor = self.cursor.lock();
        let data = self.vfs.lock().read_file_at(&self.path, cursor.offset, max)?;
        cursor.offset += data.len() as u64;
        Ok(data)
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, VfsError> {
        let mut cursor = self.cursor.lock();
        let mut vfs = self.vfs.lock();
        let mut full = match vfs.read_file(&self.path) {
            Ok(existing) => existing,
            Err(VfsError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let offset = if self.append {
            full.len()
        } else {
            cursor.offset as usize
        };
        if offset > full.len() {
            full.resize(offset, 0);
        }
        let end = offset + data.len();
        if end > full.len() {
            full.resize(end, 0);
        }
        full[offset..end].copy_from_slice(data);
        vfs.write_file(&self.path, &full)?;
        cursor.offset = end as u64;
        Ok(data.len())
    }

    pub fn size(&self) -> Result<u64, VfsError> {
        Ok(self.vfs.lock().stat(&self.path)?.size)
    }

    pub fn seek_to(&self, offset: u64) {
        self.cursor.lock().offset = offset;
    }

    pub fn position(&self) -> u64 {
        self.cursor.lock().offset
    }
}

impl std::fmt::Debug for VfsFileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsFileHandle")
            .field("path", &self.path)
            .finish()
    }
}

// ─── Fd-target ─────────────────────────────────────────────────

/// What a descriptor means to a guest.
#[derive(Debug, Clone)]
pub enum FdTarget {
    /// Accumulating byte sink with an optional cap.
    Buffer(CaptureHandle),
    /// Immutable byte source with a cursor.
    Static(StaticSource),
    /// Read end of an async pipe.
    PipeRead(PipeReader),
    /// Write end of an async pipe.
    PipeWrite(PipeWriter),
    /// Writes discard, reads return EOF.
    Null,
    /// Open VFS file with a cursor.
    VfsFile(VfsFileHandle),
}

impl FdTarget {
    pub fn is_pipe(&self) -> bool {
        matches!(self, FdTarget::PipeRead(_) | FdTarget::PipeWrite(_))
    }
}

// ─── Fd table ──────────────────────────────────────────────────

/// Per-process descriptor table. Fds 0/1/2 always exist (null unless
/// rewired); allocation picks the smallest free fd >= 3. Removing an
/// entry drops the target, which is what closes pipe endpoints.
#[derive(Debug)]
pub struct FdTable {
    entries: BTreeMap<u32, FdTarget>,
}

impl FdTable {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(0, FdTarget::Null);
        entries.insert(1, FdTarget::Null);
        entries.insert(2, FdTarget::Null);
        FdTable { entries }
    }

    /// Insert at the smallest free fd >= 3.
    pub fn insert(&mut self, target: FdTarget) -> u32 {
        let fd = self.first_free(FIRST_USER_FD);
        self.entries.insert(fd, target);
        fd
    }

    /// Insert two targets at a contiguous pair of free fds, returning
    /// `(first, first + 1)`.
    pub fn insert_pair(&mut self, a: FdTarget, b: FdTarget) -> (u32, u32) {
        let mut fd = FIRST_USER_FD;
        loop {
            if !self.entries.contains_key(&fd) && !self.entries.contains_key(&(fd + 1)) {
                break;
            }
            fd += 1;
        }
        self.entries.insert(fd, a);
        self.entries.insert(fd + 1, b);
        (fd, fd + 1)
    }

    fn first_free(&self, from: u32) -> u32 {
        let mut fd = from;
        while self.entries.contains_key(&fd) {
            fd += 1;
        }
        fd
    }

    /// Replace (or create) an entry; the previous target is dropped.
    pub fn set(&mut self, fd: u32, target: FdTarget) {
        self.entries.insert(fd, target);
    }

    pub fn get(&self, fd: u32) -> Option<&FdTarget> {
        self.entries.get(&fd)
    }

    /// Remove an entry, dropping (and thereby closing) its target.
    /// Fds 0/1/2 are reset to null rather than removed.
    pub fn remove(&mut self, fd: u32) -> bool {
        if fd < FIRST_USER_FD {
            return self.entries.insert(fd, FdTarget::Null).is_some();
        }
        self.entries.remove(&fd).is_some()
    }

    /// Replace every pipe endpoint with null, closing it. Used by
    /// cancellation to propagate EOF/EPIPE into children.
    pub fn close_pipes(&mut self) {
        let pipe_fds: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, t)| t.is_pipe())
            .map(|(fd, _)| *fd)
            .collect();
        for fd in pipe_fds {
            self.entries.insert(fd, FdTarget::Null);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_fds_always_present() {
        let table = FdTable::new();
        assert!(table.get(0).is_some());
        assert!(table.get(1).is_some());
        assert!(table.get(2).is_some());
    }

    #[test]
    fn test_allocation_reuses_lowest_free() {
        let mut table = FdTable::new();
        assert_eq!(table.insert(FdTarget::Null), 3);
        assert_eq!(table.insert(FdTarget::Null), 4);
        table.remove(3);
        assert_eq!(table.insert(FdTarget::Null), 3);
    }

    #[test]
    fn test_insert_pair_is_contiguous() {
        let mut table = FdTable::new();
        table.set(4, FdTarget::Null); // hole at 3, blocked 4
        let (r, w) = table.insert_pair(FdTarget::Null, FdTarget::Null);
        assert_eq!((r, w), (5, 6));
    }

    #[test]
    fn test_removing_std_fd_resets_to_null() {
        let mut table = FdTable::new();
        table.set(1, FdTarget::Buffer(CaptureHandle::new(None)));
        assert!(table.remove(1));
        assert!(matches!(table.get(1), Some(FdTarget::Null)));
    }

    #[test]
    fn test_capture_cap_and_truncated_flag() {
        let buf = CaptureHandle::new(Some(5));
        assert_eq!(buf.append(b"abc"), 3);
        assert_eq!(buf.append(b"defg"), 4);
        let (data, truncated) = buf.snapshot();
        assert_eq!(data, b"abcde");
        assert!(truncated);
    }

    #[test]
    fn test_static_source_eof_past_end() {
        let src = StaticSource::new(b"abc".to_vec());
        assert_eq!(src.read(2), b"ab");
        assert_eq!(src.read(10), b"c");
        assert_eq!(src.read(10), b"");
    }
}
