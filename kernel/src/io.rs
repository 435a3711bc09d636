//! Fd dispatch
//!
//! The single read/write path over fd-targets, shared by the WASI hosts
//! and by native tools. Pipe operations may suspend the caller; every
//! other target completes synchronously. The kernel lock is only held
//! while the target is looked up, never across a suspension point.

use crate::fd::FdTarget;
use crate::proc::{Kernel, Pid};
use storage::vfs::VfsError;

/// Errors surfaced by fd dispatch; hosts map these onto WASI errnos.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    #[error("EBADF: bad file descriptor: {0}")]
    BadFd(u32),
    #[error("EPIPE: broken pipe")]
    Broken,
    #[error(transparent)]
    Vfs(#[from] VfsError),
}

/// Read up to `max` bytes from `(pid, fd)`. An empty result is EOF.
/// Suspends when the target is an empty, open pipe.
pub async fn read_fd(kernel: &Kernel, pid: Pid, fd: u32, max: usize) -> Result<Vec<u8>, IoError> {
    let target = kernel
        .get_fd_target(pid, fd)
        .ok_or(IoError::BadFd(fd))?;
    match target {
        FdTarget::Null => Ok(Vec::new()),
        FdTarget::Static(src) => Ok(src.read(max)),
        FdTarget::PipeRead(reader) => Ok(reader.read(max).await),
        FdTarget::VfsFile(handle) => handle.read(max).map_err(IoError::from),
        FdTarget::Buffer(_) | FdTarget::PipeWrite(_) => Err(IoError::BadFd(fd)),
    }
}

/// Write `data` to `(pid, fd)`. Suspends when the target is a full,
/// open pipe; reports the broken-pipe error once the read side is gone.
pub async fn write_fd(kernel: &Kernel, pid: Pid, fd: u32, data: &[u8]) -> Result<usize, IoError> {
    let target = kernel
        .get_fd_target(pid, fd)
        .ok_or(IoError::BadFd(fd))?;
    match target {
        FdTarget::Null => Ok(data.len()),
        FdTarget::Buffer(buffer) => Ok(buffer.append(data)),
        FdTarget::PipeWrite(writer) => writer
            .write_all(data)
            .await
            .map_err(|_| IoError::Broken),
        FdTarget::VfsFile(handle) => handle.write(data).map_err(IoError::from),
        FdTarget::Static(_) | FdTarget::PipeRead(_) => Err(IoError::BadFd(fd)),
    }
}
