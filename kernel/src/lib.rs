//! Wasmbox process kernel
//!
//! The in-process manager of everything POSIX-shaped that guests see:
//! the process table, per-process file-descriptor tables, fd-targets
//! (the tagged union describing what a descriptor means), bounded
//! asynchronous pipes with back-pressure and EPIPE/EOF propagation,
//! cancellation tokens, and the capability bits gating the host-ABI.
//!
//! Not an OS kernel: scheduling is cooperative on one event loop and
//! "blocking" is suspension of a guest task, never of a thread.

pub mod cancel;
pub mod caps;
pub mod fd;
pub mod io;
pub mod pipe;
pub mod proc;

pub use cancel::{CancelReason, CancelStatus, CancelToken};
pub use caps::Caps;
pub use fd::{CaptureHandle, FdTable, FdTarget, StaticSource, VfsFileHandle};
pub use io::IoError;
pub use pipe::{pipe, PipeError, PipeReader, PipeWriter, DEFAULT_PIPE_CAPACITY};
pub use proc::{Kernel, KernelError, Pid, ProcState};

/// Exit code reported for a cancelled command.
pub const EXIT_CANCELLED: i32 = 130;
/// Exit code reported when the per-command deadline fires.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code for a tool that exists but is not permitted.
pub const EXIT_NOT_PERMITTED: i32 = 126;
/// Exit code for an unknown tool.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code reported when a guest traps unexpectedly.
pub const EXIT_CRASHED: i32 = 139;
