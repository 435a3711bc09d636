//! Capability bits
//!
//! Every guest receives a subset of the host-ABI according to what it
//! is: the shell drives processes and the filesystem, the Python
//! interpreter reaches the network bridge and host extensions, and
//! coreutils get nothing beyond pure WASI. A call gated by a bit the
//! caller does not hold fails with `ENOTCAPABLE`; spawn additionally
//! maps denials to exit code 126 without instantiating anything.

use bitflags::bitflags;

bitflags! {
    /// Host-ABI capability bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        /// VFS calls: stat, read_file, write_file, readdir, glob.
        const FS = 1 << 0;
        /// Process calls: pipe, spawn, waitpid, close_fd, has_tool.
        const PROC = 1 << 1;
        /// time_ms and check_cancel.
        const TIME = 1 << 2;
        /// network_fetch.
        const NET = 1 << 3;
        /// extension_invoke.
        const EXT = 1 << 4;
        /// read_command / write_result (the shell rendezvous).
        const SHELL = 1 << 5;
    }
}

impl Caps {
    /// The shell guest: filesystem + process + time + command loop.
    pub fn shell() -> Caps {
        Caps::FS | Caps::PROC | Caps::TIME | Caps::SHELL
    }

    /// The Python interpreter: filesystem + time + network + extensions.
    pub fn python() -> Caps {
        Caps::FS | Caps::TIME | Caps::NET | Caps::EXT
    }

    /// Coreutils: nothing beyond pure WASI-P1.
    pub fn coreutil() -> Caps {
        Caps::empty()
    }
}
