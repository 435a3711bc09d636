//! Process table and kernel facade
//!
//! The kernel owns every process entry and every fd table; nothing else
//! mutates them. Processes are registered with a running state, latch
//! their exit code when the owning task settles, and remain in the
//! table as zombies until a `waitpid` consumes them (a waiter parked
//! before exit consumes the entry on delivery).

use std::collections::BTreeMap;

use futures_channel::oneshot;
use parking_lot::Mutex;

use crate::fd::{FdTable, FdTarget};

/// Process identifier, monotonically increasing and never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u64);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Running,
    Exited(i32),
}

/// Kernel error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("ESRCH: no such process: {0}")]
    NoSuchProcess(u64),
    #[error("EBADF: bad file descriptor: {0}")]
    BadFd(u32),
    #[error("CANCELLED: operation cancelled")]
    Cancelled,
}

struct ProcessEntry {
    state: ProcState,
    waiters: Vec<oneshot::Sender<i32>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

struct KernelInner {
    next_pid: u64,
    procs: BTreeMap<Pid, ProcessEntry>,
    tables: BTreeMap<Pid, FdTable>,
}

/// The process kernel. Cheap to share behind an `Arc`; all state lives
/// under one lock, which is never held across a suspension point.
pub struct Kernel {
    inner: Mutex<KernelInner>,
    pipe_capacity: usize,
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_pipe_capacity(crate::pipe::DEFAULT_PIPE_CAPACITY)
    }

    pub fn with_pipe_capacity(pipe_capacity: usize) -> Self {
        Kernel {
            inner: Mutex::new(KernelInner {
                next_pid: 1,
                procs: BTreeMap::new(),
                tables: BTreeMap::new(),
            }),
            pipe_capacity,
        }
    }

    // ─── Pids and fd tables ────────────────────────────────────

    /// Allocate the next pid.
    pub fn alloc_pid(&self) -> Pid {
        let mut inner = self.inner.lock();
        let pid = Pid(inner.next_pid);
        inner.next_pid += 1;
        pid
    }

    /// Create the process's empty fd table (0/1/2 null, counter at 3).
    pub fn init_process(&self, pid: Pid) {
        self.inner.lock().tables.insert(pid, FdTable::new());
    }

    /// Allocate a pipe and insert both endpoints into the caller's
    /// table at a contiguous fd pair; returns `(read_fd, write_fd)`
    /// with `write_fd == read_fd + 1`.
    pub fn create_pipe(&self, caller: Pid) -> Result<(u32, u32), KernelError> {
        let (reader, writer) = crate::pipe::pipe(self.pipe_capacity);
        let mut inner = self.inner.lock();
        let table = inner
            .tables
            .get_mut(&caller)
            .ok_or(KernelError::NoSuchProcess(caller.0))?;
        Ok(table.insert_pair(FdTarget::PipeRead(reader), FdTarget::PipeWrite(writer)))
    }

    /// Build a child fd table by copying the caller's targets at the
    /// requested descriptors into positions 0/1/2. Targets are cloned,
    /// not deep-copied: pipe endpoints stay shared with the parent.
    pub fn build_fd_table_for_spawn(
        &self,
        caller: Pid,
        stdin_fd: u32,
        stdout_fd: u32,
        stderr_fd: u32,
    ) -> Result<FdTable, KernelError> {
        let inner = self.inner.lock();
        let table = inner
            .tables
            .get(&caller)
            .ok_or(KernelError::NoSuchProcess(caller.0))?;
        let mut child = FdTable::new();
        for (slot, fd) in [(0u32, stdin_fd), (1, stdout_fd), (2, stderr_fd)] {
            let target = table.get(fd).cloned().ok_or(KernelError::BadFd(fd))?;
            child.set(slot, target);
        }
        Ok(child)
    }

    /// Install a pre-built fd table for a child pid.
    pub fn adopt_fd_table(&self, pid: Pid, table: FdTable) {
        self.inner.lock().tables.insert(pid, table);
    }

    pub fn set_fd_target(&self, pid: Pid, fd: u32, target: FdTarget) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        let table = inner
            .tables
            .get_mut(&pid)
            .ok_or(KernelError::NoSuchProcess(pid.0))?;
        table.set(fd, target);
        Ok(())
    }

    /// Counted clone of a target (cloning a pipe endpoint shares it).
    pub fn get_fd_target(&self, pid: Pid, fd: u32) -> Option<FdTarget> {
        self.inner.lock().tables.get(&pid)?.get(fd).cloned()
    }

    /// Close one fd. Dropping a pipe endpoint here is what propagates
    /// EOF/EPIPE to the other side once the last handle is gone.
    pub fn close_fd(&self, pid: Pid, fd: u32) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        let table = inner
            .tables
            .get_mut(&pid)
            .ok_or(KernelError::NoSuchProcess(pid.0))?;
        if table.remove(fd) {
            Ok(())
        } else {
            Err(KernelError::BadFd(fd))
        }
    }

    // ─── Process lifecycle ─────────────────────────────────────

    /// Record a running process.
    pub fn register_process(&self, pid: Pid) {
        self.inner.lock().procs.insert(
            pid,
            ProcessEntry {
                state: ProcState::Running,
                waiters: Vec::new(),
                task: None,
            },
        );
    }

    /// Register a process that never ran (unknown or denied tool): it is
    /// born exited so waitpid picks up the code immediately.
    pub fn register_stillborn(&self, pid: Pid, code: i32) {
        self.inner.lock().procs.insert(
            pid,
            ProcessEntry {
                state: ProcState::Exited(code),
                waiters: Vec::new(),
                task: None,
            },
        );
    }

    /// Attach the tokio task driving a process (aborted on dispose).
    pub fn attach_task(&self, pid: Pid, task: tokio::task::JoinHandle<()>) {
        if let Some(entry) = self.inner.lock().procs.get_mut(&pid) {
            entry.task = Some(task);
        }
    }

    /// Latch an exit code, drain waiters and drop the process's fd
    /// table (closing its pipe endpoints). The entry is consumed right
    /// away when a waiter was parked, otherwise it stays as a zombie.
    pub fn process_exited(&self, pid: Pid, code: i32) {
        let mut inner = self.inner.lock();
        inner.tables.remove(&pid);
        let Some(entry) = inner.procs.get_mut(&pid) else {
            return;
        };
        entry.state = ProcState::Exited(code);
        if entry.waiters.is_empty() {
            return;
        }
        let waiters = std::mem::take(&mut entry.waiters);
        inner.procs.remove(&pid);
        for waiter in waiters {
            let _ = waiter.send(code);
        }
        log::debug!("pid {pid} exited with {code}");
    }

    /// Wait for a process to exit. Resolves immediately for zombies
    /// (consuming them); otherwise parks a waiter continuation.
    pub async fn waitpid(&self, pid: Pid) -> Result<i32, KernelError> {
        let rx = {
            let mut inner = self.inner.lock();
            let entry = inner
                .procs
                .get_mut(&pid)
                .ok_or(KernelError::NoSuchProcess(pid.0))?;
            match entry.state {
                ProcState::Exited(code) => {
                    inner.procs.remove(&pid);
                    return Ok(code);
                }
                ProcState::Running => {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push(tx);
                    rx
                }
            }
        };
        rx.await.map_err(|_| KernelError::Cancelled)
    }

    pub fn state_of(&self, pid: Pid) -> Option<ProcState> {
        self.inner.lock().procs.get(&pid).map(|e| e.state)
    }

    pub fn process_count(&self) -> usize {
        self.inner.lock().procs.len()
    }

    // ─── Cancellation / disposal ───────────────────────────────

    /// Resolve every pending waitpid with the cancellation code and
    /// close every pipe endpoint held by any process; children unwind
    /// via EPIPE/EOF at their next I/O.
    pub fn cancel_all(&self, code: i32) {
        let mut inner = self.inner.lock();
        let mut woken = 0usize;
        for entry in inner.procs.values_mut() {
            for waiter in entry.waiters.drain(..) {
                let _ = waiter.send(code);
                woken += 1;
            }
        }
        for table in inner.tables.values_mut() {
            table.close_pipes();
        }
        log::debug!("cancel_all: woke {woken} waiters with code {code}");
    }

    /// Tear everything down: abort driving tasks, close every endpoint,
    /// clear both tables.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();
        for entry in inner.procs.values_mut() {
            for waiter in entry.waiters.drain(..) {
                let _ = waiter.send(crate::EXIT_CANCELLED);
            }
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
        inner.procs.clear();
        inner.tables.clear();
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
