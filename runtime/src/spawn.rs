//! The spawn path
//!
//! One function turns a spawn request into a running child process,
//! shared by the `wasmbox.spawn` host call and by tests driving the
//! kernel directly. The capability matrix is enforced here: unknown
//! tools become exit 127 and disallowed tools exit 126, in both cases
//! without instantiating anything: the child is registered already
//! exited so the caller's `waitpid` picks the code up immediately.

use serde::{Deserialize, Serialize};

use kernel::{CancelToken, Pid, EXIT_NOT_FOUND, EXIT_NOT_PERMITTED};

use crate::engine::GuestState;
use crate::host::HostCtx;
use crate::registry::{ToolCtx, ToolKind};
use crate::wasi::{Errno, WasiHost};

fn default_stdout() -> u32 {
    1
}

fn default_stderr() -> u32 {
    2
}

fn default_cwd() -> String {
    String::from("/")
}

/// A spawn request as it arrives over the host-ABI (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub prog: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub stdin_fd: u32,
    #[serde(default = "default_stdout")]
    pub stdout_fd: u32,
    #[serde(default = "default_stderr")]
    pub stderr_fd: u32,
}

impl SpawnSpec {
    pub fn new(prog: impl Into<String>) -> Self {
        SpawnSpec {
            prog: prog.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: default_cwd(),
            stdin_fd: 0,
            stdout_fd: 1,
            stderr_fd: 2,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stdio(mut self, stdin: u32, stdout: u32, stderr: u32) -> Self {
        self.stdin_fd = stdin;
        self.stdout_fd = stdout;
        self.stderr_fd = stderr;
        self
    }
}

/// Spawn a child for `caller`. Returns the child's pid synchronously;
/// the child runs concurrently in its own task. The only hard error is
/// a bad fd in the request; policy outcomes are delivered as exit
/// codes through `waitpid`.
pub fn spawn_tool(
    host: &HostCtx,
    caller: Pid,
    cancel: CancelToken,
    spec: SpawnSpec,
) -> Result<Pid, Errno> {
    let kernel = &host.kernel;
    let pid = kernel.alloc_pid();

    let Some(tool) = host.registry.lookup(&spec.prog) else {
        log::debug!("spawn {}: unknown tool", spec.prog);
        kernel.register_stillborn(pid, EXIT_NOT_FOUND);
        return Ok(pid);
    };
    if !tool.enabled {
        log::debug!("spawn {}: tool not permitted", spec.prog);
        kernel.register_stillborn(pid, EXIT_NOT_PERMITTED);
        return Ok(pid);
    }

    let table = kernel
        .build_fd_table_for_spawn(caller, spec.stdin_fd, spec.stdout_fd, spec.stderr_fd)
        .map_err(Errno::from)?;
    kernel.adopt_fd_table(pid, table);
    kernel.register_process(pid);

    let mut args = vec![spec.prog.clone()];
    args.extend(spec.args.iter().cloned());

    match tool.kind {
        ToolKind::Wasm(module) => {
            let mut wasi = WasiHost::new(
                pid,
                host.kernel.clone(),
                host.vfs.clone(),
                args,
                spec.env.clone(),
                spec.cwd.clone(),
                cancel,
                host.clock.clone(),
            );
            if let Err(e) = wasi.preopen_root() {
                log::warn!("spawn {}: preopen failed: {e:?}", spec.prog);
                host.kernel.process_exited(pid, 1);
                return Ok(pid);
            }
            let child_host = HostCtx {
                caps: tool.caps,
                shell: None,
                ..host.clone()
            };
            let state = GuestState::new(wasi, child_host);
            let engine = host.engine.clone();
            let kernel = host.kernel.clone();
            let prog = spec.prog.clone();
            let task = tokio::spawn(async move {
                let code = engine.run(&module, state).await;
                log::debug!("pid {pid} ({prog}) finished with {code}");
                kernel.process_exited(pid, code);
            });
            host.kernel.attach_task(pid, task);
        }
        ToolKind::Native(native) => {
            let ctx = ToolCtx {
                pid,
                kernel: host.kernel.clone(),
                vfs: host.vfs.clone(),
                args,
                env: spec.env.clone(),
                cwd: spec.cwd.clone(),
                cancel,
            };
            let future = native.run(ctx);
            let kernel = host.kernel.clone();
            let task = tokio::spawn(async move {
                let code = future.await;
                kernel.process_exited(pid, code);
            });
            host.kernel.attach_task(pid, task);
        }
    }

    log::debug!("spawned {} as pid {pid}", spec.prog);
    Ok(pid)
}
