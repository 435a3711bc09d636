//! Shell driver
//!
//! The shell guest is instantiated once per named shell and loops:
//! read command → parse → execute → write result. All shell state
//! (environment, cwd, functions, option flags, history) lives in the
//! guest's memory; the driver owns only the rendezvous: the command
//! channel, the per-command deadline, the stdout/stderr capture caps,
//! env synchronization and crash containment.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_channel::oneshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use kernel::{CancelReason, CancelStatus, CancelToken, CaptureHandle, FdTarget, Pid};
use kernel::{EXIT_CRASHED, EXIT_TIMEOUT};

use crate::engine::GuestState;
use crate::host::HostCtx;
use crate::wasi::WasiHost;

/// Extra slack on top of the deadline before the driver stops waiting
/// for a cooperative unwind and reports the timeout itself.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

/// Default byte caps for captured command output.
pub const DEFAULT_STDOUT_LIMIT: usize = 512 * 1024;
pub const DEFAULT_STDERR_LIMIT: usize = 128 * 1024;

/// What one `run` call hands back to the caller.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub truncated: bool,
}

/// What the guest reports through `write_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellReply {
    pub exit_code: i32,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

/// A queued command plus the continuation its result resolves.
pub struct ShellCommand {
    pub line: String,
    /// Env entries an external path changed since the last command; the
    /// guest merges them before executing.
    pub env: Vec<(String, String)>,
    pub reply: oneshot::Sender<ShellReply>,
}

/// Wire form of a `read_command` response.
#[derive(Debug, Serialize, Deserialize)]
struct CommandWire {
    line: String,
    #[serde(default)]
    env: Vec<(String, String)>,
}

/// The host side of the shell rendezvous, owned by the shell guest's
/// `HostCtx`. `read_command` suspends here between commands.
pub struct ShellEndpoint {
    commands: tokio::sync::Mutex<mpsc::UnboundedReceiver<ShellCommand>>,
    pending_reply: Mutex<Option<oneshot::Sender<ShellReply>>>,
    /// A serialized command that did not fit the guest's out buffer;
    /// served again on the retry.
    stashed: Mutex<Option<String>>,
}

impl ShellEndpoint {
    fn new(commands: mpsc::UnboundedReceiver<ShellCommand>) -> Self {
        ShellEndpoint {
            commands: tokio::sync::Mutex::new(commands),
            pending_reply: Mutex::new(None),
            stashed: Mutex::new(None),
        }
    }

    /// Block for the next command and serialize it. `None` means the
    /// driver is gone and the shell should exit.
    pub async fn next_command_json(&self) -> Option<String> {
        if let Some(json) = self.stashed.lock().take() {
            return Some(json);
        }
        let command = self.commands.lock().await.recv().await?;
        *self.pending_reply.lock() = Some(command.reply);
        let wire = CommandWire {
            line: command.line,
            env: command.env,
        };
        Some(serde_json::to_string(&wire).expect("command serializes"))
    }

    /// Park a serialized command for the size-retry protocol.
    pub fn stash(&self, json: String) {
        *self.stashed.lock() = Some(json);
    }

    /// Resolve the pending command with the guest's result. Returns
    /// false when no command was pending (a stale result is dropped).
    pub fn deliver_result(&self, reply: ShellReply) -> bool {
        match self.pending_reply.lock().take() {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }
}

/// Outcome of driving one command, including the env the guest reported
/// back (absent on crash/timeout).
pub struct DriverOutcome {
    pub result: RunResult,
    pub env: Option<Vec<(String, String)>>,
    pub crashed: bool,
}

/// A live shell guest.
pub struct ShellSession {
    pub pid: Pid,
    sender: mpsc::UnboundedSender<ShellCommand>,
    cancel: CancelToken,
}

impl ShellSession {
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Errors from the driver itself (not from commands).
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("shell module not available: {0}")]
    ModuleMissing(String),
}

/// Owns the named shell table and drives commands through shell guests.
pub struct ShellDriver {
    template: HostCtx,
    shell_module: String,
    timeout: Duration,
    stdout_limit: usize,
    stderr_limit: usize,
    sessions: Mutex<BTreeMap<String, Arc<ShellSession>>>,
}

impl ShellDriver {
    pub fn new(
        template: HostCtx,
        shell_module: impl Into<String>,
        timeout: Duration,
        stdout_limit: usize,
        stderr_limit: usize,
    ) -> Self {
        ShellDriver {
            template,
            shell_module: shell_module.into(),
            timeout,
            stdout_limit,
            stderr_limit,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fetch (or lazily instantiate) the named shell.
    pub fn session(
        &self,
        name: &str,
        initial_env: Vec<(String, String)>,
    ) -> Result<Arc<ShellSession>, ShellError> {
        if let Some(session) = self.sessions.lock().get(name) {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(self.spawn_shell(initial_env)?);
        self.sessions
            .lock()
            .insert(name.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Forget a crashed shell so the next command gets a fresh guest.
    pub fn discard(&self, name: &str) {
        self.sessions.lock().remove(name);
    }

    /// Fire every session's cancel token with the given reason.
    pub fn cancel_sessions(&self, reason: CancelReason) {
        for session in self.sessions.lock().values() {
            session.cancel.cancel(reason);
        }
    }

    pub fn drop_all(&self) {
        self.sessions.lock().clear();
    }

    fn spawn_shell(&self, initial_env: Vec<(String, String)>) -> Result<ShellSession, ShellError> {
        if !self.template.engine.has_module(&self.shell_module) {
            return Err(ShellError::ModuleMissing(self.shell_module.clone()));
        }
        let kernel = &self.template.kernel;
        let pid = kernel.alloc_pid();
        kernel.init_process(pid);
        kernel.register_process(pid);

        let cancel = CancelToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(ShellEndpoint::new(rx));

        let mut wasi = WasiHost::new(
            pid,
            self.template.kernel.clone(),
            self.template.vfs.clone(),
            vec![String::from("sh")],
            initial_env,
            String::from("/home/user"),
            cancel.clone(),
            self.template.clock.clone(),
        );
        if let Err(e) = wasi.preopen_root() {
            log::warn!("shell preopen failed: {e:?}");
        }
        let host = HostCtx {
            caps: kernel::Caps::shell(),
            shell: Some(Arc::clone(&endpoint)),
            ..self.template.clone()
        };
        let state = GuestState::new(wasi, host);

        let engine = self.template.engine.clone();
        let kernel_for_task = self.template.kernel.clone();
        let module = self.shell_module.clone();
        let task = tokio::spawn(async move {
            let code = engine.run(&module, state).await;
            log::debug!("shell guest (pid {pid}) finished with {code}");
            kernel_for_task.process_exited(pid, code);
        });
        kernel.attach_task(pid, task);

        Ok(ShellSession {
            pid,
            sender: tx,
            cancel,
        })
    }

    /// Drive one command through a session.
    pub async fn run(
        &self,
        session: &ShellSession,
        line: &str,
        env_patch: Vec<(String, String)>,
    ) -> DriverOutcome {
        let kernel = &self.template.kernel;
        let stdout = CaptureHandle::new(Some(self.stdout_limit));
        let stderr = CaptureHandle::new(Some(self.stderr_limit));
        let _ = kernel.set_fd_target(session.pid, 0, FdTarget::Null);
        let _ = kernel.set_fd_target(session.pid, 1, FdTarget::Buffer(stdout.clone()));
        let _ = kernel.set_fd_target(session.pid, 2, FdTarget::Buffer(stderr.clone()));

        session.cancel.reset();
        session.cancel.set_deadline(Instant::now() + self.timeout);

        let (reply_tx, reply_rx) = oneshot::channel();
        let command = ShellCommand {
            line: line.to_string(),
            env: env_patch,
            reply: reply_tx,
        };
        let started = Instant::now();
        if session.sender.send(command).is_err() {
            return self.crashed_outcome(started);
        }

        let outcome = tokio::time::timeout(self.timeout + DEADLINE_GRACE, reply_rx).await;
        let elapsed = started.elapsed().as_millis() as u64;
        let (out, out_truncated) = stdout.snapshot();
        let (err, err_truncated) = stderr.snapshot();
        let truncated = out_truncated || err_truncated;

        match outcome {
            Ok(Ok(reply)) => {
                let timed_out = session.cancel.status() == CancelStatus::TimedOut;
                let mut stderr_text = String::from_utf8_lossy(&err).into_owned();
                let exit_code = if timed_out {
                    stderr_text.push_str("command timed out\n");
                    EXIT_TIMEOUT
                } else {
                    reply.exit_code
                };
                DriverOutcome {
                    result: RunResult {
                        exit_code,
                        stdout: String::from_utf8_lossy(&out).into_owned(),
                        stderr: stderr_text,
                        execution_time_ms: elapsed,
                        truncated,
                    },
                    env: Some(reply.env),
                    crashed: false,
                }
            }
            Ok(Err(_)) => {
                // The guest dropped the reply channel: it trapped.
                self.crashed_outcome(started)
            }
            Err(_) => {
                // Cooperative unwind never arrived; tear the command down.
                session.cancel.cancel(CancelReason::Timeout);
                kernel.cancel_all(EXIT_TIMEOUT);
                let mut stderr_text = String::from_utf8_lossy(&err).into_owned();
                stderr_text.push_str("command timed out\n");
                log::warn!("command deadline fired after {elapsed}ms");
                DriverOutcome {
                    result: RunResult {
                        exit_code: EXIT_TIMEOUT,
                        stdout: String::from_utf8_lossy(&out).into_owned(),
                        stderr: stderr_text,
                        execution_time_ms: elapsed,
                        truncated,
                    },
                    env: None,
                    crashed: false,
                }
            }
        }
    }

    fn crashed_outcome(&self, started: Instant) -> DriverOutcome {
        DriverOutcome {
            result: RunResult {
                exit_code: EXIT_CRASHED,
                stdout: String::new(),
                stderr: String::from("shell guest crashed\n"),
                execution_time_ms: started.elapsed().as_millis() as u64,
                truncated: false,
            },
            env: None,
            crashed: true,
        }
    }
}
