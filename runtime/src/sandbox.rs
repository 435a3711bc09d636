//! Sandbox facade
//!
//! The public surface: construct a sandbox with options, run shell
//! commands through it, touch its filesystem and environment, export
//! and import durable state, destroy it. Everything else in this
//! workspace hangs off the components wired together here.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use kernel::{Caps, Kernel};
use network::{FetchBackend, NetBridge, NetPolicy};
use storage::provider::{DeviceProvider, HostDirProvider, ProcInfoProvider};
use storage::state::{self, StateError};
use storage::vfs::{DirEntry, FileStat, SharedVfs, Vfs, VfsError, VfsLimits};

use crate::engine::WasmEngine;
use crate::host::HostCtx;
use crate::registry::{Extension, ExtensionRegistry, NativeTool, ToolRegistry};
use crate::shell::{
    RunResult, ShellDriver, ShellError, DEFAULT_STDERR_LIMIT, DEFAULT_STDOUT_LIMIT,
};
use crate::wasi::Clock;

/// A host directory exposed inside the sandbox.
#[derive(Debug, Clone)]
pub struct HostMount {
    pub prefix: String,
    pub root: PathBuf,
    pub writable: bool,
}

/// Construction options. `Default` gives a closed sandbox: 30 s command
/// deadline, 256 MiB filesystem quota, no wasm directory, no egress.
pub struct SandboxOptions {
    /// Directory of `*.wasm` tool modules (file stem = tool name).
    pub wasm_dir: Option<PathBuf>,
    /// Per-command deadline in milliseconds.
    pub timeout_ms: u64,
    /// Filesystem byte quota.
    pub fs_limit_bytes: u64,
    /// Optional entry-count quota.
    pub entry_limit: Option<u64>,
    /// Module name of the shell guest.
    pub shell_module: String,
    /// Capture caps for command stdout/stderr.
    pub stdout_limit: usize,
    pub stderr_limit: usize,
    /// Pipe capacity for `pipe` host calls.
    pub pipe_capacity: usize,
    /// Egress policy (deny-all unless widened).
    pub net_policy: NetPolicy,
    /// Platform fetch adapter; without one, allowed fetches fail softly.
    pub fetch_backend: Option<Arc<dyn FetchBackend>>,
    /// Package names pre-created under `/opt/packages`.
    pub packages: Vec<String>,
    /// Host directories mapped through traversal-checked providers.
    pub host_mounts: Vec<HostMount>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        SandboxOptions {
            wasm_dir: None,
            timeout_ms: 30_000,
            fs_limit_bytes: 256 * 1024 * 1024,
            entry_limit: None,
            shell_module: String::from("shell"),
            stdout_limit: DEFAULT_STDOUT_LIMIT,
            stderr_limit: DEFAULT_STDERR_LIMIT,
            pipe_capacity: kernel::DEFAULT_PIPE_CAPACITY,
            net_policy: NetPolicy::deny_all(),
            fetch_backend: None,
            packages: Vec::new(),
            host_mounts: Vec::new(),
        }
    }
}

/// Facade-level errors. Command-level outcomes (timeout, not found,
/// crash) are reported through [`RunResult`] exit codes instead.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("DESTROYED: sandbox has been destroyed")]
    Destroyed,
    #[error(transparent)]
    Vfs(#[from] VfsError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error("engine failure: {0}")]
    Engine(String),
}

/// An in-process sandbox instance.
pub struct Sandbox {
    kernel: Arc<Kernel>,
    vfs: SharedVfs,
    engine: Arc<WasmEngine>,
    registry: Arc<ToolRegistry>,
    extensions: Arc<ExtensionRegistry>,
    driver: ShellDriver,
    env: Mutex<BTreeMap<String, String>>,
    env_dirty: AtomicBool,
    destroyed: AtomicBool,
}

impl Sandbox {
    /// Construct a sandbox: default filesystem layout, virtual mounts,
    /// engine + tool registry from the wasm directory, network bridge.
    pub fn create(options: SandboxOptions) -> Result<Sandbox, SandboxError> {
        let clock = Clock::new();
        let kernel = Arc::new(Kernel::with_pipe_capacity(options.pipe_capacity));

        let mut vfs = Vfs::with_limits(VfsLimits {
            fs_limit: Some(options.fs_limit_bytes),
            entry_limit: options.entry_limit,
        });
        vfs.with_bypass(|v| -> Result<(), VfsError> {
            v.mkdirp("/home/user")?;
            v.mkdirp("/tmp")?;
            v.mkdirp("/etc")?;
            v.mkdirp("/usr/lib/python")?;
            v.mkdirp("/opt/packages")?;
            v.mkdirp("/dev")?;
            v.mkdirp("/proc")?;
            v.write_file("/etc/hostname", b"wasmbox\n")?;
            v.write_file(
                "/etc/passwd",
                b"root:x:0:0:root:/root:/bin/sh\nuser:x:1000:1000:user:/home/user:/bin/sh\n",
            )?;
            for package in &options.packages {
                v.mkdirp(&format!("/opt/packages/{package}"))?;
            }
            Ok(())
        })?;
        vfs.mount("/dev", Arc::new(DeviceProvider::new()))?;
        vfs.mount(
            "/proc",
            Arc::new(ProcInfoProvider::new(format!(
                "wasmbox {}",
                env!("CARGO_PKG_VERSION")
            ))),
        )?;
        for mount in &options.host_mounts {
            vfs.mount(
                &mount.prefix,
                Arc::new(HostDirProvider::new(mount.root.clone(), mount.writable)),
            )?;
        }
        let vfs: SharedVfs = Arc::new(parking_lot::Mutex::new(vfs));

        let engine = Arc::new(WasmEngine::new().map_err(|e| SandboxError::Engine(e.to_string()))?);
        let registry = Arc::new(ToolRegistry::new());
        if let Some(dir) = &options.wasm_dir {
            let names = engine
                .load_dir(dir)
                .map_err(|e| SandboxError::Engine(e.to_string()))?;
            for name in names {
                let caps = if name == options.shell_module {
                    Caps::shell()
                } else if name.starts_with("python") {
                    Caps::python()
                } else {
                    Caps::coreutil()
                };
                registry.register_wasm(name.clone(), name, caps);
            }
        }

        let extensions = Arc::new(ExtensionRegistry::new());
        let bridge = Arc::new(NetBridge::new(
            options.net_policy.clone(),
            options.fetch_backend.clone(),
        ));

        let mut env = BTreeMap::new();
        env.insert(String::from("HOME"), String::from("/home/user"));
        env.insert(String::from("USER"), String::from("user"));
        env.insert(String::from("SHELL"), String::from("/bin/sh"));
        env.insert(String::from("PATH"), String::from("/usr/bin:/bin"));
        env.insert(String::from("PWD"), String::from("/home/user"));
        env.insert(String::from("TMPDIR"), String::from("/tmp"));
        env.insert(String::from("LANG"), String::from("C.UTF-8"));

        let template = HostCtx {
            kernel: Arc::clone(&kernel),
            vfs: Arc::clone(&vfs),
            engine: Arc::clone(&engine),
            registry: Arc::clone(&registry),
            extensions: Arc::clone(&extensions),
            bridge,
            clock,
            caps: Caps::empty(),
            shell: None,
        };
        let driver = ShellDriver::new(
            template,
            options.shell_module.clone(),
            Duration::from_millis(options.timeout_ms),
            options.stdout_limit,
            options.stderr_limit,
        );

        Ok(Sandbox {
            kernel,
            vfs,
            engine,
            registry,
            extensions,
            driver,
            env: Mutex::new(env),
            env_dirty: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    fn ensure_alive(&self) -> Result<(), SandboxError> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(SandboxError::Destroyed)
        } else {
            Ok(())
        }
    }

    // ─── Commands ──────────────────────────────────────────────

    /// Run one command through the default shell.
    pub async fn run(&self, command: &str) -> Result<RunResult, SandboxError> {
        self.run_in("main", command).await
    }

    /// Run one command through a named shell session.
    pub async fn run_in(&self, shell: &str, command: &str) -> Result<RunResult, SandboxError> {
        self.ensure_alive()?;
        let env_snapshot: Vec<(String, String)> = self
            .env
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let session = self.driver.session(shell, env_snapshot.clone())?;

        // Forward sync: only push the env into the guest when an
        // external path changed it.
        let patch = if self.env_dirty.swap(false, Ordering::AcqRel) {
            env_snapshot
        } else {
            Vec::new()
        };

        let outcome = self.driver.run(&session, command, patch).await;
        if outcome.crashed {
            self.driver.discard(shell);
        }
        if let Some(env) = outcome.env {
            // An empty report means the guest did not echo its
            // environment back; keep what we have.
            if !env.is_empty() {
                *self.env.lock() = env.into_iter().collect();
            }
        }
        Ok(outcome.result)
    }

    // ─── Filesystem surface ────────────────────────────────────

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.ensure_alive()?;
        Ok(self.vfs.lock().read_file(path)?)
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        Ok(self.vfs.lock().write_file(path, data)?)
    }

    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError> {
        self.ensure_alive()?;
        Ok(self.vfs.lock().read_dir(path)?)
    }

    /// Create a directory, including missing ancestors; a no-op when it
    /// already exists.
    pub fn mkdir(&self, path: &str) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        Ok(self.vfs.lock().mkdirp(path)?)
    }

    pub fn stat(&self, path: &str) -> Result<FileStat, SandboxError> {
        self.ensure_alive()?;
        Ok(self.vfs.lock().stat(path)?)
    }

    /// Remove a file, symlink or empty directory.
    pub fn rm(&self, path: &str) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        let mut vfs = self.vfs.lock();
        match vfs.rm(path) {
            Err(VfsError::IsDirectory(_)) => Ok(vfs.rmdir(path)?),
            other => Ok(other?),
        }
    }

    // ─── Environment ───────────────────────────────────────────

    pub fn get_env(&self, name: &str) -> Option<String> {
        self.env.lock().get(name).cloned()
    }

    pub fn set_env(&self, name: impl Into<String>, value: impl Into<String>) {
        self.env.lock().insert(name.into(), value.into());
        self.env_dirty.store(true, Ordering::Release);
    }

    pub fn env_snapshot(&self) -> BTreeMap<String, String> {
        self.env.lock().clone()
    }

    // ─── Persistence ───────────────────────────────────────────

    pub fn export_state(&self) -> Result<Vec<u8>, SandboxError> {
        self.ensure_alive()?;
        let env = self.env.lock().clone();
        Ok(state::export_state(&self.vfs.lock(), &env))
    }

    pub fn import_state(&self, blob: &[u8]) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        let env = state::import_state(&mut self.vfs.lock(), blob)?;
        if !env.is_empty() {
            *self.env.lock() = env;
            self.env_dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    // ─── Registration hooks ────────────────────────────────────

    /// Register a native tool (spawnable by name like any coreutil).
    pub fn register_native_tool(
        &self,
        name: impl Into<String>,
        tool: Arc<dyn NativeTool>,
        caps: Caps,
    ) {
        self.registry.register_native(name, tool, caps);
    }

    /// Register a host extension reachable via `extension_invoke`.
    pub fn register_extension(&self, name: impl Into<String>, extension: Arc<dyn Extension>) {
        self.extensions.register(name, extension);
    }

    /// Allow or deny a registered tool.
    pub fn set_tool_enabled(&self, name: &str, enabled: bool) -> bool {
        self.registry.set_enabled(name, enabled)
    }

    pub fn vfs(&self) -> &SharedVfs {
        &self.vfs
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Cancel whatever is currently executing: every session's token
    /// fires, pending waitpids resolve with the cancellation code and
    /// every pipe endpoint closes (children unwind at their next I/O).
    pub fn cancel(&self) {
        self.driver.cancel_sessions(kernel::CancelReason::Cancelled);
        self.kernel.cancel_all(kernel::EXIT_CANCELLED);
    }

    // ─── Teardown ──────────────────────────────────────────────

    /// Tear the sandbox down; every subsequent call fails with the
    /// destroyed error.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.driver.drop_all();
        self.kernel.dispose();
        self.engine.shutdown();
        log::debug!("sandbox destroyed");
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::create(SandboxOptions::default()).unwrap()
    }

    #[test]
    fn test_default_layout() {
        let sb = sandbox();
        assert!(sb.stat("/home/user").is_ok());
        assert!(sb.stat("/tmp").is_ok());
        assert!(sb.stat("/dev/null").is_ok());
        assert!(sb.stat("/proc/uptime").is_ok());
        let passwd = sb.read_file("/etc/passwd").unwrap();
        assert!(String::from_utf8(passwd).unwrap().contains("user"));
    }

    #[test]
    fn test_fs_surface_round_trip() {
        let sb = sandbox();
        sb.write_file("/home/user/a.txt", b"abc").unwrap();
        assert_eq!(sb.read_file("/home/user/a.txt").unwrap(), b"abc");
        sb.mkdir("/home/user/d/e").unwrap();
        sb.mkdir("/home/user/d/e").unwrap(); // idempotent
        let names: Vec<String> = sb
            .read_dir("/home/user")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "d"]);
        sb.rm("/home/user/a.txt").unwrap();
        sb.rm("/home/user/d/e").unwrap();
        assert!(matches!(
            sb.read_file("/home/user/a.txt"),
            Err(SandboxError::Vfs(VfsError::NotFound(_)))
        ));
    }

    #[test]
    fn test_write_policy_at_facade() {
        let sb = sandbox();
        assert!(matches!(
            sb.write_file("/etc/hosts", b"nope"),
            Err(SandboxError::Vfs(VfsError::ReadOnly(_)))
        ));
        // Read-only mounts surface EROFS too.
        assert!(matches!(
            sb.write_file("/proc/uptime", b"0"),
            Err(SandboxError::Vfs(VfsError::ReadOnly(_)))
        ));
        // Writes to the discard sink succeed silently.
        sb.write_file("/dev/null", b"gone").unwrap();
    }

    #[test]
    fn test_env_get_set() {
        let sb = sandbox();
        assert_eq!(sb.get_env("HOME").unwrap(), "/home/user");
        sb.set_env("FOO", "bar");
        assert_eq!(sb.get_env("FOO").unwrap(), "bar");
    }

    #[test]
    fn test_state_round_trip_across_sandboxes() {
        let sb = sandbox();
        sb.write_file("/home/user/a.txt", b"abc").unwrap();
        sb.set_env("MARKER", "42");
        let blob = sb.export_state().unwrap();

        let fresh = sandbox();
        fresh.import_state(&blob).unwrap();
        assert_eq!(fresh.read_file("/home/user/a.txt").unwrap(), b"abc");
        assert_eq!(fresh.get_env("MARKER").unwrap(), "42");
    }

    #[test]
    fn test_corrupted_state_rejected() {
        let sb = sandbox();
        let mut blob = sb.export_state().unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(
            sandbox().import_state(&blob),
            Err(SandboxError::State(StateError::ChecksumMismatch))
        ));
    }

    #[test]
    fn test_destroyed_sandbox_refuses_calls() {
        let sb = sandbox();
        sb.destroy();
        assert!(matches!(
            sb.read_file("/etc/passwd"),
            Err(SandboxError::Destroyed)
        ));
        assert!(matches!(
            sb.write_file("/home/user/x", b""),
            Err(SandboxError::Destroyed)
        ));
        // Destroy is idempotent.
        sb.destroy();
    }

    #[tokio::test]
    async fn test_run_without_shell_module_fails() {
        let sb = sandbox();
        assert!(matches!(
            sb.run("echo hi").await,
            Err(SandboxError::Shell(ShellError::ModuleMissing(_)))
        ));
    }

    #[test]
    fn test_packages_precreated() {
        let sb = Sandbox::create(SandboxOptions {
            packages: vec![String::from("requests")],
            ..SandboxOptions::default()
        })
        .unwrap();
        assert!(sb.stat("/opt/packages/requests").unwrap().kind == storage::inode::NodeKind::Dir);
    }
}
