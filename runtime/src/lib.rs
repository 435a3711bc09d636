//! Wasmbox runtime
//!
//! Host-side execution layer for the sandbox: the per-guest WASI
//! Preview 1 host with fd-target dispatch, the wasmtime engine glue
//! (async host functions provide the stack-switching suspension
//! contract), the capability-scoped `wasmbox` host-ABI, the tool
//! registry, the long-lived shell driver, and the public [`Sandbox`]
//! facade.
//!
//! # Architecture
//!
//! - `wasi`: WASI-P1 context, errno mapping, deadline checks
//! - `engine`: wasmtime configuration, module registry, linker glue
//! - `host`: `wasmbox` namespace host calls (pipe/spawn/waitpid/...)
//! - `registry`: tool + extension registries, native tool trait
//! - `spawn`: the one spawn path shared by the host-ABI and tests
//! - `shell`: shell guest driver (command loop, deadline, env sync)
//! - `sandbox`: public facade (create/run/fs/env/state/destroy)

pub mod engine;
pub mod host;
pub mod registry;
pub mod sandbox;
pub mod shell;
pub mod spawn;
pub mod wasi;

pub use engine::{GuestState, WasmEngine};
pub use host::HostCtx;
pub use registry::{Extension, ExtensionRegistry, NativeTool, ToolCtx, ToolRegistry};
pub use sandbox::{HostMount, Sandbox, SandboxError, SandboxOptions};
pub use shell::{RunResult, ShellCommand, ShellEndpoint, ShellReply};
pub use spawn::{spawn_tool, SpawnSpec};
pub use wasi::{Clock, Errno, WasiHost};
