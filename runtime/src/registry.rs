//! Tool and extension registries
//!
//! The tool registry is what `spawn` consults: a name maps to either a
//! WASM module key (instantiated by the engine) or a native tool (a
//! host-side task driven through the same kernel fd machinery, used by
//! tests and built-in helpers). Each tool carries its capability set
//! and an enabled flag; `spawn` turns an unknown name into exit 127 and
//! a disabled one into exit 126 without instantiating anything.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;

use kernel::{CancelToken, Caps, IoError, Kernel, Pid};
use storage::vfs::SharedVfs;

/// Everything a native tool needs to behave like a spawned guest.
pub struct ToolCtx {
    pub pid: Pid,
    pub kernel: Arc<Kernel>,
    pub vfs: SharedVfs,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: String,
    pub cancel: CancelToken,
}

impl ToolCtx {
    /// Read from one of this tool's fds (suspends on an empty pipe).
    pub async fn read(&self, fd: u32, max: usize) -> Result<Vec<u8>, IoError> {
        kernel::io::read_fd(&self.kernel, self.pid, fd, max).await
    }

    /// Write to one of this tool's fds (suspends on a full pipe).
    pub async fn write(&self, fd: u32, data: &[u8]) -> Result<usize, IoError> {
        kernel::io::write_fd(&self.kernel, self.pid, fd, data).await
    }

    pub fn close(&self, fd: u32) {
        let _ = self.kernel.close_fd(self.pid, fd);
    }
}

/// A host-side program registered under a tool name.
pub trait NativeTool: Send + Sync {
    fn run(&self, ctx: ToolCtx) -> BoxFuture<'static, i32>;
}

/// How a registered tool is executed.
#[derive(Clone)]
pub enum ToolKind {
    /// A WASM module known to the engine by this key.
    Wasm(String),
    /// A native task.
    Native(Arc<dyn NativeTool>),
}

/// One registry entry.
#[derive(Clone)]
pub struct Tool {
    pub kind: ToolKind,
    pub caps: Caps,
    pub enabled: bool,
}

/// Name → tool mapping, shared by the host-ABI and the facade.
pub struct ToolRegistry {
    tools: Mutex<BTreeMap<String, Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry {
            tools: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register_wasm(&self, name: impl Into<String>, module: impl Into<String>, caps: Caps) {
        self.tools.lock().insert(
            name.into(),
            Tool {
                kind: ToolKind::Wasm(module.into()),
                caps,
                enabled: true,
            },
        );
    }

    pub fn register_native(&self, name: impl Into<String>, tool: Arc<dyn NativeTool>, caps: Caps) {
        self.tools.lock().insert(
            name.into(),
            Tool {
                kind: ToolKind::Native(tool),
                caps,
                enabled: true,
            },
        );
    }

    /// Flip a tool's allow bit; disabled tools spawn as exit 126.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.tools.lock().get_mut(name) {
            Some(tool) => {
                tool.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Tool> {
        self.tools.lock().get(name).cloned()
    }

    /// Whether `name` is registered and currently allowed.
    pub fn is_available(&self, name: &str) -> bool {
        self.tools
            .lock()
            .get(name)
            .map(|t| t.enabled)
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.lock().keys().cloned().collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Extensions ────────────────────────────────────────────────

/// A host-provided named extension reachable via `extension_invoke`.
/// Payload and result are opaque strings (JSON by convention).
pub trait Extension: Send + Sync {
    fn invoke(&self, payload: &str) -> Result<String, String>;
}

/// Name → extension mapping.
pub struct ExtensionRegistry {
    extensions: Mutex<BTreeMap<String, Arc<dyn Extension>>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        ExtensionRegistry {
            extensions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, name: impl Into<String>, extension: Arc<dyn Extension>) {
        self.extensions.lock().insert(name.into(), extension);
    }

    /// Invoke by name. Unknown names and extension failures come back as
    /// `Err(message)`; the host-ABI surfaces them as an error field, not
    /// a trap.
    pub fn invoke(&self, name: &str, payload: &str) -> Result<String, String> {
        let extension = {
            let map = self.extensions.lock();
            map.get(name).cloned()
        };
        match extension {
            Some(ext) => ext.invoke(payload),
            None => Err(format!("unknown extension: {name}")),
        }
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup_and_enable() {
        let registry = ToolRegistry::new();
        registry.register_wasm("cat", "cat", Caps::coreutil());
        assert!(registry.is_available("cat"));
        assert!(!registry.is_available("dog"));

        registry.set_enabled("cat", false);
        assert!(!registry.is_available("cat"));
        assert!(registry.lookup("cat").is_some());
    }

    #[test]
    fn test_extension_registry() {
        struct Upper;
        impl Extension for Upper {
            fn invoke(&self, payload: &str) -> Result<String, String> {
                Ok(payload.to_uppercase())
            }
        }
        let registry = ExtensionRegistry::new();
        registry.register("upper", Arc::new(Upper));
        assert_eq!(registry.invoke("upper", "abc").unwrap(), "ABC");
        assert!(registry.invoke("missing", "x").is_err());
    }
}
