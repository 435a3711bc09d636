//! wasmtime engine glue
//!
//! One `WasmEngine` per sandbox: async support gives every host call a
//! suspension point (the guest's stack is parked on a fiber while the
//! host awaits), and epoch interruption both bounds runaway in-guest
//! compute and yields the fiber back to the event loop every tick so
//! driver timers keep firing under a spinning guest.
//!
//! Guests are plain WASI-P1 command modules: instantiate, call
//! `_start`, map the outcome to an exit code. `proc_exit` and
//! cancellation unwind as typed trap payloads caught here.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;
use wasmtime::{Caller, Config, Engine, Extern, Linker, Memory, Module, Store, UpdateDeadline};

use kernel::{EXIT_CRASHED, EXIT_NOT_FOUND};

use crate::host::{self, HostCtx};
use crate::wasi::{CancelUnwind, ProcExit, WasiHost};

/// Period of the epoch ticker thread.
const EPOCH_TICK: Duration = Duration::from_millis(20);

/// Ticks a fired-but-cooperating shell guest is given to unwind and
/// write its result before it is trapped like any other guest.
const SHELL_CANCEL_GRACE_TICKS: u32 = 50;

/// Store data for one running guest.
pub struct GuestState {
    pub wasi: WasiHost,
    pub host: HostCtx,
    /// Epoch ticks observed since the cancel token fired.
    pub cancel_ticks: u32,
}

impl GuestState {
    pub fn new(wasi: WasiHost, host: HostCtx) -> Self {
        GuestState {
            wasi,
            host,
            cancel_ticks: 0,
        }
    }
}

/// Engine + compiled module registry.
pub struct WasmEngine {
    engine: Engine,
    modules: Mutex<BTreeMap<String, Module>>,
    ticker_stop: Arc<AtomicBool>,
}

impl WasmEngine {
    pub fn new() -> anyhow::Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config)?;

        let ticker_stop = Arc::new(AtomicBool::new(false));
        {
            let engine = engine.clone();
            let stop = Arc::clone(&ticker_stop);
            std::thread::Builder::new()
                .name(String::from("wasmbox-epoch"))
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(EPOCH_TICK);
                        engine.increment_epoch();
                    }
                })?;
        }

        Ok(WasmEngine {
            engine,
            modules: Mutex::new(BTreeMap::new()),
            ticker_stop,
        })
    }

    /// Compile and register a module under `name`.
    pub fn load_module(&self, name: impl Into<String>, bytes: &[u8]) -> anyhow::Result<()> {
        let module = Module::new(&self.engine, bytes)?;
        self.modules.lock().insert(name.into(), module);
        Ok(())
    }

    /// Load every `*.wasm` file in a directory, keyed by file stem.
    /// Returns the registered names.
    pub fn load_dir(&self, dir: &Path) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wasm") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let bytes = std::fs::read(&path)?;
            self.load_module(stem, &bytes)?;
            names.push(stem.to_string());
        }
        log::debug!("loaded {} wasm modules from {}", names.len(), dir.display());
        Ok(names)
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.lock().contains_key(name)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.lock().keys().cloned().collect()
    }

    /// Stop the epoch ticker thread. Called on sandbox destroy.
    pub fn shutdown(&self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
    }

    /// Instantiate and run a guest to completion, mapping every outcome
    /// to an exit code.
    pub async fn run(&self, module_name: &str, state: GuestState) -> i32 {
        let module = match self.modules.lock().get(module_name).cloned() {
            Some(module) => module,
            None => {
                log::warn!("run {module_name}: module not loaded");
                return EXIT_NOT_FOUND;
            }
        };
        match self.run_inner(module, state).await {
            Ok(code) => code,
            Err(e) => {
                log::error!("guest {module_name} trapped: {e:#}");
                EXIT_CRASHED
            }
        }
    }

    async fn run_inner(&self, module: Module, state: GuestState) -> anyhow::Result<i32> {
        let mut linker: Linker<GuestState> = Linker::new(&self.engine);
        host::add_wasi_preview1(&mut linker)?;
        host::add_host_abi(&mut linker)?;

        let mut store = Store::new(&self.engine, state);
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(|mut ctx| {
            let fired = ctx.data().wasi.cancel.check().err();
            match fired {
                None => {
                    ctx.data_mut().cancel_ticks = 0;
                    // Yield the fiber so event-loop timers run even under
                    // a guest that never does I/O.
                    Ok(UpdateDeadline::Yield(1))
                }
                Some(reason) => {
                    let state = ctx.data_mut();
                    state.cancel_ticks += 1;
                    let is_shell = state.host.caps.contains(kernel::Caps::SHELL);
                    if is_shell && state.cancel_ticks <= SHELL_CANCEL_GRACE_TICKS {
                        // The shell unwinds cooperatively; give it time to
                        // write a well-formed result.
                        Ok(UpdateDeadline::Yield(1))
                    } else {
                        Err(anyhow::Error::new(CancelUnwind {
                            code: reason.exit_code(),
                        }))
                    }
                }
            }
        });

        let instance = linker.instantiate_async(&mut store, &module).await?;
        let start = instance.get_typed_func::<(), ()>(&mut store, "_start")?;
        match start.call_async(&mut store, ()).await {
            Ok(()) => Ok(store.data().wasi.exit_code().unwrap_or(0)),
            Err(e) => {
                if let Some(exit) = e.downcast_ref::<ProcExit>() {
                    return Ok(exit.0);
                }
                if let Some(cancel) = e.downcast_ref::<CancelUnwind>() {
                    return Ok(cancel.code);
                }
                Err(e)
            }
        }
    }
}

impl Drop for WasmEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Guest memory helpers ──────────────────────────────────────

/// The guest's exported linear memory.
pub(crate) fn guest_memory(caller: &mut Caller<'_, GuestState>) -> anyhow::Result<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(anyhow!("guest exports no linear memory")),
    }
}

pub(crate) fn read_bytes(
    memory: &Memory,
    caller: &Caller<'_, GuestState>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<Vec<u8>> {
    let start = ptr as u32 as usize;
    let len = len as u32 as usize;
    let end = start
        .checked_add(len)
        .ok_or_else(|| anyhow!("guest pointer overflow"))?;
    memory
        .data(caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| anyhow!("guest pointer out of bounds"))
}

pub(crate) fn read_str(
    memory: &Memory,
    caller: &Caller<'_, GuestState>,
    ptr: i32,
    len: i32,
) -> anyhow::Result<String> {
    String::from_utf8(read_bytes(memory, caller, ptr, len)?)
        .map_err(|_| anyhow!("guest string is not UTF-8"))
}

pub(crate) fn write_bytes(
    memory: &Memory,
    caller: &mut Caller<'_, GuestState>,
    ptr: i32,
    data: &[u8],
) -> anyhow::Result<()> {
    let start = ptr as u32 as usize;
    let end = start
        .checked_add(data.len())
        .ok_or_else(|| anyhow!("guest pointer overflow"))?;
    memory
        .data_mut(caller)
        .get_mut(start..end)
        .ok_or_else(|| anyhow!("guest pointer out of bounds"))?
        .copy_from_slice(data);
    Ok(())
}

pub(crate) fn write_u32(
    memory: &Memory,
    caller: &mut Caller<'_, GuestState>,
    ptr: i32,
    value: u32,
) -> anyhow::Result<()> {
    write_bytes(memory, caller, ptr, &value.to_le_bytes())
}

pub(crate) fn write_u64(
    memory: &Memory,
    caller: &mut Caller<'_, GuestState>,
    ptr: i32,
    value: u64,
) -> anyhow::Result<()> {
    write_bytes(memory, caller, ptr, &value.to_le_bytes())
}

/// The `(out_ptr, out_cap)` convention: write the payload when it fits;
/// either way return its full size so a short buffer can be retried.
pub(crate) fn write_out(
    memory: &Memory,
    caller: &mut Caller<'_, GuestState>,
    out_ptr: i32,
    out_cap: i32,
    data: &[u8],
) -> anyhow::Result<i64> {
    if data.len() <= out_cap as u32 as usize {
        write_bytes(memory, caller, out_ptr, data)?;
    }
    Ok(data.len() as i64)
}
