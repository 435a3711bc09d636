//! End-to-end pipeline tests
//!
//! Drive the kernel exactly the way the shell guest does — pipe, spawn,
//! close the parent's endpoints, waitpid — with native tools standing
//! in for wasm coreutils. Everything above the instantiation seam
//! (fd tables, pipes, back-pressure, EPIPE propagation, waitpid,
//! cancellation, the capability gate on spawn) is the same code the
//! wasm path runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;

use kernel::{CancelToken, CaptureHandle, Caps, FdTarget, Kernel, Pid};
use network::{NetBridge, NetPolicy};
use wasmbox_runtime::{
    spawn_tool, Clock, ExtensionRegistry, HostCtx, NativeTool, SpawnSpec, ToolCtx, ToolRegistry,
    WasmEngine,
};

// ─── Native stand-in tools ─────────────────────────────────────

/// `echo ARGS...`: write the joined arguments plus newline to stdout.
struct EchoTool;

impl NativeTool for EchoTool {
    fn run(&self, ctx: ToolCtx) -> BoxFuture<'static, i32> {
        Box::pin(async move {
            let line = format!("{}\n", ctx.args[1..].join(" "));
            match ctx.write(1, line.as_bytes()).await {
                Ok(_) => 0,
                Err(_) => 1,
            }
        })
    }
}

/// `cat`: copy stdin to stdout until EOF.
struct CatTool;

impl NativeTool for CatTool {
    fn run(&self, ctx: ToolCtx) -> BoxFuture<'static, i32> {
        Box::pin(async move {
            loop {
                let chunk = match ctx.read(0, 4096).await {
                    Ok(chunk) => chunk,
                    Err(_) => return 1,
                };
                if chunk.is_empty() {
                    return 0;
                }
                if ctx.write(1, &chunk).await.is_err() {
                    return 1;
                }
            }
        })
    }
}

/// `seq FIRST LAST`: one number per line; stops at EPIPE. Reports every
/// accepted byte through the shared counter.
struct SeqTool {
    accepted: Arc<AtomicUsize>,
}

impl NativeTool for SeqTool {
    fn run(&self, ctx: ToolCtx) -> BoxFuture<'static, i32> {
        let accepted = Arc::clone(&self.accepted);
        Box::pin(async move {
            let first: u64 = ctx.args.get(1).and_then(|a| a.parse().ok()).unwrap_or(1);
            let last: u64 = ctx.args.get(2).and_then(|a| a.parse().ok()).unwrap_or(1);
            for n in first..=last {
                let line = format!("{n}\n");
                match ctx.write(1, line.as_bytes()).await {
                    Ok(n) => accepted.fetch_add(n, Ordering::SeqCst),
                    Err(_) => return 1,
                };
            }
            0
        })
    }
}

/// `head -n N` (fixed form `head N`): forward the first N lines, then
/// close both ends and exit.
struct HeadTool;

impl NativeTool for HeadTool {
    fn run(&self, ctx: ToolCtx) -> BoxFuture<'static, i32> {
        Box::pin(async move {
            let limit: usize = ctx.args.get(1).and_then(|a| a.parse().ok()).unwrap_or(10);
            let mut lines = 0usize;
            while lines < limit {
                let chunk = match ctx.read(0, 1).await {
                    Ok(chunk) => chunk,
                    Err(_) => return 1,
                };
                if chunk.is_empty() {
                    break;
                }
                if ctx.write(1, &chunk).await.is_err() {
                    return 1;
                }
                if chunk[0] == b'\n' {
                    lines += 1;
                }
            }
            // Dropping the read end here is what propagates EPIPE to the
            // producer.
            ctx.close(0);
            0
        })
    }
}

/// Suspend forever on stdin; exits on EOF.
struct BlockTool;

impl NativeTool for BlockTool {
    fn run(&self, ctx: ToolCtx) -> BoxFuture<'static, i32> {
        Box::pin(async move {
            loop {
                match ctx.read(0, 64).await {
                    Ok(chunk) if chunk.is_empty() => return 0,
                    Ok(_) => {}
                    Err(_) => return 1,
                }
            }
        })
    }
}

// ─── Harness ───────────────────────────────────────────────────

struct Harness {
    host: HostCtx,
    driver: Pid,
    cancel: CancelToken,
    seq_accepted: Arc<AtomicUsize>,
}

fn harness(pipe_capacity: usize) -> Harness {
    let kernel = Arc::new(Kernel::with_pipe_capacity(pipe_capacity));
    let vfs = Arc::new(parking_lot::Mutex::new(storage::vfs::Vfs::new()));
    let engine = Arc::new(WasmEngine::new().expect("engine"));
    let registry = Arc::new(ToolRegistry::new());

    let seq_accepted = Arc::new(AtomicUsize::new(0));
    registry.register_native("echo", Arc::new(EchoTool), Caps::coreutil());
    registry.register_native("cat", Arc::new(CatTool), Caps::coreutil());
    registry.register_native(
        "seq",
        Arc::new(SeqTool {
            accepted: Arc::clone(&seq_accepted),
        }),
        Caps::coreutil(),
    );
    registry.register_native("head", Arc::new(HeadTool), Caps::coreutil());
    registry.register_native("block", Arc::new(BlockTool), Caps::coreutil());

    let host = HostCtx {
        kernel: Arc::clone(&kernel),
        vfs,
        engine,
        registry,
        extensions: Arc::new(ExtensionRegistry::new()),
        bridge: Arc::new(NetBridge::new(NetPolicy::deny_all(), None)),
        clock: Clock::new(),
        caps: Caps::shell(),
        shell: None,
    };

    let driver = kernel.alloc_pid();
    kernel.init_process(driver);
    Harness {
        host,
        driver,
        cancel: CancelToken::new(),
        seq_accepted,
    }
}

#[tokio::test]
async fn test_simple_pipeline_echo_cat() {
    let h = harness(kernel::DEFAULT_PIPE_CAPACITY);
    let kernel = &h.host.kernel;

    // Capture buffer plays the driver's stdout.
    let capture = CaptureHandle::new(None);
    kernel
        .set_fd_target(h.driver, 1, FdTarget::Buffer(capture.clone()))
        .unwrap();

    let (r, w) = kernel.create_pipe(h.driver).unwrap();
    let echo = spawn_tool(
        &h.host,
        h.driver,
        h.cancel.clone(),
        SpawnSpec::new("echo").arg("hello").stdio(0, w, 2),
    )
    .unwrap();
    let cat = spawn_tool(
        &h.host,
        h.driver,
        h.cancel.clone(),
        SpawnSpec::new("cat").stdio(r, 1, 2),
    )
    .unwrap();

    // The parent must drop its pipe fds or EOF never reaches `cat`.
    kernel.close_fd(h.driver, r).unwrap();
    kernel.close_fd(h.driver, w).unwrap();

    assert_eq!(kernel.waitpid(echo).await.unwrap(), 0);
    assert_eq!(kernel.waitpid(cat).await.unwrap(), 0);

    let (out, truncated) = capture.snapshot();
    assert_eq!(out, b"hello\n");
    assert!(!truncated);
}

#[tokio::test]
async fn test_early_close_propagates_epipe() {
    // Small pipe so the producer actually feels back-pressure.
    let h = harness(64);
    let kernel = &h.host.kernel;

    let capture = CaptureHandle::new(None);
    kernel
        .set_fd_target(h.driver, 1, FdTarget::Buffer(capture.clone()))
        .unwrap();

    let (r, w) = kernel.create_pipe(h.driver).unwrap();
    let seq = spawn_tool(
        &h.host,
        h.driver,
        h.cancel.clone(),
        SpawnSpec::new("seq").arg("1").arg("1000").stdio(0, w, 2),
    )
    .unwrap();
    let head = spawn_tool(
        &h.host,
        h.driver,
        h.cancel.clone(),
        SpawnSpec::new("head").arg("5").stdio(r, 1, 2),
    )
    .unwrap();
    kernel.close_fd(h.driver, r).unwrap();
    kernel.close_fd(h.driver, w).unwrap();

    assert_eq!(kernel.waitpid(head).await.unwrap(), 0);
    // The producer observed EPIPE and bailed out.
    assert_eq!(kernel.waitpid(seq).await.unwrap(), 1);

    let (out, _) = capture.snapshot();
    assert_eq!(out, b"1\n2\n3\n4\n5\n");
    // Nowhere near 1000 lines' worth was ever accepted.
    assert!(h.seq_accepted.load(Ordering::SeqCst) < 200);
}

#[tokio::test]
async fn test_unknown_tool_is_127_without_instantiation() {
    let h = harness(kernel::DEFAULT_PIPE_CAPACITY);
    let pid = spawn_tool(
        &h.host,
        h.driver,
        h.cancel.clone(),
        SpawnSpec::new("no-such-tool"),
    )
    .unwrap();
    assert_eq!(h.host.kernel.waitpid(pid).await.unwrap(), 127);
}

#[tokio::test]
async fn test_disallowed_tool_is_126() {
    let h = harness(kernel::DEFAULT_PIPE_CAPACITY);
    h.host.registry.set_enabled("cat", false);
    let pid = spawn_tool(&h.host, h.driver, h.cancel.clone(), SpawnSpec::new("cat")).unwrap();
    assert_eq!(h.host.kernel.waitpid(pid).await.unwrap(), 126);
}

#[tokio::test]
async fn test_cancellation_unblocks_pipeline() {
    let h = harness(16);
    let kernel = Arc::clone(&h.host.kernel);

    // A consumer parked on a pipe nobody writes to (the driver keeps
    // the write end open in its own table).
    let (r, _w) = kernel.create_pipe(h.driver).unwrap();
    let block = spawn_tool(
        &h.host,
        h.driver,
        h.cancel.clone(),
        SpawnSpec::new("block").stdio(r, 1, 2),
    )
    .unwrap();
    kernel.close_fd(h.driver, r).unwrap();

    // A waiter parked on the consumer.
    let kernel_for_wait = Arc::clone(&kernel);
    let waiter = tokio::spawn(async move { kernel_for_wait.waitpid(block).await });
    tokio::task::yield_now().await;

    // Cancellation: pending waitpids resolve with the cancellation code
    // and every pipe endpoint closes, so the child unwinds at its next
    // (current) I/O.
    kernel.cancel_all(kernel::EXIT_CANCELLED);
    assert_eq!(waiter.await.unwrap().unwrap(), kernel::EXIT_CANCELLED);

    // Closing every endpoint propagated EOF, so the child unwound too.
    tokio::time::timeout(std::time::Duration::from_secs(1), async {
        loop {
            match kernel.state_of(block) {
                Some(kernel::ProcState::Exited(code)) => break code,
                _ => tokio::task::yield_now().await,
            }
        }
    })
    .await
    .expect("blocked child unwound after cancellation");
}

#[tokio::test]
async fn test_pipeline_through_vfs_file() {
    // cat a VFS file through a pipe into the capture buffer, the way
    // `cat < file | cat` wires up.
    let h = harness(kernel::DEFAULT_PIPE_CAPACITY);
    let kernel = &h.host.kernel;
    h.host.vfs.lock().with_bypass(|v| {
        v.mkdirp("/home/user").unwrap();
        v.write_file("/home/user/in.txt", b"from the vfs\n").unwrap();
    });

    let capture = CaptureHandle::new(None);
    kernel
        .set_fd_target(h.driver, 1, FdTarget::Buffer(capture.clone()))
        .unwrap();
    let handle = kernel::VfsFileHandle::new(
        Arc::clone(&h.host.vfs),
        "/home/user/in.txt",
        false,
    );
    let stdin_fd = {
        kernel
            .set_fd_target(h.driver, 9, FdTarget::VfsFile(handle))
            .unwrap();
        9
    };

    let (r, w) = kernel.create_pipe(h.driver).unwrap();
    let first = spawn_tool(
        &h.host,
        h.driver,
        h.cancel.clone(),
        SpawnSpec::new("cat").stdio(stdin_fd, w, 2),
    )
    .unwrap();
    let second = spawn_tool(
        &h.host,
        h.driver,
        h.cancel.clone(),
        SpawnSpec::new("cat").stdio(r, 1, 2),
    )
    .unwrap();
    kernel.close_fd(h.driver, r).unwrap();
    kernel.close_fd(h.driver, w).unwrap();

    assert_eq!(kernel.waitpid(first).await.unwrap(), 0);
    assert_eq!(kernel.waitpid(second).await.unwrap(), 0);
    let (out, _) = capture.snapshot();
    assert_eq!(out, b"from the vfs\n");
}
