//! Host function bindings
//!
//! Everything a guest can import: the `wasi_snapshot_preview1` surface
//! (fd dispatch, paths, clocks, random, argv/environ, poll) and the
//! capability-scoped `wasmbox` namespace (pipe/spawn/waitpid, VFS
//! calls, glob, network fetch, extensions, and the shell rendezvous).
//!
//! Convention for the `wasmbox` namespace: strings and buffers are
//! `(ptr, len)` pairs into guest memory; results go into an
//! `(out_ptr, out_cap)` region and the return value is the payload
//! size (the guest retries with a bigger buffer when it exceeds the
//! cap); errors are negative errnos.
//!
//! Every non-shell entry point checks the cancel token and unwinds the
//! guest with the cancellation code; the shell is trusted to poll
//! `check_cancel` and unwind cooperatively so it can write a
//! well-formed result.

use std::sync::Arc;
use std::time::Duration;

use wasmtime::{Caller, Linker};

use kernel::{Caps, Kernel, KernelError, Pid};
use network::{FetchRequest, NetBridge};
use storage::vfs::SharedVfs;

use crate::engine::{
    guest_memory, read_bytes, read_str, write_bytes, write_out, write_u32, write_u64, GuestState,
};
use crate::registry::{ExtensionRegistry, ToolRegistry};
use crate::shell::{ShellEndpoint, ShellReply};
use crate::spawn::{spawn_tool, SpawnSpec};
use crate::wasi::{CancelUnwind, Clock, Errno, ProcExit};
use crate::WasmEngine;

const WASI_MODULE: &str = "wasi_snapshot_preview1";
const ABI_MODULE: &str = "wasmbox";

/// Shared host services handed to every guest; `caps` and `shell` are
/// the per-guest parts.
#[derive(Clone)]
pub struct HostCtx {
    pub kernel: Arc<Kernel>,
    pub vfs: SharedVfs,
    pub engine: Arc<WasmEngine>,
    pub registry: Arc<ToolRegistry>,
    pub extensions: Arc<ExtensionRegistry>,
    pub bridge: Arc<NetBridge>,
    pub clock: Clock,
    pub caps: Caps,
    pub shell: Option<Arc<ShellEndpoint>>,
}

/// Unwind a non-shell guest once its cancel token has fired. The shell
/// polls `check_cancel` instead.
fn check_cancel_entry(caller: &Caller<'_, GuestState>) -> anyhow::Result<()> {
    let state = caller.data();
    if state.host.caps.contains(Caps::SHELL) {
        return Ok(());
    }
    if let Err(reason) = state.wasi.cancel.check() {
        return Err(anyhow::Error::new(CancelUnwind {
            code: reason.exit_code(),
        }));
    }
    Ok(())
}

fn require(caller: &Caller<'_, GuestState>, caps: Caps) -> Result<(), Errno> {
    if caller.data().host.caps.contains(caps) {
        Ok(())
    } else {
        Err(Errno::NotCapable)
    }
}

/// Parse a WASI iovec array into `(ptr, len)` pairs.
fn read_iovs(
    memory: &wasmtime::Memory,
    caller: &Caller<'_, GuestState>,
    iovs_ptr: i32,
    iovs_len: i32,
) -> anyhow::Result<Vec<(i32, i32)>> {
    let raw = read_bytes(memory, caller, iovs_ptr, iovs_len.saturating_mul(8))?;
    Ok(raw
        .chunks_exact(8)
        .map(|chunk| {
            let ptr = u32::from_le_bytes(chunk[0..4].try_into().expect("4 bytes")) as i32;
            let len = u32::from_le_bytes(chunk[4..8].try_into().expect("4 bytes")) as i32;
            (ptr, len)
        })
        .collect())
}

// ─── WASI Preview 1 ────────────────────────────────────────────

/// Register the `wasi_snapshot_preview1` imports.
#[allow(clippy::too_many_lines)]
pub fn add_wasi_preview1(linker: &mut Linker<GuestState>) -> anyhow::Result<()> {
    linker.func_wrap2_async(
        WASI_MODULE,
        "args_sizes_get",
        |mut caller: Caller<'_, GuestState>, argc_ptr: i32, buf_size_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let args = caller.data().wasi.args_bytes();
                let total: usize = args.iter().map(Vec::len).sum();
                write_u32(&memory, &mut caller, argc_ptr, args.len() as u32)?;
                write_u32(&memory, &mut caller, buf_size_ptr, total as u32)?;
                Ok(Errno::Success.raw())
            })
        },
    )?;

    linker.func_wrap2_async(
        WASI_MODULE,
        "args_get",
        |mut caller: Caller<'_, GuestState>, argv_ptr: i32, argv_buf_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let args = caller.data().wasi.args_bytes();
                let mut cursor = argv_buf_ptr;
                for (i, arg) in args.iter().enumerate() {
                    write_u32(&memory, &mut caller, argv_ptr + i as i32 * 4, cursor as u32)?;
                    write_bytes(&memory, &mut caller, cursor, arg)?;
                    cursor += arg.len() as i32;
                }
                Ok(Errno::Success.raw())
            })
        },
    )?;

    linker.func_wrap2_async(
        WASI_MODULE,
        "environ_sizes_get",
        |mut caller: Caller<'_, GuestState>, count_ptr: i32, buf_size_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let env = caller.data().wasi.environ_bytes();
                let total: usize = env.iter().map(Vec::len).sum();
                write_u32(&memory, &mut caller, count_ptr, env.len() as u32)?;
                write_u32(&memory, &mut caller, buf_size_ptr, total as u32)?;
                Ok(Errno::Success.raw())
            })
        },
    )?;

    linker.func_wrap2_async(
        WASI_MODULE,
        "environ_get",
        |mut caller: Caller<'_, GuestState>, environ_ptr: i32, buf_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let env = caller.data().wasi.environ_bytes();
                let mut cursor = buf_ptr;
                for (i, entry) in env.iter().enumerate() {
                    write_u32(&memory, &mut caller, environ_ptr + i as i32 * 4, cursor as u32)?;
                    write_bytes(&memory, &mut caller, cursor, entry)?;
                    cursor += entry.len() as i32;
                }
                Ok(Errno::Success.raw())
            })
        },
    )?;

    linker.func_wrap3_async(
        WASI_MODULE,
        "clock_time_get",
        |mut caller: Caller<'_, GuestState>, id: i32, _precision: i64, time_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                match caller.data().wasi.clock_time_get(id as u32) {
                    Ok(nanos) => {
                        write_u64(&memory, &mut caller, time_ptr, nanos)?;
                        Ok(Errno::Success.raw())
                    }
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap2_async(
        WASI_MODULE,
        "clock_res_get",
        |mut caller: Caller<'_, GuestState>, _id: i32, res_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                write_u64(&memory, &mut caller, res_ptr, 1)?;
                Ok(Errno::Success.raw())
            })
        },
    )?;

    linker.func_wrap2_async(
        WASI_MODULE,
        "random_get",
        |mut caller: Caller<'_, GuestState>, buf_ptr: i32, buf_len: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let mut buf = vec![0u8; buf_len as u32 as usize];
                if caller.data().wasi.random_get(&mut buf).is_err() {
                    return Ok(Errno::Io.raw());
                }
                write_bytes(&memory, &mut caller, buf_ptr, &buf)?;
                Ok(Errno::Success.raw())
            })
        },
    )?;

    linker.func_wrap4_async(
        WASI_MODULE,
        "fd_read",
        |mut caller: Caller<'_, GuestState>, fd: i32, iovs_ptr: i32, iovs_len: i32, nread_ptr: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                let memory = guest_memory(&mut caller)?;
                let iovs = read_iovs(&memory, &caller, iovs_ptr, iovs_len)?;
                let total: usize = iovs.iter().map(|&(_, len)| len as u32 as usize).sum();

                let (kernel, pid) = {
                    let state = caller.data();
                    (state.wasi.kernel.clone(), state.wasi.pid)
                };
                let data = match kernel::io::read_fd(&kernel, pid, fd as u32, total).await {
                    Ok(data) => data,
                    Err(e) => return Ok(Errno::from(e).raw()),
                };

                let mut offset = 0usize;
                for (ptr, len) in iovs {
                    if offset >= data.len() {
                        break;
                    }
                    let n = (data.len() - offset).min(len as u32 as usize);
                    write_bytes(&memory, &mut caller, ptr, &data[offset..offset + n])?;
                    offset += n;
                }
                write_u32(&memory, &mut caller, nread_ptr, data.len() as u32)?;
                Ok(Errno::Success.raw())
            })
        },
    )?;

    linker.func_wrap4_async(
        WASI_MODULE,
        "fd_write",
        |mut caller: Caller<'_, GuestState>, fd: i32, iovs_ptr: i32, iovs_len: i32, nwritten_ptr: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                let memory = guest_memory(&mut caller)?;
                let iovs = read_iovs(&memory, &caller, iovs_ptr, iovs_len)?;
                let mut data = Vec::new();
                for (ptr, len) in iovs {
                    data.extend(read_bytes(&memory, &caller, ptr, len)?);
                }

                let (kernel, pid) = {
                    let state = caller.data();
                    (state.wasi.kernel.clone(), state.wasi.pid)
                };
                match kernel::io::write_fd(&kernel, pid, fd as u32, &data).await {
                    Ok(n) => {
                        write_u32(&memory, &mut caller, nwritten_ptr, n as u32)?;
                        Ok(Errno::Success.raw())
                    }
                    Err(e) => Ok(Errno::from(e).raw()),
                }
            })
        },
    )?;

    linker.func_wrap1_async(
        WASI_MODULE,
        "fd_close",
        |mut caller: Caller<'_, GuestState>, fd: i32| {
            Box::new(async move {
                match caller.data_mut().wasi.fd_close(fd as u32) {
                    Ok(()) => Ok(Errno::Success.raw()),
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap4_async(
        WASI_MODULE,
        "fd_seek",
        |mut caller: Caller<'_, GuestState>, fd: i32, offset: i64, whence: i32, newoffset_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                match caller.data().wasi.fd_seek(fd as u32, offset, whence as u8) {
                    Ok(pos) => {
                        write_u64(&memory, &mut caller, newoffset_ptr, pos)?;
                        Ok(Errno::Success.raw())
                    }
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap2_async(
        WASI_MODULE,
        "fd_tell",
        |mut caller: Caller<'_, GuestState>, fd: i32, offset_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                match caller.data().wasi.fd_tell(fd as u32) {
                    Ok(pos) => {
                        write_u64(&memory, &mut caller, offset_ptr, pos)?;
                        Ok(Errno::Success.raw())
                    }
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap2_async(
        WASI_MODULE,
        "fd_fdstat_get",
        |mut caller: Caller<'_, GuestState>, fd: i32, out_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let filetype = match caller.data().wasi.fd_filetype(fd as u32) {
                    Ok(ft) => ft,
                    Err(e) => return Ok(e.raw()),
                };
                // fdstat: filetype u8, pad, flags u16, pad, rights u64 x2.
                let mut stat = [0u8; 24];
                stat[0] = filetype;
                stat[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
                stat[16..24].copy_from_slice(&u64::MAX.to_le_bytes());
                write_bytes(&memory, &mut caller, out_ptr, &stat)?;
                Ok(Errno::Success.raw())
            })
        },
    )?;

    linker.func_wrap2_async(
        WASI_MODULE,
        "fd_fdstat_set_flags",
        |_caller: Caller<'_, GuestState>, _fd: i32, _flags: i32| {
            Box::new(async move { Ok(Errno::Success.raw()) })
        },
    )?;

    linker.func_wrap2_async(
        WASI_MODULE,
        "fd_filestat_get",
        |mut caller: Caller<'_, GuestState>, fd: i32, out_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                match caller.data().wasi.fd_filestat(fd as u32) {
                    Ok(stat) => {
                        write_bytes(&memory, &mut caller, out_ptr, &encode_filestat(&stat))?;
                        Ok(Errno::Success.raw())
                    }
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap2_async(
        WASI_MODULE,
        "fd_prestat_get",
        |mut caller: Caller<'_, GuestState>, fd: i32, out_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let name_len = match caller.data().wasi.prestat_dir(fd as u32) {
                    Some(path) => path.len() as u32,
                    None => return Ok(Errno::BadF.raw()),
                };
                // prestat: tag u8 (0 = dir), pad, dir_name_len u32.
                let mut prestat = [0u8; 8];
                prestat[4..8].copy_from_slice(&name_len.to_le_bytes());
                write_bytes(&memory, &mut caller, out_ptr, &prestat)?;
                Ok(Errno::Success.raw())
            })
        },
    )?;

    linker.func_wrap3_async(
        WASI_MODULE,
        "fd_prestat_dir_name",
        |mut caller: Caller<'_, GuestState>, fd: i32, path_ptr: i32, path_len: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let name = match caller.data().wasi.prestat_dir(fd as u32) {
                    Some(path) => path.to_string(),
                    None => return Ok(Errno::BadF.raw()),
                };
                if name.len() > path_len as u32 as usize {
                    return Ok(Errno::Inval.raw());
                }
                write_bytes(&memory, &mut caller, path_ptr, name.as_bytes())?;
                Ok(Errno::Success.raw())
            })
        },
    )?;

    linker.func_wrap5_async(
        WASI_MODULE,
        "fd_readdir",
        |mut caller: Caller<'_, GuestState>, fd: i32, buf_ptr: i32, buf_len: i32, cookie: i64, bufused_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let entries = match caller.data().wasi.fd_readdir(fd as u32, cookie as u64) {
                    Ok(entries) => entries,
                    Err(e) => return Ok(e.raw()),
                };
                // dirent: d_next u64, d_ino u64, d_namlen u32, d_type u8, pad x3, name.
                let mut buf = Vec::new();
                let cap = buf_len as u32 as usize;
                for entry in entries {
                    let mut dirent = [0u8; 24];
                    dirent[0..8].copy_from_slice(&entry.next.to_le_bytes());
                    dirent[8..16].copy_from_slice(&entry.ino.to_le_bytes());
                    dirent[16..20].copy_from_slice(&(entry.name.len() as u32).to_le_bytes());
                    dirent[20] = entry.filetype;
                    buf.extend_from_slice(&dirent);
                    buf.extend_from_slice(entry.name.as_bytes());
                    if buf.len() >= cap {
                        buf.truncate(cap);
                        break;
                    }
                }
                write_bytes(&memory, &mut caller, buf_ptr, &buf)?;
                write_u32(&memory, &mut caller, bufused_ptr, buf.len() as u32)?;
                Ok(Errno::Success.raw())
            })
        },
    )?;

    linker.func_wrap9_async(
        WASI_MODULE,
        "path_open",
        |mut caller: Caller<'_, GuestState>, dirfd: i32, _dirflags: i32, path_ptr: i32, path_len: i32, oflags: i32, _rights: i64, _rights_inh: i64, fdflags: i32, opened_ptr: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                let memory = guest_memory(&mut caller)?;
                let path = read_str(&memory, &caller, path_ptr, path_len)?;
                let opened = caller.data_mut().wasi.path_open(
                    dirfd as u32,
                    &path,
                    oflags as u32,
                    fdflags as u32,
                );
                match opened {
                    Ok(fd) => {
                        write_u32(&memory, &mut caller, opened_ptr, fd)?;
                        Ok(Errno::Success.raw())
                    }
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap3_async(
        WASI_MODULE,
        "path_create_directory",
        |mut caller: Caller<'_, GuestState>, dirfd: i32, path_ptr: i32, path_len: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let path = read_str(&memory, &caller, path_ptr, path_len)?;
                match caller.data().wasi.path_create_directory(dirfd as u32, &path) {
                    Ok(()) => Ok(Errno::Success.raw()),
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap3_async(
        WASI_MODULE,
        "path_remove_directory",
        |mut caller: Caller<'_, GuestState>, dirfd: i32, path_ptr: i32, path_len: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let path = read_str(&memory, &caller, path_ptr, path_len)?;
                match caller.data().wasi.path_remove_directory(dirfd as u32, &path) {
                    Ok(()) => Ok(Errno::Success.raw()),
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap3_async(
        WASI_MODULE,
        "path_unlink_file",
        |mut caller: Caller<'_, GuestState>, dirfd: i32, path_ptr: i32, path_len: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let path = read_str(&memory, &caller, path_ptr, path_len)?;
                match caller.data().wasi.path_unlink_file(dirfd as u32, &path) {
                    Ok(()) => Ok(Errno::Success.raw()),
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap5_async(
        WASI_MODULE,
        "path_filestat_get",
        |mut caller: Caller<'_, GuestState>, dirfd: i32, _flags: i32, path_ptr: i32, path_len: i32, out_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let path = read_str(&memory, &caller, path_ptr, path_len)?;
                match caller.data().wasi.path_filestat(dirfd as u32, &path) {
                    Ok(stat) => {
                        write_bytes(&memory, &mut caller, out_ptr, &encode_filestat(&stat))?;
                        Ok(Errno::Success.raw())
                    }
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap6_async(
        WASI_MODULE,
        "path_readlink",
        |mut caller: Caller<'_, GuestState>, dirfd: i32, path_ptr: i32, path_len: i32, buf_ptr: i32, buf_len: i32, bufused_ptr: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let path = read_str(&memory, &caller, path_ptr, path_len)?;
                match caller.data().wasi.path_readlink(dirfd as u32, &path) {
                    Ok(target) => {
                        let n = target.len().min(buf_len as u32 as usize);
                        write_bytes(&memory, &mut caller, buf_ptr, &target.as_bytes()[..n])?;
                        write_u32(&memory, &mut caller, bufused_ptr, n as u32)?;
                        Ok(Errno::Success.raw())
                    }
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap6_async(
        WASI_MODULE,
        "path_rename",
        |mut caller: Caller<'_, GuestState>, old_fd: i32, old_ptr: i32, old_len: i32, new_fd: i32, new_ptr: i32, new_len: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let old = read_str(&memory, &caller, old_ptr, old_len)?;
                let new = read_str(&memory, &caller, new_ptr, new_len)?;
                match caller
                    .data()
                    .wasi
                    .path_rename(old_fd as u32, &old, new_fd as u32, &new)
                {
                    Ok(()) => Ok(Errno::Success.raw()),
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap5_async(
        WASI_MODULE,
        "path_symlink",
        |mut caller: Caller<'_, GuestState>, target_ptr: i32, target_len: i32, dirfd: i32, link_ptr: i32, link_len: i32| {
            Box::new(async move {
                let memory = guest_memory(&mut caller)?;
                let target = read_str(&memory, &caller, target_ptr, target_len)?;
                let link = read_str(&memory, &caller, link_ptr, link_len)?;
                match caller.data().wasi.path_symlink(&target, dirfd as u32, &link) {
                    Ok(()) => Ok(Errno::Success.raw()),
                    Err(e) => Ok(e.raw()),
                }
            })
        },
    )?;

    linker.func_wrap4_async(
        WASI_MODULE,
        "poll_oneoff",
        |mut caller: Caller<'_, GuestState>, in_ptr: i32, out_ptr: i32, nsubs: i32, nevents_ptr: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                let memory = guest_memory(&mut caller)?;
                let raw = read_bytes(&memory, &caller, in_ptr, nsubs.saturating_mul(48))?;

                // subscription: userdata u64 @0, tag u8 @8; clock payload:
                // timeout u64 @24, flags u16 @40 (bit 0 = absolute).
                let mut events: Vec<(u64, u8)> = Vec::new();
                let mut sleep_nanos: Option<u64> = None;
                let mut clock_subs: Vec<u64> = Vec::new();
                let now = caller.data().wasi.clock.monotonic_nanos();
                for sub in raw.chunks_exact(48) {
                    let userdata = u64::from_le_bytes(sub[0..8].try_into().expect("8 bytes"));
                    let tag = sub[8];
                    if tag == 0 {
                        let timeout = u64::from_le_bytes(sub[24..32].try_into().expect("8 bytes"));
                        let flags = u16::from_le_bytes(sub[40..42].try_into().expect("2 bytes"));
                        let relative = if flags & 1 != 0 {
                            timeout.saturating_sub(now)
                        } else {
                            timeout
                        };
                        sleep_nanos = Some(sleep_nanos.map_or(relative, |s| s.min(relative)));
                        clock_subs.push(userdata);
                    } else {
                        // fd readiness is reported immediately; fd ops
                        // themselves provide the back-pressure.
                        events.push((userdata, tag));
                    }
                }

                if events.is_empty() {
                    if let Some(nanos) = sleep_nanos {
                        sleep_cancellable(&caller, nanos).await;
                    }
                    for userdata in clock_subs {
                        events.push((userdata, 0));
                    }
                }

                // event: userdata u64 @0, errno u16 @8, type u8 @10, 32 bytes.
                let mut buf = Vec::with_capacity(events.len() * 32);
                for (userdata, kind) in &events {
                    let mut event = [0u8; 32];
                    event[0..8].copy_from_slice(&userdata.to_le_bytes());
                    event[10] = *kind;
                    buf.extend_from_slice(&event);
                }
                write_bytes(&memory, &mut caller, out_ptr, &buf)?;
                write_u32(&memory, &mut caller, nevents_ptr, events.len() as u32)?;
                Ok(Errno::Success.raw())
            })
        },
    )?;

    linker.func_wrap0_async(
        WASI_MODULE,
        "sched_yield",
        |_caller: Caller<'_, GuestState>| {
            Box::new(async move {
                tokio::task::yield_now().await;
                Ok(Errno::Success.raw())
            })
        },
    )?;

    // Durability and advice hints have nothing to act on in a purely
    // in-memory tree.
    linker.func_wrap1_async(
        WASI_MODULE,
        "fd_sync",
        |_caller: Caller<'_, GuestState>, _fd: i32| {
            Box::new(async move { Ok(Errno::Success.raw()) })
        },
    )?;

    linker.func_wrap1_async(
        WASI_MODULE,
        "fd_datasync",
        |_caller: Caller<'_, GuestState>, _fd: i32| {
            Box::new(async move { Ok(Errno::Success.raw()) })
        },
    )?;

    linker.func_wrap4_async(
        WASI_MODULE,
        "fd_advise",
        |_caller: Caller<'_, GuestState>, _fd: i32, _offset: i64, _len: i64, _advice: i32| {
            Box::new(async move { Ok(Errno::Success.raw()) })
        },
    )?;

    linker.func_wrap1_async(
        WASI_MODULE,
        "proc_raise",
        |mut caller: Caller<'_, GuestState>, signal: i32| {
            Box::new(async move {
                let code = 128 + signal;
                caller.data_mut().wasi.proc_exit(code);
                Err::<(), anyhow::Error>(anyhow::Error::new(ProcExit(code)))
            })
        },
    )?;

    linker.func_wrap1_async(
        WASI_MODULE,
        "proc_exit",
        |mut caller: Caller<'_, GuestState>, code: i32| {
            Box::new(async move {
                caller.data_mut().wasi.proc_exit(code);
                Err::<(), anyhow::Error>(anyhow::Error::new(ProcExit(code)))
            })
        },
    )?;

    Ok(())
}

/// Encode a WASI filestat (64 bytes).
fn encode_filestat(stat: &crate::wasi::FilestatWire) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[16] = stat.filetype;
    out[24..32].copy_from_slice(&1u64.to_le_bytes()); // nlink
    out[32..40].copy_from_slice(&stat.size.to_le_bytes());
    out[40..48].copy_from_slice(&stat.atim.to_le_bytes());
    out[48..56].copy_from_slice(&stat.mtim.to_le_bytes());
    out[56..64].copy_from_slice(&stat.ctim.to_le_bytes());
    out
}

/// Sleep in short slices so a fired cancel token cuts the wait short.
async fn sleep_cancellable(caller: &Caller<'_, GuestState>, nanos: u64) {
    let cancel = caller.data().wasi.cancel.clone();
    let mut remaining = Duration::from_nanos(nanos);
    const SLICE: Duration = Duration::from_millis(50);
    while !remaining.is_zero() {
        if cancel.is_fired() {
            return;
        }
        let step = remaining.min(SLICE);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}

// ─── wasmbox host-ABI ──────────────────────────────────────────

/// Register the capability-scoped `wasmbox` namespace.
#[allow(clippy::too_many_lines)]
pub fn add_host_abi(linker: &mut Linker<GuestState>) -> anyhow::Result<()> {
    linker.func_wrap1_async(
        ABI_MODULE,
        "pipe",
        |mut caller: Caller<'_, GuestState>, out_ptr: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                if let Err(e) = require(&caller, Caps::PROC) {
                    return Ok(e.negative());
                }
                let memory = guest_memory(&mut caller)?;
                let (kernel, pid) = {
                    let state = caller.data();
                    (state.wasi.kernel.clone(), state.wasi.pid)
                };
                match kernel.create_pipe(pid) {
                    Ok((read_fd, write_fd)) => {
                        write_u32(&memory, &mut caller, out_ptr, read_fd)?;
                        write_u32(&memory, &mut caller, out_ptr + 4, write_fd)?;
                        Ok(0i64)
                    }
                    Err(e) => Ok(Errno::from(e).negative()),
                }
            })
        },
    )?;

    linker.func_wrap2_async(
        ABI_MODULE,
        "spawn",
        |mut caller: Caller<'_, GuestState>, req_ptr: i32, req_len: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                if let Err(e) = require(&caller, Caps::PROC) {
                    return Ok(e.negative());
                }
                let memory = guest_memory(&mut caller)?;
                let json = read_str(&memory, &caller, req_ptr, req_len)?;
                let Ok(spec) = serde_json::from_str::<SpawnSpec>(&json) else {
                    return Ok(Errno::Inval.negative());
                };
                let (host, pid, cancel) = {
                    let state = caller.data();
                    (
                        state.host.clone(),
                        state.wasi.pid,
                        state.wasi.cancel.clone(),
                    )
                };
                match spawn_tool(&host, pid, cancel, spec) {
                    Ok(child) => Ok(child.0 as i64),
                    Err(e) => Ok(e.negative()),
                }
            })
        },
    )?;

    linker.func_wrap1_async(
        ABI_MODULE,
        "waitpid",
        |caller: Caller<'_, GuestState>, pid: i64| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                if let Err(e) = require(&caller, Caps::PROC) {
                    return Ok(e.negative());
                }
                let (kernel, cancel) = {
                    let state = caller.data();
                    (state.wasi.kernel.clone(), state.wasi.cancel.clone())
                };
                match kernel.waitpid(Pid(pid as u64)).await {
                    Ok(code) => Ok(code as i64),
                    Err(KernelError::Cancelled) => {
                        let code = cancel
                            .check()
                            .err()
                            .map_or(kernel::EXIT_CANCELLED, |r| r.exit_code());
                        Ok(code as i64)
                    }
                    Err(e) => Ok(Errno::from(e).negative()),
                }
            })
        },
    )?;

    linker.func_wrap1_async(
        ABI_MODULE,
        "close_fd",
        |caller: Caller<'_, GuestState>, fd: i32| {
            Box::new(async move {
                if let Err(e) = require(&caller, Caps::PROC) {
                    return Ok(-e.raw());
                }
                let (kernel, pid) = {
                    let state = caller.data();
                    (state.wasi.kernel.clone(), state.wasi.pid)
                };
                match kernel.close_fd(pid, fd as u32) {
                    Ok(()) => Ok(0i32),
                    Err(e) => Ok(-Errno::from(e).raw()),
                }
            })
        },
    )?;

    linker.func_wrap2_async(
        ABI_MODULE,
        "has_tool",
        |mut caller: Caller<'_, GuestState>, name_ptr: i32, name_len: i32| {
            Box::new(async move {
                if let Err(e) = require(&caller, Caps::PROC) {
                    return Ok(-e.raw());
                }
                let memory = guest_memory(&mut caller)?;
                let name = read_str(&memory, &caller, name_ptr, name_len)?;
                Ok(i32::from(caller.data().host.registry.is_available(&name)))
            })
        },
    )?;

    linker.func_wrap0_async(
        ABI_MODULE,
        "check_cancel",
        |caller: Caller<'_, GuestState>| {
            Box::new(async move {
                if let Err(e) = require(&caller, Caps::TIME) {
                    return Ok(-e.raw());
                }
                Ok(caller.data().wasi.cancel.status().as_code())
            })
        },
    )?;

    linker.func_wrap0_async(
        ABI_MODULE,
        "time_ms",
        |caller: Caller<'_, GuestState>| {
            Box::new(async move {
                if let Err(e) = require(&caller, Caps::TIME) {
                    return Ok(e.negative());
                }
                Ok(caller.data().wasi.clock.monotonic_ms() as i64)
            })
        },
    )?;

    linker.func_wrap4_async(
        ABI_MODULE,
        "stat",
        |mut caller: Caller<'_, GuestState>, path_ptr: i32, path_len: i32, out_ptr: i32, out_cap: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                if let Err(e) = require(&caller, Caps::FS) {
                    return Ok(e.negative());
                }
                let memory = guest_memory(&mut caller)?;
                let path = read_str(&memory, &caller, path_ptr, path_len)?;
                let stat = { caller.data().host.vfs.lock().stat(&path) };
                match stat {
                    Ok(stat) => {
                        let payload = serde_json::json!({
                            "kind": stat.kind.as_str(),
                            "size": stat.size,
                            "permissions": stat.permissions,
                            "mtime": stat.mtime,
                        });
                        write_out(&memory, &mut caller, out_ptr, out_cap, payload.to_string().as_bytes())
                    }
                    Err(e) => Ok(Errno::from(e).negative()),
                }
            })
        },
    )?;

    linker.func_wrap4_async(
        ABI_MODULE,
        "read_file",
        |mut caller: Caller<'_, GuestState>, path_ptr: i32, path_len: i32, out_ptr: i32, out_cap: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                if let Err(e) = require(&caller, Caps::FS) {
                    return Ok(e.negative());
                }
                let memory = guest_memory(&mut caller)?;
                let path = read_str(&memory, &caller, path_ptr, path_len)?;
                let result = { caller.data().host.vfs.lock().read_file(&path) };
                match result {
                    Ok(bytes) => write_out(&memory, &mut caller, out_ptr, out_cap, &bytes),
                    Err(e) => Ok(Errno::from(e).negative()),
                }
            })
        },
    )?;

    linker.func_wrap4_async(
        ABI_MODULE,
        "write_file",
        |mut caller: Caller<'_, GuestState>, path_ptr: i32, path_len: i32, data_ptr: i32, data_len: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                if let Err(e) = require(&caller, Caps::FS) {
                    return Ok(-e.raw());
                }
                let memory = guest_memory(&mut caller)?;
                let path = read_str(&memory, &caller, path_ptr, path_len)?;
                let data = read_bytes(&memory, &caller, data_ptr, data_len)?;
                let result = { caller.data().host.vfs.lock().write_file(&path, &data) };
                match result {
                    Ok(()) => Ok(0i32),
                    Err(e) => Ok(-Errno::from(e).raw()),
                }
            })
        },
    )?;

    linker.func_wrap4_async(
        ABI_MODULE,
        "readdir",
        |mut caller: Caller<'_, GuestState>, path_ptr: i32, path_len: i32, out_ptr: i32, out_cap: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                if let Err(e) = require(&caller, Caps::FS) {
                    return Ok(e.negative());
                }
                let memory = guest_memory(&mut caller)?;
                let path = read_str(&memory, &caller, path_ptr, path_len)?;
                let result = { caller.data().host.vfs.lock().read_dir(&path) };
                match result {
                    Ok(entries) => {
                        let wire: Vec<serde_json::Value> = entries
                            .iter()
                            .map(|e| {
                                serde_json::json!({
                                    "name": e.name,
                                    "kind": e.kind.as_str(),
                                })
                            })
                            .collect();
                        let payload = serde_json::Value::Array(wire).to_string();
                        write_out(&memory, &mut caller, out_ptr, out_cap, payload.as_bytes())
                    }
                    Err(e) => Ok(Errno::from(e).negative()),
                }
            })
        },
    )?;

    linker.func_wrap4_async(
        ABI_MODULE,
        "glob",
        |mut caller: Caller<'_, GuestState>, pat_ptr: i32, pat_len: i32, out_ptr: i32, out_cap: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                if let Err(e) = require(&caller, Caps::FS) {
                    return Ok(e.negative());
                }
                let memory = guest_memory(&mut caller)?;
                let mut pattern = read_str(&memory, &caller, pat_ptr, pat_len)?;
                if !pattern.starts_with('/') {
                    let cwd = caller.data().wasi.cwd.clone();
                    pattern = format!("{cwd}/{pattern}");
                }
                let matches = {
                    let vfs = caller.data().host.vfs.lock();
                    storage::glob::expand(&vfs, &pattern)
                };
                let payload = serde_json::to_string(&matches).expect("paths serialize");
                write_out(&memory, &mut caller, out_ptr, out_cap, payload.as_bytes())
            })
        },
    )?;

    linker.func_wrap4_async(
        ABI_MODULE,
        "network_fetch",
        |mut caller: Caller<'_, GuestState>, req_ptr: i32, req_len: i32, out_ptr: i32, out_cap: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                if let Err(e) = require(&caller, Caps::NET) {
                    return Ok(e.negative());
                }
                let memory = guest_memory(&mut caller)?;
                let json = read_str(&memory, &caller, req_ptr, req_len)?;
                let Ok(request) = serde_json::from_str::<FetchRequest>(&json) else {
                    return Ok(Errno::Inval.negative());
                };
                let bridge = caller.data().host.bridge.clone();
                let response = bridge.fetch(request).await;
                let payload = serde_json::to_string(&response).expect("response serializes");
                write_out(&memory, &mut caller, out_ptr, out_cap, payload.as_bytes())
            })
        },
    )?;

    linker.func_wrap6_async(
        ABI_MODULE,
        "extension_invoke",
        |mut caller: Caller<'_, GuestState>, name_ptr: i32, name_len: i32, payload_ptr: i32, payload_len: i32, out_ptr: i32, out_cap: i32| {
            Box::new(async move {
                check_cancel_entry(&caller)?;
                if let Err(e) = require(&caller, Caps::EXT) {
                    return Ok(e.negative());
                }
                let memory = guest_memory(&mut caller)?;
                let name = read_str(&memory, &caller, name_ptr, name_len)?;
                let payload = read_str(&memory, &caller, payload_ptr, payload_len)?;
                let outcome = caller.data().host.extensions.invoke(&name, &payload);
                // Policy violations become an error field, not a trap.
                let wire = match outcome {
                    Ok(result) => serde_json::json!({ "result": result }),
                    Err(error) => serde_json::json!({ "error": error }),
                };
                write_out(&memory, &mut caller, out_ptr, out_cap, wire.to_string().as_bytes())
            })
        },
    )?;

    linker.func_wrap2_async(
        ABI_MODULE,
        "read_command",
        |mut caller: Caller<'_, GuestState>, out_ptr: i32, out_cap: i32| {
            Box::new(async move {
                if let Err(e) = require(&caller, Caps::SHELL) {
                    return Ok(e.negative());
                }
                let Some(endpoint) = caller.data().host.shell.clone() else {
                    return Ok(Errno::NotCapable.negative());
                };
                let memory = guest_memory(&mut caller)?;
                match endpoint.next_command_json().await {
                    Some(json) => {
                        if json.len() > out_cap as u32 as usize {
                            let required = json.len() as i64;
                            endpoint.stash(json);
                            return Ok(required);
                        }
                        write_out(&memory, &mut caller, out_ptr, out_cap, json.as_bytes())
                    }
                    // Driver gone: the shell's loop is over.
                    None => Err(anyhow::Error::new(ProcExit(0))),
                }
            })
        },
    )?;

    linker.func_wrap2_async(
        ABI_MODULE,
        "write_result",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| {
            Box::new(async move {
                if let Err(e) = require(&caller, Caps::SHELL) {
                    return Ok(-e.raw());
                }
                let Some(endpoint) = caller.data().host.shell.clone() else {
                    return Ok(-Errno::NotCapable.raw());
                };
                let memory = guest_memory(&mut caller)?;
                let json = read_str(&memory, &caller, ptr, len)?;
                let Ok(reply) = serde_json::from_str::<ShellReply>(&json) else {
                    return Ok(-Errno::Inval.raw());
                };
                if !endpoint.deliver_result(reply) {
                    log::debug!("write_result with no pending command (stale result dropped)");
                }
                Ok(0i32)
            })
        },
    )?;

    Ok(())
}
