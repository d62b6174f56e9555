// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

#![no_std]
#![no_main]
#![allow(non_snake_case, non_upper_case_globals, static_mut_refs)]

use core::{ffi::c_void, ops::DerefMut as _};

use aya_ebpf::{
    bindings::BPF_RB_FORCE_WAKEUP,
    helpers::{
        bpf_probe_read_kernel, bpf_probe_read_user_buf,
        gen::{bpf_override_return, bpf_probe_write_user},
    },
    macros::{kprobe, map, tracepoint},
    maps::{Array, HashMap, RingBuf},
    programs::{ProbeContext, TracePointContext},
    EbpfContext,
};
use aya_log_ebpf::{error, warn};
use kci_common::{
    shim::{self, Caller, Entry},
    syscalls::SYSCALL_ARG_OFFSETS,
    transform::{Chunk, UserMemory, TRANSFORM_CHUNK},
    ControlState, EventStatus, Operation, PendingTransfer, TransformEvent, EFAULT,
};

/// Set by the loader: whether the probed handlers take a `struct pt_regs *` (the
/// `__<arch>_sys_*` wrappers) or their arguments directly.
#[no_mangle]
static SYSCALL_WRAPPER: u8 = 1;

// Single packed ControlState word, see ControlState::to_word().
#[map]
static mut CONTROL: Array<u64> = Array::with_max_entries(1, 0);

// Matched calls between entry and exit, keyed by tid.
#[map]
static mut PENDING: HashMap<u32, PendingTransfer> = HashMap::with_max_entries(10240, 0);

#[map]
static mut EVENTS: RingBuf = RingBuf::with_byte_size(256 * 1024, 0);

struct ProbeMemory;

impl UserMemory for ProbeMemory {
    #[inline(always)]
    fn read(&mut self, addr: u64, chunk: &mut Chunk, len: usize) -> Result<(), ()> {
        let len = core::cmp::min(len, TRANSFORM_CHUNK);
        if len == 0 {
            return Ok(());
        }

        unsafe { bpf_probe_read_user_buf(addr as *const u8, &mut chunk.0[..len]) }.map_err(|_| ())
    }

    #[inline(always)]
    fn write(&mut self, addr: u64, chunk: &Chunk, len: usize) -> Result<(), ()> {
        let len = core::cmp::min(len, TRANSFORM_CHUNK);
        if len == 0 {
            return Ok(());
        }

        let ret = unsafe {
            bpf_probe_write_user(
                addr as *mut c_void,
                chunk.0.as_ptr() as *const c_void,
                len as u32,
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(())
        }
    }
}

#[inline(always)]
fn control() -> ControlState {
    let word = unsafe { CONTROL.get(0) }
        .map(|word| unsafe { core::ptr::read_volatile(word) })
        .unwrap_or(ControlState::UNSET.to_word());

    ControlState::from_word(word)
}

#[inline(always)]
fn uses_wrapper() -> bool {
    unsafe { core::ptr::read_volatile(&SYSCALL_WRAPPER) != 0 }
}

/// The (fd, buf, count) arguments of the probed read/write handler.
#[inline(always)]
fn syscall_args(ctx: &ProbeContext) -> Result<[u64; 3], u32> {
    if !uses_wrapper() {
        return Ok([
            ctx.arg::<u64>(0).ok_or(1u32)?,
            ctx.arg::<u64>(1).ok_or(1u32)?,
            ctx.arg::<u64>(2).ok_or(1u32)?,
        ]);
    }

    let regs: *const u8 = ctx.arg(0).ok_or(1u32)?;
    let mut args = [0u64; 3];
    for (arg, offset) in args.iter_mut().zip(SYSCALL_ARG_OFFSETS) {
        *arg = unsafe { bpf_probe_read_kernel(regs.wrapping_add(offset) as *const u64) }
            .map_err(|_| 1u32)?;
    }

    Ok(args)
}

#[inline(always)]
fn caller<C: EbpfContext>(ctx: &C) -> Caller {
    Caller {
        pid: ctx.tgid(),
        tid: ctx.pid(),
    }
}

#[inline(always)]
fn emit<C: EbpfContext>(ctx: &C, event: &TransformEvent) {
    match unsafe { EVENTS.reserve::<TransformEvent>(0) } {
        Some(mut entry) => {
            entry.deref_mut().write(*event);
            entry.submit(BPF_RB_FORCE_WAKEUP.into());
        }
        None => {
            error!(
                ctx,
                "Failed to reserve ringbuf entry for fd {} (tid {})", event.fd, event.tid
            );
        }
    }
}

/// Takes the pending transfer of the current thread, if it has one for `op`.
#[inline(always)]
fn take_pending(ctx: &TracePointContext, op: Operation) -> Result<Option<PendingTransfer>, u32> {
    let tid = ctx.pid();

    let Some(pending) = (unsafe { PENDING.get(&tid) }).copied() else {
        return Ok(None);
    };

    let _ = unsafe { PENDING.remove(&tid) };

    if pending.op != op as u8 {
        error!(
            ctx,
            "Expected pending op {} found op {} (tid {})", op as u8, pending.op, tid
        );
        return Err(1);
    }

    Ok(Some(pending))
}

// /sys/kernel/tracing/events/syscalls/sys_exit_read/format
//
// 	field:int __syscall_nr;	offset:8;	size:4;	signed:1;
// 	field:long ret;	offset:16;	size:8;	signed:1;
const SYSCALL_RETURN_OFFSET: usize = 16;

#[inline(always)]
fn get_return_value(ctx: &TracePointContext) -> Result<i64, u32> {
    unsafe { ctx.read_at::<i64>(SYSCALL_RETURN_OFFSET) }.map_err(|_| 1u32)
}

/// Fails the probed call with `-errno` before the original handler runs.
#[inline(always)]
fn reject(ctx: &ProbeContext, errno: i64, event: &TransformEvent) {
    emit(ctx, event);
    unsafe { bpf_override_return(ctx.regs, (-errno) as u64) };
}

/// Records `pending` for the exit program. A call that cannot be tracked is
/// rejected, so it never runs with a buffer nobody transforms.
#[inline(always)]
fn track(ctx: &ProbeContext, pending: &PendingTransfer) -> Result<(), u32> {
    match unsafe { PENDING.insert(&pending.tid, pending, 0) } {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(
                ctx,
                "Failed to track call on fd {} (tid {}). Error code: {}",
                pending.fd,
                pending.tid,
                err
            );
            if let Entry::Reject { errno, event } = shim::untracked(pending) {
                reject(ctx, errno, &event);
            }
            Err(err as u32)
        }
    }
}

#[kprobe]
pub fn kci_read_enter(ctx: ProbeContext) -> u32 {
    fn inner(ctx: &ProbeContext) -> Result<(), u32> {
        let control = control();
        let caller = caller(ctx);

        if !control.targets_process(caller.pid) {
            return Ok(());
        }

        let [fd, buf, count] = syscall_args(ctx)?;

        match shim::read_enter(control, caller, fd as i32, buf, count) {
            Entry::Passthrough => Ok(()),
            Entry::Track(pending) => track(ctx, &pending),
            Entry::Reject { errno, event } => {
                warn!(ctx, "Rejecting read of {} bytes on fd {}", count, fd);
                reject(ctx, errno, &event);
                Ok(())
            }
        }
    }
    match inner(&ctx) {
        Ok(()) => 0,
        Err(ret) => ret,
    }
}

#[tracepoint]
pub fn kci_read_exit(ctx: TracePointContext) -> u32 {
    fn inner(ctx: &TracePointContext) -> Result<(), u32> {
        let Some(pending) = take_pending(ctx, Operation::Read)? else {
            return Ok(());
        };

        let bytes_read = get_return_value(ctx)?;

        if let Some(event) = shim::read_exit(&mut ProbeMemory, &pending, bytes_read) {
            if event.status == EventStatus::Fault as u8 {
                warn!(
                    ctx,
                    "Decoding read on fd {} faulted after {} bytes", pending.fd, event.transformed
                );
            }
            emit(ctx, &event);
        }

        Ok(())
    }
    match inner(&ctx) {
        Ok(()) => 0,
        Err(ret) => ret,
    }
}

#[kprobe]
pub fn kci_write_enter(ctx: ProbeContext) -> u32 {
    fn inner(ctx: &ProbeContext) -> Result<(), u32> {
        let control = control();
        let caller = caller(ctx);

        if !control.targets_process(caller.pid) {
            return Ok(());
        }

        let [fd, buf, count] = syscall_args(ctx)?;

        let pending = match shim::write_enter(control, caller, fd as i32, buf, count) {
            Entry::Passthrough => return Ok(()),
            Entry::Track(pending) => pending,
            Entry::Reject { errno, event } => {
                warn!(ctx, "Rejecting write of {} bytes on fd {}", count, fd);
                reject(ctx, errno, &event);
                return Ok(());
            }
        };

        // Tracked before the buffer is touched: from here on the exit program
        // restores whatever the record says is encoded.
        track(ctx, &pending)?;
        let Some(tracked) = (unsafe { PENDING.get_ptr_mut(&caller.tid) }) else {
            error!(ctx, "Tracked write vanished (tid {})", caller.tid);
            return Err(1);
        };

        if let Some(event) = shim::encode_write(&mut ProbeMemory, unsafe { &mut *tracked }) {
            warn!(
                ctx,
                "Rejecting write on fd {} (tid {}), encoding faulted after {} bytes",
                fd,
                caller.tid,
                event.transformed
            );
            reject(ctx, EFAULT, &event);
        }

        Ok(())
    }
    match inner(&ctx) {
        Ok(()) => 0,
        Err(ret) => ret,
    }
}

#[tracepoint]
pub fn kci_write_exit(ctx: TracePointContext) -> u32 {
    fn inner(ctx: &TracePointContext) -> Result<(), u32> {
        let Some(pending) = take_pending(ctx, Operation::Write)? else {
            return Ok(());
        };

        let bytes_written = get_return_value(ctx)?;

        if let Some(event) = shim::write_exit(&mut ProbeMemory, &pending, bytes_written) {
            if event.status == EventStatus::Fault as u8 {
                error!(
                    ctx,
                    "Restoring write buffer on fd {} faulted after {} bytes",
                    pending.fd,
                    event.transformed
                );
            }
            emit(ctx, &event);
        }

        Ok(())
    }
    match inner(&ctx) {
        Ok(()) => 0,
        Err(ret) => ret,
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
