// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

//! What the read and write interception points do, independent of how they are
//! attached. The eBPF programs feed these with probe helpers; tests feed them with
//! simulated process memory.

use crate::{
    transform::{transform_user, Direction, UserMemory, TRANSFORM_WINDOW},
    ControlState, EventStatus, Operation, PendingTransfer, TransformEvent, EFAULT,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller {
    /// Thread group id, the process id as seen from userspace.
    pub pid: u32,
    pub tid: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry {
    /// Not our target, let the call through untouched.
    Passthrough,
    /// The call is ours; it has to be tracked until its exit.
    Track(PendingTransfer),
    /// The call must fail with `-errno` instead of reaching the original handler.
    Reject { errno: i64, event: TransformEvent },
}

#[inline(always)]
fn pending(caller: Caller, op: Operation, fd: i32, buf: u64, count: u64) -> PendingTransfer {
    PendingTransfer {
        pid: caller.pid,
        tid: caller.tid,
        fd,
        op: op as u8,
        _pad: [0; 3],
        buf,
        count,
    }
}

#[inline(always)]
fn event(pending: &PendingTransfer, status: EventStatus, actual: i64, transformed: usize) -> TransformEvent {
    TransformEvent {
        pid: pending.pid,
        tid: pending.tid,
        fd: pending.fd,
        op: pending.op,
        status: status as u8,
        _pad: [0; 2],
        requested: pending.count,
        actual,
        transformed: transformed as u64,
    }
}

#[inline(always)]
fn enter(
    control: ControlState,
    caller: Caller,
    op: Operation,
    fd: i32,
    buf: u64,
    count: u64,
) -> Entry {
    if !control.matches(caller.pid, fd) {
        return Entry::Passthrough;
    }

    let pending = pending(caller, op, fd, buf, count);

    // Anything past the window could not be transformed, so the call never runs.
    if count > TRANSFORM_WINDOW as u64 {
        return untracked(&pending);
    }

    Entry::Track(pending)
}

/// Decides whether a read must be decoded once it returns.
#[inline(always)]
pub fn read_enter(control: ControlState, caller: Caller, fd: i32, buf: u64, count: u64) -> Entry {
    enter(control, caller, Operation::Read, fd, buf, count)
}

/// Decides whether a write must be encoded before it runs. Nothing is touched yet:
/// the transfer has to be tracked first, then [`encode_write`] does the encoding.
#[inline(always)]
pub fn write_enter(control: ControlState, caller: Caller, fd: i32, buf: u64, count: u64) -> Entry {
    enter(control, caller, Operation::Write, fd, buf, count)
}

/// The rejection for a matched call that cannot be tracked until its exit.
#[inline(always)]
pub fn untracked(pending: &PendingTransfer) -> Entry {
    Entry::Reject {
        errno: EFAULT,
        event: event(pending, EventStatus::Fault, -EFAULT, 0),
    }
}

/// Encodes the caller's buffer of a tracked write.
///
/// On a fault the call has to be rejected with the returned event, and `pending`
/// is narrowed to the prefix that was encoded so [`write_exit`] restores exactly
/// that.
#[inline(always)]
pub fn encode_write<M: UserMemory>(
    memory: &mut M,
    pending: &mut PendingTransfer,
) -> Option<TransformEvent> {
    match transform_user(memory, pending.buf, pending.count as usize, Direction::Encode) {
        Ok(()) => None,
        Err(fault) => {
            let transformed = fault.transformed();
            let event = event(pending, EventStatus::Fault, -EFAULT, transformed);
            pending.count = transformed as u64;
            Some(event)
        }
    }
}

/// Decodes exactly the bytes the original read produced. The return value of the
/// call cannot be altered from here: a fault leaves the tail of the buffer as the
/// descriptor delivered it and is reported through the event.
#[inline(always)]
pub fn read_exit<M: UserMemory>(
    memory: &mut M,
    pending: &PendingTransfer,
    bytes_read: i64,
) -> Option<TransformEvent> {
    if bytes_read <= 0 {
        return None;
    }

    match transform_user(memory, pending.buf, bytes_read as usize, Direction::Decode) {
        Ok(()) => Some(event(pending, EventStatus::Ok, bytes_read, bytes_read as usize)),
        Err(fault) => Some(event(pending, EventStatus::Fault, bytes_read, fault.transformed())),
    }
}

/// Restores the caller's plaintext after the original write returned.
///
/// The restore happens whatever the outcome of the write, so the caller never keeps
/// an encoded buffer; a log entry is only produced for writes that moved data.
#[inline(always)]
pub fn write_exit<M: UserMemory>(
    memory: &mut M,
    pending: &PendingTransfer,
    bytes_written: i64,
) -> Option<TransformEvent> {
    match transform_user(memory, pending.buf, pending.count as usize, Direction::Decode) {
        Ok(()) if bytes_written > 0 => Some(event(
            pending,
            EventStatus::Ok,
            bytes_written,
            pending.count as usize,
        )),
        Ok(()) => None,
        Err(fault) => Some(event(
            pending,
            EventStatus::Fault,
            bytes_written,
            fault.transformed(),
        )),
    }
}
