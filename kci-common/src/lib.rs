// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

#![no_std]

pub mod shim;
pub mod syscalls;
pub mod transform;

/// Sentinel for a target pid or fd that has not been configured.
pub const UNSET: i32 = -1;

pub const EFAULT: i64 = 14;

/// Size of the activity log buffer, in bytes.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// Well-known D-Bus name and object path of the control channel.
pub const SERVICE_NAME: &str = "org.kci.Service";
pub const SERVICE_PATH: &str = "/org/kci/Service";

/// Major number the control device historically lived under; it is also the ioctl type.
pub const CONTROL_MAGIC: u32 = 245;

const IOC_WRITE: u32 = 1;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;

const fn iow(ty: u32, nr: u32, size: u32) -> u32 {
    (IOC_WRITE << IOC_DIRSHIFT) | (size << IOC_SIZESHIFT) | (ty << IOC_TYPESHIFT) | (nr << IOC_NRSHIFT)
}

// _IOW(MAJOR_NUM, n, unsigned long)
pub const IOCTL_SET_PID: u32 = iow(CONTROL_MAGIC, 0, 8);
pub const IOCTL_SET_FD: u32 = iow(CONTROL_MAGIC, 1, 8);
pub const IOCTL_CIPHER: u32 = iow(CONTROL_MAGIC, 2, 8);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    SetPid,
    SetFd,
    Cipher,
}

impl ControlCommand {
    pub fn from_request(request: u32) -> Option<Self> {
        match request {
            IOCTL_SET_PID => Some(ControlCommand::SetPid),
            IOCTL_SET_FD => Some(ControlCommand::SetFd),
            IOCTL_CIPHER => Some(ControlCommand::Cipher),
            _ => None,
        }
    }

    pub fn request(self) -> u32 {
        match self {
            ControlCommand::SetPid => IOCTL_SET_PID,
            ControlCommand::SetFd => IOCTL_SET_FD,
            ControlCommand::Cipher => IOCTL_CIPHER,
        }
    }
}

const PID_MASK: u64 = 0xffff_ffff;
const FD_SHIFT: u32 = 32;
const FD_MASK: u64 = 0x7fff_ffff;
const ENABLED_BIT: u64 = 1 << 63;

/// Configuration read by every shim invocation.
///
/// Published to the kernel side as a single 64-bit word so a concurrent reader
/// sees either the previous or the next configuration, never a mix of both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlState {
    pub target_pid: i32,
    pub target_fd: i32,
    pub transform_enabled: bool,
}

impl Default for ControlState {
    fn default() -> Self {
        Self::UNSET
    }
}

impl ControlState {
    pub const UNSET: ControlState = ControlState {
        target_pid: UNSET,
        target_fd: UNSET,
        transform_enabled: false,
    };

    pub const fn to_word(self) -> u64 {
        let pid = if self.target_pid < 0 {
            PID_MASK
        } else {
            self.target_pid as u64
        };
        let fd = if self.target_fd < 0 {
            FD_MASK
        } else {
            self.target_fd as u64 & FD_MASK
        };
        let enabled = if self.transform_enabled { ENABLED_BIT } else { 0 };

        pid | (fd << FD_SHIFT) | enabled
    }

    pub const fn from_word(word: u64) -> Self {
        let pid = word & PID_MASK;
        let fd = (word >> FD_SHIFT) & FD_MASK;

        ControlState {
            target_pid: if pid == PID_MASK || pid > i32::MAX as u64 {
                UNSET
            } else {
                pid as i32
            },
            target_fd: if fd == FD_MASK { UNSET } else { fd as i32 },
            transform_enabled: word & ENABLED_BIT != 0,
        }
    }

    /// Cheap pre-check for the hot path, before any syscall arguments are read.
    #[inline(always)]
    pub fn targets_process(&self, pid: u32) -> bool {
        self.transform_enabled && self.target_pid != UNSET && self.target_pid as u32 == pid
    }

    /// Whether a call from process `pid` on descriptor `fd` must be transformed.
    #[inline(always)]
    pub fn matches(&self, pid: u32, fd: i32) -> bool {
        self.transform_enabled
            && self.target_pid != UNSET
            && self.target_fd != UNSET
            && self.target_pid as u32 == pid
            && self.target_fd == fd
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Read = 0,
    Write = 1,
}

impl Operation {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Operation::Read),
            1 => Some(Operation::Write),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "READ",
            Operation::Write => "WRITE",
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Ok = 0,
    /// The transform could not access the caller's buffer, or the transfer exceeded
    /// the transform window.
    Fault = 1,
}

/// A matched call, recorded when it enters and consumed when it exits.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingTransfer {
    pub pid: u32,
    pub tid: u32,
    pub fd: i32,
    pub op: u8,
    pub _pad: [u8; 3],
    pub buf: u64,
    pub count: u64,
}

impl PendingTransfer {
    pub fn operation(&self) -> Option<Operation> {
        Operation::from_u8(self.op)
    }
}

/// Sent from the shims to userspace for every transformed (or failed) call.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransformEvent {
    pub pid: u32,
    pub tid: u32,
    pub fd: i32,
    pub op: u8,
    pub status: u8,
    pub _pad: [u8; 2],
    pub requested: u64,
    pub actual: i64,
    /// Bytes already transformed when a fault stopped the transform.
    pub transformed: u64,
}

impl TransformEvent {
    pub fn operation(&self) -> Option<Operation> {
        Operation::from_u8(self.op)
    }

    pub fn is_fault(&self) -> bool {
        self.status == EventStatus::Fault as u8
    }

    /// Decodes an event received from the ring buffer, rejecting items of the wrong size.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != core::mem::size_of::<TransformEvent>() {
            return None;
        }

        // SAFETY: the length matches and every bit pattern is a valid TransformEvent.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const TransformEvent) })
    }
}

// SAFETY: plain repr(C) structs of integers with explicit padding.
#[cfg(feature = "user")]
unsafe impl aya::Pod for PendingTransfer {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for TransformEvent {}
