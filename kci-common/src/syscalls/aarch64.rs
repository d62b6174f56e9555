// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

pub const SYS_read: i64 = 63;
pub const SYS_write: i64 = 64;
pub const SYS_close: i64 = 57;

pub const ARCH_HANDLER_PREFIX: &str = "__arm64_sys_";

/// Byte offsets of `regs[0]`, `regs[1]` and `regs[2]` inside `struct pt_regs`.
pub const SYSCALL_ARG_OFFSETS: [usize; 3] = [0, 8, 16];
