// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

pub const SYS_read: i64 = 0;
pub const SYS_write: i64 = 1;
pub const SYS_close: i64 = 3;

pub const ARCH_HANDLER_PREFIX: &str = "__x64_sys_";

/// Byte offsets of `di`, `si` and `dx` inside `struct pt_regs`, i.e. the first three
/// syscall arguments as saved on syscall entry.
pub const SYSCALL_ARG_OFFSETS: [usize; 3] = [14 * 8, 13 * 8, 12 * 8];
