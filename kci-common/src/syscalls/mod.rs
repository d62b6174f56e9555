// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

#[cfg(aarch64)]
mod aarch64;
#[cfg(aarch64)]
pub use aarch64::*;

#[cfg(x86_64)]
mod x86_64;
#[cfg(x86_64)]
pub use x86_64::*;

#[cfg(not(any(aarch64, x86_64)))]
compile_error!("Unsupported architecture. Currently only aarch64 and x86_64 are supported.");

/// Symbol prefixes under which the kernel may export syscall handlers, most specific
/// first. The unprefixed form is used by kernels built without syscall wrappers, which
/// take their arguments directly instead of through a `struct pt_regs`.
pub const HANDLER_PREFIXES: &[&str] = &[ARCH_HANDLER_PREFIX, "sys_"];

/// The prefix for which handlers take a `const struct pt_regs *`.
pub fn prefix_uses_wrapper(prefix: &str) -> bool {
    prefix == ARCH_HANDLER_PREFIX
}
