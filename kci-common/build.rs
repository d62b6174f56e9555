// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

// The eBPF side is built for the `bpf` target, so `target_arch` there tells us nothing
// about the kernel we run on. Syscall numbers and register layouts follow the host.
fn main() {
    println!("cargo::rustc-check-cfg=cfg(aarch64)");
    println!("cargo::rustc-check-cfg=cfg(x86_64)");

    #[cfg(target_arch = "aarch64")]
    println!("cargo::rustc-cfg=aarch64");

    #[cfg(target_arch = "x86_64")]
    println!("cargo::rustc-cfg=x86_64");

    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    compile_error!("Unsupported architecture. Syscall tables are only known for aarch64 and x86_64.");
}
