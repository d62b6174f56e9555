// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use which::which;

/// Building this crate has an undeclared dependency on the `bpf-linker` binary. Without
/// artifact dependencies the best we can do is rebuild whenever the `bpf-linker` found
/// in $PATH changes.
///
/// The host architecture is also exported as a cfg, since the crate itself is compiled
/// for the `bpf` target and needs to know which register layout the kernel uses.
fn main() {
    let bpf_linker = which("bpf-linker").unwrap();
    println!("cargo:rerun-if-changed={}", bpf_linker.to_str().unwrap());

    println!("cargo::rustc-check-cfg=cfg(aarch64)");
    println!("cargo::rustc-check-cfg=cfg(x86_64)");

    #[cfg(target_arch = "aarch64")]
    println!("cargo::rustc-cfg=aarch64");

    #[cfg(target_arch = "x86_64")]
    println!("cargo::rustc-cfg=x86_64");

    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    compile_error!("Unsupported architecture. We only support aarch64 and x86_64, for now.");
}
