// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::hooks::Slot;

#[derive(Debug, Error)]
pub enum KciError {
    #[error("syscall dispatch table not found in any of {searched:?}")]
    TableNotFound { searched: Vec<PathBuf> },

    #[error("kernel refused to patch the {slot} dispatch entry: {reason}")]
    ProtectionToggleFailed { slot: Slot, reason: String },

    #[error("{slot} dispatch slot holds {found:#x} after removal, expected {expected:#x}")]
    SlotNotRestored {
        slot: Slot,
        expected: u64,
        found: u64,
    },

    #[error("transform faulted after {transformed} bytes")]
    TransformAccessFault { transformed: u64 },

    #[error("log line of {len} bytes exceeds the {max} byte message limit")]
    LogFormatError { len: usize, max: usize },

    #[error("unknown control command {0:#x}")]
    UnknownCommand(u32),

    #[error("{} write(s) still in flight after {timeout_ms} ms (tids {tids:?})", .tids.len())]
    QuiescenceTimeout { tids: Vec<u32>, timeout_ms: u64 },

    #[error("eBPF object has no {0}")]
    MissingObject(&'static str),

    #[error("kernel memory: {0}")]
    KernelMemory(String),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
