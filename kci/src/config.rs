// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use kci_common::DEFAULT_LOG_CAPACITY;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Transparent read/write transform for one process and descriptor")]
pub struct Config {
    /// Serve the control channel on the session bus instead of the system bus.
    #[arg(long, env = "KCID_USE_SESSION_BUS", default_value_t = false)]
    pub session_bus: bool,

    /// Directory holding the `calls` view of the activity log.
    #[arg(long, env = "KCID_LOG_DIR", default_value = "/run/kci")]
    pub log_dir: PathBuf,

    /// Activity log capacity in bytes; the log is cleared when an entry would not fit.
    #[arg(long, env = "KCID_LOG_CAPACITY", default_value_t = DEFAULT_LOG_CAPACITY)]
    pub log_capacity: usize,

    /// How long to wait for in-flight writes to be restored before detaching.
    #[arg(long, env = "KCID_QUIESCENCE_TIMEOUT_MS", default_value_t = 2000)]
    pub quiescence_timeout_ms: u64,

    /// Symbol tables to search for the dispatch table, in order. Defaults to
    /// /proc/kallsyms followed by the System.map of the running kernel.
    #[arg(long = "symbols", env = "KCID_SYMBOLS", value_delimiter = ',')]
    pub symbol_sources: Vec<PathBuf>,

    /// Kernel memory image used to verify the dispatch table.
    #[arg(long, env = "KCID_KCORE", default_value = "/proc/kcore")]
    pub kcore: PathBuf,
}

impl Config {
    pub fn quiescence_timeout(&self) -> Duration {
        Duration::from_millis(self.quiescence_timeout_ms)
    }

    pub fn symbol_sources(&self) -> Vec<PathBuf> {
        if !self.symbol_sources.is_empty() {
            return self.symbol_sources.clone();
        }

        let mut sources = vec![PathBuf::from("/proc/kallsyms")];
        if let Ok(release) = std::fs::read_to_string("/proc/sys/kernel/osrelease") {
            sources.push(PathBuf::from(format!("/boot/System.map-{}", release.trim())));
        }
        sources
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("calls")
    }
}
