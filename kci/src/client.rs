// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use std::{ffi::OsString, io::Write as _, path::PathBuf, time::Duration};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use kci_client::ioctl_param;
use kci_common::{IOCTL_CIPHER, IOCTL_SET_FD, IOCTL_SET_PID};

#[derive(Parser, Debug)]
#[command(author, version, about = "Control the kci read/write interceptor")]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Cmd {
    /// Start the daemon and wait until it is serving
    Init {
        /// Path to the kcid binary
        daemon: PathBuf,

        /// Seconds to wait for the daemon to come up
        #[arg(long, default_value_t = 10)]
        timeout: u64,

        /// Extra arguments passed to the daemon
        #[arg(last = true)]
        args: Vec<OsString>,
    },
    /// Select the process whose calls are transformed
    Pid {
        #[arg(allow_negative_numbers = true)]
        pid: i32,
    },
    /// Select the descriptor whose calls are transformed
    Fd {
        #[arg(allow_negative_numbers = true)]
        fd: i32,
    },
    /// Turn the transform on
    Start,
    /// Turn the transform off
    Stop,
    /// Print the activity log
    Log,
    /// Print the current target and whether the transform is on
    Status,
    /// Save the activity log and unload the daemon
    Rm {
        /// Where the log is saved
        #[arg(long, default_value = "calls")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    match args.command {
        Cmd::Init {
            daemon,
            timeout,
            args,
        } => {
            let pid = kci_client::spawn_daemon(&daemon, &args, Duration::from_secs(timeout))
                .await
                .with_context(|| format!("Starting {}", daemon.display()))?;
            println!("kcid running as pid {pid}");
        }
        Cmd::Pid { pid } => kci_client::send_command(IOCTL_SET_PID, ioctl_param(pid)).await,
        Cmd::Fd { fd } => kci_client::send_command(IOCTL_SET_FD, ioctl_param(fd)).await,
        Cmd::Start => kci_client::send_command(IOCTL_CIPHER, 1).await,
        Cmd::Stop => kci_client::send_command(IOCTL_CIPHER, 0).await,
        Cmd::Log => {
            let log = kci_client::fetch_log().await;
            std::io::stdout().write_all(&log)?;
        }
        Cmd::Status => {
            let (pid, fd, enabled) = kci_client::status().await;
            println!(
                "pid {pid} fd {fd} transform {}",
                if enabled { "on" } else { "off" }
            );
        }
        Cmd::Rm { output } => {
            let log = kci_client::fetch_log().await;
            std::fs::write(&output, &log)
                .with_context(|| format!("Saving log to {}", output.display()))?;
            kci_client::unload().await;
        }
    }

    Ok(())
}
