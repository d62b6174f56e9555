// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use std::{
    io::{BufRead as _, BufReader, PipeReader, Read as _},
    path::Path,
    process::{Child, Command, Output},
    time::Duration,
};

use assert_cmd::cargo::cargo_bin;
use kci_common::SERVICE_NAME;
use once_cell::sync::Lazy;

/// Starts kcid with stdout and stderr merged into the returned pipe.
pub fn run_kcid(log_dir: &Path, env: &[(&str, &str)]) -> (BufReader<PipeReader>, Child) {
    let (reader, writer) = std::io::pipe().unwrap();

    let child = Command::new(cargo_bin("kcid"))
        .envs(env.iter().copied())
        .arg("--log-dir")
        .arg(log_dir)
        .stdout(writer.try_clone().unwrap())
        .stderr(writer)
        .spawn()
        .unwrap_or_else(|e| panic!("Failed to run kcid: {e}"));

    (BufReader::new(reader), child)
}

pub fn ensure_root() {
    assert_eq!(
        unsafe { libc::geteuid() },
        0,
        "Need to run test as root (using, for instance, cargo sudo)"
    );
}

pub fn service_running() -> bool {
    tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(kci_client::service_running())
        .unwrap()
}

/// A kcid serving on the test session bus, stopped by [`KciTest::wait`].
pub struct KciTest {
    child: Child,
    reader: BufReader<PipeReader>,
    seen: Vec<u8>,
}

impl KciTest {
    pub fn new(log_dir: &Path) -> Self {
        Self::with_env(log_dir, &[])
    }

    pub fn with_env(log_dir: &Path, env: &[(&str, &str)]) -> Self {
        ensure_root();
        ensure_dbus_env();
        // The bus can take a moment to drop the name of the previous test's kcid.
        wait_for_service_to_leave(Duration::from_secs(5));

        let (reader, child) = run_kcid(log_dir, env);
        let mut test = KciTest {
            child,
            reader,
            seen: vec![],
        };

        if !test.read_until("Waiting for Ctrl-C...") {
            panic!(
                "kcid exited before serving:\n{}",
                String::from_utf8_lossy(&test.seen)
            );
        }
        assert!(service_running());

        test
    }

    /// Echoes output lines until one contains `needle`. False if kcid closed its
    /// output first.
    fn read_until(&mut self, needle: &str) -> bool {
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) | Err(_) => return false,
                Ok(_) => (),
            }
            eprint!("{line}");
            self.seen.extend_from_slice(line.as_bytes());
            if line.contains(needle) {
                return true;
            }
        }
    }

    /// Interrupts the daemon, unless it is already on its way out, and collects
    /// everything it printed.
    pub fn wait(mut self) -> Output {
        unsafe { libc::kill(self.child.id() as i32, libc::SIGINT) };

        // The pipe closes when kcid exits.
        let mut rest = vec![];
        self.reader.read_to_end(&mut rest).unwrap();
        eprint!("{}", String::from_utf8_lossy(&rest));
        self.seen.extend_from_slice(&rest);

        Output {
            status: self.child.wait().unwrap(),
            stdout: self.seen,
            stderr: vec![],
        }
    }
}

/// Runs kcid to completion without waiting for it to serve.
pub fn run_kcid_to_exit(log_dir: &Path) -> Output {
    ensure_root();
    ensure_dbus_env();

    let (mut reader, mut child) = run_kcid(log_dir, &[]);
    let mut stdout = vec![];
    reader.read_to_end(&mut stdout).unwrap();

    Output {
        status: child.wait().unwrap(),
        stdout,
        stderr: vec![],
    }
}

/// Polls until nobody owns the service name.
pub fn wait_for_service_to_leave(timeout: Duration) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while service_running() {
        assert!(waited < timeout, "{SERVICE_NAME} still owned after {timeout:?}");
        std::thread::sleep(step);
        waited += step;
    }
}

/// Runs the control utility against the test daemon.
pub fn kci(args: &[&str]) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("kci").unwrap();
    cmd.args(args);
    cmd
}

extern "C" fn kill_dbus_daemon() {
    if let Ok(pid) = std::env::var("DBUS_SESSION_BUS_PID") {
        let pid: i32 = pid.parse().unwrap();
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

static DBUS_ENV: Lazy<()> = Lazy::new(|| {
    unsafe {
        libc::atexit(kill_dbus_daemon);
    }

    std::env::set_var("KCID_USE_SESSION_BUS", "true");

    let output = Command::new("dbus-launch")
        .output()
        .expect("failed to run dbus-launch");
    let stdout = String::from_utf8_lossy(&output.stdout);

    for line in stdout.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim_end_matches(';');
            std::env::set_var(key, value);
        }
    }
});

pub fn ensure_dbus_env() {
    Lazy::force(&DBUS_ENV);
}
