// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

#![allow(non_snake_case, non_upper_case_globals)]
use std::sync::Arc;

use anyhow::anyhow;
use aya::{
    maps::{Array, RingBuf},
    EbpfLoader,
};
use clap::Parser as _;
use kci_common::{SERVICE_NAME, SERVICE_PATH};
use log::{debug, error, info, warn};
use tokio::{
    signal,
    sync::{Mutex, Notify},
};

use crate::{
    activity_log::{ActivityLog, LogMirror},
    config::Config,
    control::Control,
    hooks::HookManager,
    kcore::Kcore,
    service::{ControlMap, KciService},
};

mod activity_log;
mod config;
mod control;
mod error;
mod events;
mod hooks;
mod kcore;
mod locator;
mod service;

#[cfg(test)]
mod tests;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::parse();

    // Bump the memlock rlimit. This is needed for older kernels that don't use the
    // new memcg based accounting, see https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }

    let kcore = match Kcore::open(&config.kcore) {
        Ok(kcore) => Some(kcore),
        Err(e) => {
            debug!("Cannot open {}: {e}", config.kcore.display());
            None
        }
    };

    let table = locator::locate(&config.symbol_sources(), kcore.as_ref())?;
    info!(
        "Dispatch table at {:#x}, handlers {} and {}",
        table.address, table.read.name, table.write.name
    );

    // The handler ABI decides how the shims find their arguments, so it has to be
    // known before the programs are verified.
    let uses_wrapper = table.uses_wrapper() as u8;
    let mut ebpf = EbpfLoader::new()
        .set_global("SYSCALL_WRAPPER", &uses_wrapper, true)
        .load(aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/kci")))?;
    if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
        // This can happen if you remove all log statements from your eBPF program.
        warn!("failed to initialize eBPF logger: {e}");
    }

    let control_map: ControlMap = Array::try_from(
        ebpf.take_map("CONTROL")
            .ok_or_else(|| anyhow!("CONTROL map not found"))?,
    )?;
    let control = Arc::new(Mutex::new(Control::new(control_map)?));

    let log = Arc::new(ActivityLog::with_mirror(
        config.log_capacity,
        LogMirror::create(&config.log_dir)?,
    ));

    let ring = RingBuf::try_from(
        ebpf.take_map("EVENTS")
            .ok_or_else(|| anyhow!("EVENTS map not found"))?,
    )?;
    let stop_reader = Arc::new(Notify::new());
    let reader = events::spawn_event_reader(ring, log.clone(), stop_reader.clone())?;

    let hooks = match HookManager::install(&mut ebpf, &table, kcore.as_ref()) {
        Ok(hooks) => hooks,
        Err(e) => {
            if let Some(mirror) = log.take_mirror() {
                let _ = mirror.remove();
            }
            return Err(e.into());
        }
    };

    let shutdown = Arc::new(Notify::new());
    let dbus = KciService::new(control.clone(), log.clone(), shutdown.clone());

    // The hooks are live from here on, so whatever happens while serving has to
    // go through the teardown below.
    let served = serve(config.session_bus, dbus, &shutdown).await;
    if let Err(e) = &served {
        error!("Serving the D-Bus interface failed: {e:#}");
    }

    // Hold the control lock for the whole teardown so no request can re-enable
    // matching halfway through.
    let uninstalled = {
        let mut control = control.lock().await;
        hooks
            .uninstall(
                &mut ebpf,
                &mut *control,
                config.quiescence_timeout(),
                kcore.as_ref(),
            )
            .await
    };

    stop_reader.notify_one();
    if let Err(e) = reader.await {
        warn!("Event reader ended abnormally: {e}");
    }

    if let Some(mirror) = log.take_mirror() {
        if let Err(e) = mirror.remove() {
            warn!("Failed to remove {}: {e}", config.log_file().display());
        }
    }

    if let Ok(conn) = &served {
        if let Err(e) = conn.release_name(SERVICE_NAME).await {
            debug!("Releasing {SERVICE_NAME}: {e}");
        }
    }

    println!("Exiting...");

    served?;
    uninstalled?;

    Ok(())
}

/// Publishes the service and waits for Ctrl-C or an `Unload` request.
async fn serve(
    session_bus: bool,
    service: KciService,
    shutdown: &Notify,
) -> anyhow::Result<zbus::Connection> {
    // We allow requesting usage of the session bus, mostly for the tests.
    let (conn, bus_type) = if session_bus {
        (zbus::Connection::session().await?, "session")
    } else {
        (zbus::Connection::system().await?, "system")
    };

    conn.object_server().at(SERVICE_PATH, service).await?;
    conn.request_name(SERVICE_NAME).await?;
    println!("KCI D-Bus service started on {bus_type} bus");

    println!("Waiting for Ctrl-C...");
    tokio::select! {
        result = signal::ctrl_c() => {
            eprintln!("Ctrl-C received...");
            result?;
        },
        _ = shutdown.notified() => (),
    };

    Ok(conn)
}
