// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use std::sync::Arc;

use aya::maps::{MapData, RingBuf};
use kci_common::TransformEvent;
use log::{error, trace, warn};
use tokio::{io::unix::AsyncFd, sync::Notify, task::JoinHandle};

use crate::{activity_log::ActivityLog, error::KciError};

/// Turns one event from the shims into a log entry. Faults never reach the log.
pub fn handle_event(log: &ActivityLog, event: &TransformEvent) -> Result<(), KciError> {
    let Some(op) = event.operation() else {
        warn!("Dropping event with unknown operation {}", event.op);
        return Ok(());
    };

    if event.is_fault() {
        let fault = KciError::TransformAccessFault {
            transformed: event.transformed,
        };
        let outcome = if event.actual < 0 {
            "rejected with"
        } else {
            "returned"
        };
        warn!(
            "{} of {} bytes on fd {} (pid {}) {outcome} {}: {fault}",
            op.as_str(),
            event.requested,
            event.fd,
            event.pid,
            event.actual
        );
        return Ok(());
    }

    trace!(
        "{} on fd {} by tid {}: {} of {} bytes",
        op.as_str(),
        event.fd,
        event.tid,
        event.actual,
        event.requested
    );
    log.append(event.fd, event.pid, op, event.requested, event.actual)
}

fn drain(ring: &mut RingBuf<MapData>, log: &ActivityLog) {
    while let Some(item) = ring.next() {
        let Some(event) = TransformEvent::from_bytes(&item) else {
            warn!("Dropping ring buffer item of {} bytes", item.len());
            continue;
        };
        if let Err(e) = handle_event(log, &event) {
            error!("Failed to record {:?} on fd {}: {e}", event.operation(), event.fd);
        }
    }
}

/// Feeds the activity log from the `EVENTS` ring buffer until `stop` is notified.
/// Whatever is still queued at that point is drained before the task ends.
pub fn spawn_event_reader(
    ring: RingBuf<MapData>,
    log: Arc<ActivityLog>,
    stop: Arc<Notify>,
) -> Result<JoinHandle<()>, KciError> {
    let mut ring = AsyncFd::new(ring)?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.notified() => {
                    trace!("[event reader] Stop requested, draining...");
                    break;
                }
                guard = ring.readable_mut() => {
                    let mut guard = match guard {
                        Ok(guard) => guard,
                        Err(e) => {
                            error!("Ring buffer poll failed: {e}");
                            return;
                        }
                    };
                    drain(guard.get_inner_mut(), &log);
                    guard.clear_ready();
                }
            }
        }

        drain(ring.get_mut(), &log);
    }))
}
