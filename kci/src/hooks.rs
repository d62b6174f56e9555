// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use std::{fmt, time::Duration};

use aya::{
    maps::{HashMap, MapData},
    programs::{
        kprobe::KProbeLinkId, trace_point::TracePointLinkId, KProbe, ProgramError, TracePoint,
    },
    Ebpf,
};
use kci_common::{
    syscalls::{SYS_read, SYS_write},
    Operation, PendingTransfer,
};
use log::{debug, info, trace, warn};
use tokio::time::{sleep, Instant};

use crate::{
    control::{Control, ControlSink},
    error::KciError,
    kcore::Kcore,
    locator::{DispatchTable, HandlerSymbol},
};

pub const QUIESCENCE_POLL: Duration = Duration::from_millis(10);

type PendingMap = HashMap<MapData, u32, PendingTransfer>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    Read,
    Write,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::Read, Slot::Write];

    pub fn nr(self) -> i64 {
        match self {
            Slot::Read => SYS_read,
            Slot::Write => SYS_write,
        }
    }

    pub fn enter_program(self) -> &'static str {
        match self {
            Slot::Read => "kci_read_enter",
            Slot::Write => "kci_write_enter",
        }
    }

    pub fn exit_program(self) -> &'static str {
        match self {
            Slot::Read => "kci_read_exit",
            Slot::Write => "kci_write_exit",
        }
    }

    /// Event under the `syscalls` tracepoint category that fires when the call returns.
    pub fn exit_tracepoint(self) -> &'static str {
        match self {
            Slot::Read => "sys_exit_read",
            Slot::Write => "sys_exit_write",
        }
    }

    pub fn handler(self, table: &DispatchTable) -> &HandlerSymbol {
        match self {
            Slot::Read => &table.read,
            Slot::Write => &table.write,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Slot::Read => "read",
            Slot::Write => "write",
        })
    }
}

/// One intercepted dispatch slot. The link ids are taken out when the slot is
/// restored, so a record cannot be detached twice.
pub struct HookRecord {
    pub slot: Slot,
    pub handler_symbol: String,
    pub original_handler: u64,
    pub table_slot_address: u64,
    enter: Option<KProbeLinkId>,
    exit: Option<TracePointLinkId>,
}

impl HookRecord {
    pub fn new(
        slot: Slot,
        handler_symbol: String,
        original_handler: u64,
        table_slot_address: u64,
    ) -> Self {
        HookRecord {
            slot,
            handler_symbol,
            original_handler,
            table_slot_address,
            enter: None,
            exit: None,
        }
    }
}

/// Checks every slot still points at the handler it held at install time.
pub fn verify_restored(records: &[HookRecord], kcore: &Kcore) -> Result<(), KciError> {
    for record in records {
        let found = kcore.read_u64(record.table_slot_address)?;
        if found != record.original_handler {
            return Err(KciError::SlotNotRestored {
                slot: record.slot,
                expected: record.original_handler,
                found,
            });
        }
    }
    Ok(())
}

fn toggle_failed(slot: Slot, reason: impl ToString) -> KciError {
    KciError::ProtectionToggleFailed {
        slot,
        reason: reason.to_string(),
    }
}

fn kprobe(ebpf: &mut Ebpf, slot: Slot) -> Result<&mut KProbe, KciError> {
    let name = slot.enter_program();
    ebpf.program_mut(name)
        .ok_or(KciError::MissingObject("entry program"))?
        .try_into()
        .map_err(|e: ProgramError| toggle_failed(slot, e))
}

fn tracepoint(ebpf: &mut Ebpf, slot: Slot) -> Result<&mut TracePoint, KciError> {
    let name = slot.exit_program();
    ebpf.program_mut(name)
        .ok_or(KciError::MissingObject("exit program"))?
        .try_into()
        .map_err(|e: ProgramError| toggle_failed(slot, e))
}

/// Threads whose write buffer is currently encoded, sorted.
pub fn in_flight_writes(entries: impl IntoIterator<Item = (u32, PendingTransfer)>) -> Vec<u32> {
    let mut tids: Vec<u32> = entries
        .into_iter()
        .filter(|(_, pending)| pending.operation() == Some(Operation::Write))
        .map(|(tid, _)| tid)
        .collect();
    tids.sort_unstable();
    tids
}

/// Polls `outstanding` until it reports nothing in flight or `timeout` passes.
pub async fn wait_for_quiescence<F>(mut outstanding: F, timeout: Duration) -> Result<(), KciError>
where
    F: FnMut() -> Result<Vec<u32>, KciError>,
{
    let deadline = Instant::now() + timeout;

    loop {
        let tids = outstanding()?;
        if tids.is_empty() {
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(KciError::QuiescenceTimeout {
                tids,
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        trace!("Waiting on {} in-flight write(s)", tids.len());
        sleep(QUIESCENCE_POLL).await;
    }
}

pub struct HookManager {
    records: Vec<HookRecord>,
    pending: PendingMap,
}

impl HookManager {
    /// Intercepts the read and write slots of `table`.
    ///
    /// Exit programs go in before entry programs so an encoded buffer always has
    /// something to restore it. Any failure detaches whatever was attached.
    pub fn install(
        ebpf: &mut Ebpf,
        table: &DispatchTable,
        kcore: Option<&Kcore>,
    ) -> Result<HookManager, KciError> {
        let pending = PendingMap::try_from(
            ebpf.take_map("PENDING")
                .ok_or(KciError::MissingObject("PENDING map"))?,
        )?;

        let mut records = Vec::with_capacity(Slot::ALL.len());
        for slot in Slot::ALL {
            let handler = slot.handler(table);
            let table_slot_address = table.slot_address(slot.nr());
            let original_handler = match kcore {
                Some(kcore) => kcore.read_u64(table_slot_address)?,
                None => handler.address,
            };

            if original_handler != handler.address {
                warn!(
                    "{slot} slot holds {original_handler:#x} but {} is at {:#x}, another hook may be installed",
                    handler.name, handler.address
                );
            }

            records.push(HookRecord::new(
                slot,
                handler.name.clone(),
                original_handler,
                table_slot_address,
            ));
        }

        let mut manager = HookManager { records, pending };
        if let Err(e) = manager.attach(ebpf) {
            warn!("Rolling back partial install: {e}");
            manager.detach_entries(ebpf);
            manager.detach_exits(ebpf);
            return Err(e);
        }

        Ok(manager)
    }

    fn attach(&mut self, ebpf: &mut Ebpf) -> Result<(), KciError> {
        for record in self.records.iter_mut() {
            let program = tracepoint(ebpf, record.slot)?;
            program.load().map_err(|e| toggle_failed(record.slot, e))?;
            let link = program
                .attach("syscalls", record.slot.exit_tracepoint())
                .map_err(|e| toggle_failed(record.slot, e))?;
            record.exit = Some(link);
            debug!("Attached syscalls:{}", record.slot.exit_tracepoint());
        }

        for record in self.records.iter_mut() {
            let program = kprobe(ebpf, record.slot)?;
            program.load().map_err(|e| toggle_failed(record.slot, e))?;
            let link = program
                .attach(&record.handler_symbol, 0)
                .map_err(|e| toggle_failed(record.slot, e))?;
            record.enter = Some(link);
            info!(
                "Intercepting {} slot at {:#x} ({})",
                record.slot, record.table_slot_address, record.handler_symbol
            );
        }

        Ok(())
    }

    pub fn pending_writes(&self) -> Result<Vec<u32>, KciError> {
        let entries = self.pending.iter().collect::<Result<Vec<_>, _>>()?;
        Ok(in_flight_writes(entries))
    }

    fn detach_entries(&mut self, ebpf: &mut Ebpf) -> Option<KciError> {
        let mut first_error = None;
        for record in self.records.iter_mut() {
            let Some(link) = record.enter.take() else {
                continue;
            };
            let result = kprobe(ebpf, record.slot).and_then(|program| {
                program
                    .detach(link)
                    .map_err(|e| toggle_failed(record.slot, e))
            });
            match result {
                Ok(()) => debug!("Detached {} entry", record.slot),
                Err(e) => {
                    warn!("Failed to detach {} entry: {e}", record.slot);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error
    }

    fn detach_exits(&mut self, ebpf: &mut Ebpf) -> Option<KciError> {
        let mut first_error = None;
        for record in self.records.iter_mut() {
            let Some(link) = record.exit.take() else {
                continue;
            };
            let result = tracepoint(ebpf, record.slot).and_then(|program| {
                program
                    .detach(link)
                    .map_err(|e| toggle_failed(record.slot, e))
            });
            match result {
                Ok(()) => debug!("Detached {} exit", record.slot),
                Err(e) => {
                    warn!("Failed to detach {} exit: {e}", record.slot);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error
    }

    /// Stops matching, lets in-flight writes restore their buffers and detaches
    /// everything. Every step runs even if an earlier one failed; the first error
    /// is returned.
    pub async fn uninstall<S: ControlSink>(
        mut self,
        ebpf: &mut Ebpf,
        control: &mut Control<S>,
        timeout: Duration,
        kcore: Option<&Kcore>,
    ) -> Result<(), KciError> {
        let mut first_error = control.reset().err();

        if let Some(e) = self.detach_entries(ebpf) {
            first_error.get_or_insert(e);
        }

        match wait_for_quiescence(|| self.pending_writes(), timeout).await {
            Ok(()) => debug!("No writes in flight"),
            Err(e) => {
                warn!("{e}, detaching anyway");
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = self.detach_exits(ebpf) {
            first_error.get_or_insert(e);
        }

        if let Some(kcore) = kcore {
            if let Err(e) = verify_restored(&self.records, kcore) {
                first_error.get_or_insert(e);
            }
        }

        info!("Read and write slots restored");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
