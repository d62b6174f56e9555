// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use std::time::{Duration, Instant};

use kci_common::{
    syscalls::{SYS_read, SYS_write},
    Operation, PendingTransfer,
};

use super::{synthetic_kcore, words};
use crate::{
    error::KciError,
    hooks::{in_flight_writes, verify_restored, wait_for_quiescence, HookRecord, Slot},
    kcore::Kcore,
};

const TABLE: u64 = 0xffff_ffff_8220_0000;
const READ_HANDLER: u64 = 0xffff_ffff_8140_0010;
const WRITE_HANDLER: u64 = 0xffff_ffff_8140_0020;

fn records() -> Vec<HookRecord> {
    vec![
        HookRecord::new(
            Slot::Read,
            "__x64_sys_read".to_string(),
            READ_HANDLER,
            TABLE + 8 * SYS_read as u64,
        ),
        HookRecord::new(
            Slot::Write,
            "__x64_sys_write".to_string(),
            WRITE_HANDLER,
            TABLE + 8 * SYS_write as u64,
        ),
    ]
}

/// A dispatch table whose read and write slots hold `read` and `write`.
fn table_with(read: u64, write: u64) -> Vec<u8> {
    let mut slots = vec![0u64; SYS_write as usize + 1];
    slots[SYS_read as usize] = read;
    slots[SYS_write as usize] = write;
    words(&slots)
}

fn pending(tid: u32, op: Operation) -> (u32, PendingTransfer) {
    (
        tid,
        PendingTransfer {
            pid: 100,
            tid,
            fd: 3,
            op: op as u8,
            buf: 0x1000,
            count: 8,
            ..Default::default()
        },
    )
}

#[test]
fn slots_name_their_programs() {
    assert_eq!(Slot::Read.nr(), SYS_read);
    assert_eq!(Slot::Write.nr(), SYS_write);
    assert_eq!(Slot::Read.enter_program(), "kci_read_enter");
    assert_eq!(Slot::Write.exit_program(), "kci_write_exit");
    assert_eq!(Slot::Write.exit_tracepoint(), "sys_exit_write");
    assert_eq!(Slot::Read.to_string(), "read");
}

#[test]
fn only_writes_hold_encoded_buffers() {
    let entries = vec![
        pending(12, Operation::Write),
        pending(7, Operation::Read),
        pending(3, Operation::Write),
    ];

    assert_eq!(in_flight_writes(entries), vec![3, 12]);
    assert!(in_flight_writes(vec![pending(1, Operation::Read)]).is_empty());
}

#[tokio::test]
async fn quiescence_returns_once_writes_drain() {
    let mut polls = 0;

    wait_for_quiescence(
        || {
            polls += 1;
            Ok(if polls < 3 { vec![42] } else { vec![] })
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    assert_eq!(polls, 3);
}

#[tokio::test]
async fn quiescence_gives_up_after_timeout() {
    let started = Instant::now();

    let result = wait_for_quiescence(|| Ok(vec![7, 9]), Duration::from_millis(50)).await;

    assert!(started.elapsed() >= Duration::from_millis(50));
    let Err(KciError::QuiescenceTimeout { tids, timeout_ms }) = result else {
        panic!("expected a timeout, got {result:?}");
    };
    assert_eq!(tids, vec![7, 9]);
    assert_eq!(timeout_ms, 50);
}

#[tokio::test]
async fn quiescence_propagates_map_errors() {
    let result = wait_for_quiescence(
        || Err(KciError::KernelMemory("gone".to_string())),
        Duration::from_secs(1),
    )
    .await;

    assert!(matches!(result, Err(KciError::KernelMemory(_))));
}

#[test]
fn restored_slots_hold_their_original_handlers() {
    let image = synthetic_kcore(&[(TABLE, table_with(READ_HANDLER, WRITE_HANDLER))]);
    let kcore = Kcore::open(image.path()).unwrap();

    verify_restored(&records(), &kcore).unwrap();
}

#[test]
fn leftover_handler_in_a_slot_is_reported() {
    let stray = 0xffff_ffff_c000_1000;
    let image = synthetic_kcore(&[(TABLE, table_with(READ_HANDLER, stray))]);
    let kcore = Kcore::open(image.path()).unwrap();

    let result = verify_restored(&records(), &kcore);

    let Err(KciError::SlotNotRestored {
        slot,
        expected,
        found,
    }) = result
    else {
        panic!("expected an unrestored slot, got {result:?}");
    };
    assert_eq!(slot, Slot::Write);
    assert_eq!(expected, WRITE_HANDLER);
    assert_eq!(found, stray);
}

#[test]
fn unreadable_slot_fails_verification() {
    // The mapping ends right after the read slot.
    let mut table = table_with(READ_HANDLER, WRITE_HANDLER);
    table.truncate(8 * (SYS_read as usize + 1));
    let image = synthetic_kcore(&[(TABLE, table)]);
    let kcore = Kcore::open(image.path()).unwrap();

    let result = verify_restored(&records(), &kcore);

    assert!(matches!(result, Err(KciError::KernelMemory(_))), "{result:?}");
}
