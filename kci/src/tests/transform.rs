// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use kci_common::transform::{
    decode, encode, shift_chunk, transform_user, Chunk, Direction, TransformFault, CIPHER_SHIFT,
    TRANSFORM_CHUNK, TRANSFORM_WINDOW,
};

use super::FakeMemory;

const BASE: u64 = 0x7fff_0000_1000;

#[test]
fn decode_inverts_encode_for_every_byte() {
    for b in 0..=u8::MAX {
        assert_eq!(decode(encode(b)), b);
        assert_eq!(encode(decode(b)), b);
    }
    assert_eq!(encode(0xff), 0x00);
    assert_eq!(decode(0x00), 0xff);
    assert_eq!(encode(b'A'), b'A' + CIPHER_SHIFT);
}

#[test]
fn chunk_shift_matches_bytewise_add() {
    for delta in [0u8, 1, 0x7f, 0x80, 0xff] {
        for half in 0..2u8 {
            let mut chunk = Chunk::zeroed();
            for (i, b) in chunk.0.iter_mut().enumerate() {
                *b = half * 128 + i as u8;
            }
            let expected: Vec<u8> = chunk.0.iter().map(|b| b.wrapping_add(delta)).collect();

            shift_chunk(&mut chunk, delta);

            assert_eq!(chunk.0.to_vec(), expected, "delta {delta:#x}");
        }
    }
}

#[test]
fn directions_cancel_out() {
    assert_eq!(
        Direction::Encode.delta().wrapping_add(Direction::Decode.delta()),
        0
    );
    assert_eq!(Direction::Encode.inverse(), Direction::Decode);
    assert_eq!(Direction::Decode.inverse(), Direction::Encode);
}

#[test]
fn encodes_in_place() {
    let mut memory = FakeMemory::new(BASE, b"AB");
    transform_user(&mut memory, BASE, 2, Direction::Encode).unwrap();
    assert_eq!(memory.bytes, b"BC");

    transform_user(&mut memory, BASE, 2, Direction::Decode).unwrap();
    assert_eq!(memory.bytes, b"AB");
}

#[test]
fn only_the_requested_prefix_is_touched() {
    let mut memory = FakeMemory::new(BASE, b"hello world");
    transform_user(&mut memory, BASE, 5, Direction::Encode).unwrap();
    assert_eq!(memory.bytes, b"ifmmp world");
}

#[test]
fn zero_length_does_not_access_memory() {
    let mut memory = FakeMemory::new(BASE, b"").faulting_at(BASE);
    transform_user(&mut memory, BASE, 0, Direction::Encode).unwrap();
    assert_eq!(memory.writes, 0);
}

#[test]
fn spans_several_chunks() {
    let original: Vec<u8> = (0..TRANSFORM_CHUNK * 3 + 17).map(|i| i as u8).collect();
    let mut memory = FakeMemory::new(BASE, &original);

    transform_user(&mut memory, BASE, original.len(), Direction::Encode).unwrap();

    let expected: Vec<u8> = original.iter().map(|&b| encode(b)).collect();
    assert_eq!(memory.bytes, expected);
    assert_eq!(memory.writes, 4);
}

#[test]
fn whole_window_is_transformed() {
    let mut memory = FakeMemory::new(BASE, &vec![b'a'; TRANSFORM_WINDOW]);

    transform_user(&mut memory, BASE, TRANSFORM_WINDOW, Direction::Encode).unwrap();

    assert!(memory.bytes.iter().all(|&b| b == b'b'));
}

#[test]
fn larger_than_window_is_refused_untouched() {
    let mut memory = FakeMemory::new(BASE, &vec![b'a'; TRANSFORM_WINDOW + 1]);

    let result = transform_user(&mut memory, BASE, TRANSFORM_WINDOW + 1, Direction::Encode);

    assert_eq!(result, Err(TransformFault::TooLarge));
    assert_eq!(result.unwrap_err().transformed(), 0);
    assert_eq!(memory.writes, 0);
}

#[test]
fn fault_reports_transformed_prefix() {
    let original = vec![b'x'; 300];
    let mut memory = FakeMemory::new(BASE, &original).faulting_at(BASE + 200);

    let result = transform_user(&mut memory, BASE, original.len(), Direction::Encode);

    assert_eq!(
        result,
        Err(TransformFault::Access {
            transformed: TRANSFORM_CHUNK
        })
    );
    assert!(memory.bytes[..TRANSFORM_CHUNK].iter().all(|&b| b == b'y'));
    assert!(memory.bytes[TRANSFORM_CHUNK..].iter().all(|&b| b == b'x'));
}

#[test]
fn unmapped_buffer_faults_immediately() {
    let mut memory = FakeMemory::new(BASE, b"abc");

    let result = transform_user(&mut memory, BASE + 0x1000, 3, Direction::Decode);

    assert_eq!(result, Err(TransformFault::Access { transformed: 0 }));
}
