// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

//! Additive byte cipher applied in place to a caller's buffer.
//!
//! This is obfuscation, not encryption: the shift is fixed and shared by every target.

pub const CIPHER_SHIFT: u8 = 1;

/// Bytes moved between the caller's address space and the transform per step.
pub const TRANSFORM_CHUNK: usize = 128;

/// Largest transfer the shims will transform. The eBPF verifier needs a bounded loop.
pub const TRANSFORM_WINDOW: usize = 256 * 1024;

pub const MAX_CHUNKS: usize = TRANSFORM_WINDOW / TRANSFORM_CHUNK;

const CHUNK_WORDS: usize = TRANSFORM_CHUNK / 8;
const LOW_BITS: u64 = 0x7f7f_7f7f_7f7f_7f7f;
const HIGH_BITS: u64 = 0x8080_8080_8080_8080;

#[inline(always)]
pub const fn encode(byte: u8) -> u8 {
    byte.wrapping_add(CIPHER_SHIFT)
}

#[inline(always)]
pub const fn decode(byte: u8) -> u8 {
    byte.wrapping_sub(CIPHER_SHIFT)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Encode,
    Decode,
}

impl Direction {
    /// The per-byte addend, modulo 256.
    #[inline(always)]
    pub const fn delta(self) -> u8 {
        match self {
            Direction::Encode => CIPHER_SHIFT,
            Direction::Decode => CIPHER_SHIFT.wrapping_neg(),
        }
    }

    pub const fn inverse(self) -> Self {
        match self {
            Direction::Encode => Direction::Decode,
            Direction::Decode => Direction::Encode,
        }
    }
}

#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct Chunk(pub [u8; TRANSFORM_CHUNK]);

impl Chunk {
    pub const fn zeroed() -> Self {
        Chunk([0; TRANSFORM_CHUNK])
    }

    #[inline(always)]
    fn words_mut(&mut self) -> &mut [u64; CHUNK_WORDS] {
        // SAFETY: Chunk is 8-byte aligned and exactly CHUNK_WORDS words long.
        unsafe { &mut *(self.0.as_mut_ptr() as *mut [u64; CHUNK_WORDS]) }
    }
}

/// Adds `delta` to every byte of `chunk`, wrapping, eight bytes at a time.
///
/// The low seven bits of each byte are summed without carrying into the next byte;
/// the top bit is then fixed up with an xor.
#[inline(always)]
pub fn shift_chunk(chunk: &mut Chunk, delta: u8) {
    let addend = u64::from_ne_bytes([delta; 8]);

    for word in chunk.words_mut().iter_mut() {
        let x = *word;
        *word = ((x & LOW_BITS) + (addend & LOW_BITS)) ^ ((x ^ addend) & HIGH_BITS);
    }
}

/// Access to memory belonging to the calling process.
///
/// `len` never exceeds [`TRANSFORM_CHUNK`].
pub trait UserMemory {
    fn read(&mut self, addr: u64, chunk: &mut Chunk, len: usize) -> Result<(), ()>;
    fn write(&mut self, addr: u64, chunk: &Chunk, len: usize) -> Result<(), ()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformFault {
    /// The transfer is larger than [`TRANSFORM_WINDOW`]; nothing was touched.
    TooLarge,
    /// A read or write of the caller's buffer failed. The first `transformed` bytes
    /// were already rewritten.
    Access { transformed: usize },
}

impl TransformFault {
    pub fn transformed(&self) -> usize {
        match self {
            TransformFault::TooLarge => 0,
            TransformFault::Access { transformed } => *transformed,
        }
    }
}

/// Transforms the first `len` bytes at `addr` in place.
#[inline(always)]
pub fn transform_user<M: UserMemory>(
    memory: &mut M,
    addr: u64,
    len: usize,
    direction: Direction,
) -> Result<(), TransformFault> {
    if len > TRANSFORM_WINDOW {
        return Err(TransformFault::TooLarge);
    }

    let delta = direction.delta();
    let mut chunk = Chunk::zeroed();
    let mut done = 0usize;

    for _ in 0..MAX_CHUNKS {
        if done >= len {
            break;
        }

        let n = core::cmp::min(len - done, TRANSFORM_CHUNK);
        let at = addr.wrapping_add(done as u64);

        memory
            .read(at, &mut chunk, n)
            .map_err(|_| TransformFault::Access { transformed: done })?;

        shift_chunk(&mut chunk, delta);

        memory
            .write(at, &chunk, n)
            .map_err(|_| TransformFault::Access { transformed: done })?;

        done += n;
    }

    Ok(())
}
