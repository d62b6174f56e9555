// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

mod hooks;
mod transform;

use kci_common::transform::{Chunk, UserMemory};

/// A slice of simulated process memory starting at `base`. Accesses outside of it,
/// or touching `fault_at`, fail the way an unmapped page would.
pub struct FakeMemory {
    pub base: u64,
    pub bytes: Vec<u8>,
    pub fault_at: Option<u64>,
    pub writes: usize,
}

impl FakeMemory {
    pub fn new(base: u64, bytes: &[u8]) -> Self {
        FakeMemory {
            base,
            bytes: bytes.to_vec(),
            fault_at: None,
            writes: 0,
        }
    }

    pub fn faulting_at(mut self, addr: u64) -> Self {
        self.fault_at = Some(addr);
        self
    }

    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>, ()> {
        if let Some(fault) = self.fault_at {
            if fault >= addr && fault < addr + len as u64 {
                return Err(());
            }
        }

        let start = addr.checked_sub(self.base).ok_or(())? as usize;
        let end = start + len;
        if end > self.bytes.len() {
            return Err(());
        }
        Ok(start..end)
    }
}

impl UserMemory for FakeMemory {
    fn read(&mut self, addr: u64, chunk: &mut Chunk, len: usize) -> Result<(), ()> {
        let range = self.range(addr, len)?;
        chunk.0[..len].copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, addr: u64, chunk: &Chunk, len: usize) -> Result<(), ()> {
        let range = self.range(addr, len)?;
        self.bytes[range].copy_from_slice(&chunk.0[..len]);
        self.writes += 1;
        Ok(())
    }
}

const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;

/// Writes a minimal little-endian ELF64 core image. Each segment becomes a
/// PT_LOAD header, preceded by a PT_NOTE that readers must skip.
pub fn synthetic_kcore(segments: &[(u64, Vec<u8>)]) -> tempfile::NamedTempFile {
    use std::io::Write as _;

    const EHDR: usize = 64;
    const PHDR: usize = 56;

    let phnum = segments.len() + 1;
    let mut image = vec![0u8; EHDR + PHDR * phnum];

    image[..4].copy_from_slice(b"\x7fELF");
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // ELFDATA2LSB
    image[6] = 1;
    image[16..18].copy_from_slice(&4u16.to_le_bytes()); // ET_CORE
    image[32..40].copy_from_slice(&(EHDR as u64).to_le_bytes());
    image[52..54].copy_from_slice(&(EHDR as u16).to_le_bytes());
    image[54..56].copy_from_slice(&(PHDR as u16).to_le_bytes());
    image[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

    let mut phdr = |index: usize, kind: u32, offset: u64, vaddr: u64, size: u64| {
        let at = EHDR + PHDR * index;
        image[at..at + 4].copy_from_slice(&kind.to_le_bytes());
        image[at + 8..at + 16].copy_from_slice(&offset.to_le_bytes());
        image[at + 16..at + 24].copy_from_slice(&vaddr.to_le_bytes());
        image[at + 32..at + 40].copy_from_slice(&size.to_le_bytes());
        image[at + 40..at + 48].copy_from_slice(&size.to_le_bytes());
    };

    phdr(0, PT_NOTE, 0, 0, 0);

    let mut offset = (EHDR + PHDR * phnum) as u64;
    for (index, (vaddr, bytes)) in segments.iter().enumerate() {
        phdr(index + 1, PT_LOAD, offset, *vaddr, bytes.len() as u64);
        offset += bytes.len() as u64;
    }

    for (_, bytes) in segments {
        image.extend_from_slice(bytes);
    }

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();
    file.flush().unwrap();
    file
}

/// Little-endian words laid out back to back.
pub fn words(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|word| word.to_le_bytes()).collect()
}
