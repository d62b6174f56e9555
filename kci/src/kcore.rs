// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

//! Read-only access to live kernel memory through the `/proc/kcore` ELF image.

use std::{fs::File, os::unix::fs::FileExt as _, path::Path};

use crate::error::KciError;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const PT_LOAD: u32 = 1;
const PN_XNUM: u16 = 0xffff;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub offset: u64,
    pub size: u64,
}

impl Segment {
    fn contains(&self, vaddr: u64, len: u64) -> bool {
        vaddr >= self.vaddr
            && vaddr
                .checked_add(len)
                .is_some_and(|end| end <= self.vaddr.saturating_add(self.size))
    }
}

pub struct Kcore {
    file: File,
    segments: Vec<Segment>,
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap_or_default())
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap_or_default())
}

impl Kcore {
    pub fn open(path: &Path) -> Result<Self, KciError> {
        Self::from_file(File::open(path)?)
    }

    pub fn from_file(file: File) -> Result<Self, KciError> {
        let mut ehdr = [0u8; EHDR_SIZE];
        file.read_exact_at(&mut ehdr, 0)?;

        if &ehdr[..4] != ELF_MAGIC {
            return Err(KciError::KernelMemory("not an ELF image".to_string()));
        }
        if ehdr[4] != ELFCLASS64 || ehdr[5] != ELFDATA2LSB {
            return Err(KciError::KernelMemory(
                "only little-endian ELF64 images are supported".to_string(),
            ));
        }

        let phoff = u64_at(&ehdr, 0x20);
        let phentsize = u16_at(&ehdr, 0x36) as usize;
        let phnum = u16_at(&ehdr, 0x38);

        if phnum == PN_XNUM {
            return Err(KciError::KernelMemory(
                "extended program header count is not supported".to_string(),
            ));
        }
        if phentsize < PHDR_SIZE {
            return Err(KciError::KernelMemory(format!(
                "program header entries of {phentsize} bytes are too small"
            )));
        }

        let mut table = vec![0u8; phentsize * phnum as usize];
        file.read_exact_at(&mut table, phoff)?;

        let segments = table
            .chunks_exact(phentsize)
            .filter(|phdr| u32_at(phdr, 0) == PT_LOAD)
            .map(|phdr| Segment {
                offset: u64_at(phdr, 8),
                vaddr: u64_at(phdr, 16),
                size: u64_at(phdr, 32),
            })
            .collect();

        Ok(Kcore { file, segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Reads one native word at kernel virtual address `vaddr`.
    pub fn read_u64(&self, vaddr: u64) -> Result<u64, KciError> {
        let segment = self
            .segments
            .iter()
            .find(|segment| segment.contains(vaddr, 8))
            .ok_or_else(|| KciError::KernelMemory(format!("{vaddr:#x} is not mapped")))?;

        let mut word = [0u8; 8];
        self.file
            .read_exact_at(&mut word, segment.offset + (vaddr - segment.vaddr))?;

        Ok(u64::from_ne_bytes(word))
    }
}
