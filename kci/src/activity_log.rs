// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use kci_common::Operation;
use log::{debug, trace};

use crate::error::KciError;

/// One line of the log, in the layout readers of the `calls` file expect.
pub fn format_entry(fd: i32, pid: u32, op: Operation, requested: u64, actual: i64) -> String {
    format!(
        "FD = {fd}; PID = {pid}; Tried to {} {requested} bytes, Succeeded - {actual}\n",
        op.as_str()
    )
}

/// File view of the log, rewritten after every append.
pub struct LogMirror {
    dir: PathBuf,
    path: PathBuf,
}

impl LogMirror {
    pub fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join("calls");
        fs::write(&path, b"")?;
        debug!("Mirroring activity log to {}", path.display());
        Ok(LogMirror {
            dir: dir.to_path_buf(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, contents: &[u8]) -> io::Result<()> {
        fs::write(&self.path, contents)
    }

    /// Removes the file, and the directory if nothing else lives there.
    pub fn remove(self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => (),
        }
        match fs::remove_dir(&self.dir) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => Ok(()),
            other => other,
        }
    }
}

struct Buffer {
    bytes: Vec<u8>,
    /// Bumped every time the bytes are dropped, so readers can tell a log that
    /// only grew from one that started over.
    generation: u64,
}

/// Fixed-capacity text log. When an entry does not fit, the whole buffer is
/// dropped and the entry starts a fresh one.
pub struct ActivityLog {
    capacity: usize,
    buffer: Mutex<Buffer>,
    mirror: Mutex<Option<LogMirror>>,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        ActivityLog {
            capacity,
            buffer: Mutex::new(Buffer {
                bytes: Vec::with_capacity(capacity),
                generation: 0,
            }),
            mirror: Mutex::new(None),
        }
    }

    pub fn with_mirror(capacity: usize, mirror: LogMirror) -> Self {
        ActivityLog {
            mirror: Mutex::new(Some(mirror)),
            ..Self::new(capacity)
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_entry_len(&self) -> usize {
        self.capacity / 2
    }

    /// Stops mirroring; the caller decides what happens to the file.
    pub fn take_mirror(&self) -> Option<LogMirror> {
        self.mirror
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn append(
        &self,
        fd: i32,
        pid: u32,
        op: Operation,
        requested: u64,
        actual: i64,
    ) -> Result<(), KciError> {
        let line = format_entry(fd, pid, op, requested, actual);
        if line.len() > self.max_entry_len() {
            return Err(KciError::LogFormatError {
                len: line.len(),
                max: self.max_entry_len(),
            });
        }

        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.bytes.len() + line.len() > self.capacity {
            trace!("Activity log full at {} bytes, clearing", buffer.bytes.len());
            buffer.bytes.clear();
            buffer.generation += 1;
        }
        buffer.bytes.extend_from_slice(line.as_bytes());

        let mirror = self.mirror.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mirror) = mirror.as_ref() {
            mirror.write(&buffer.bytes)?;
        }

        Ok(())
    }

    /// Up to `len` bytes starting at `offset`; empty at or past the end.
    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes = &buffer.bytes;
        let Some(start) = usize::try_from(offset).ok().filter(|&start| start < bytes.len())
        else {
            return vec![];
        };
        let end = start.saturating_add(len).min(bytes.len());
        bytes[start..end].to_vec()
    }

    pub fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes
            .len()
    }

    /// How many times the log has been cleared to make room.
    pub fn generation(&self) -> u64 {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes
            .clone()
    }
}
