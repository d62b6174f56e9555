// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use std::borrow::BorrowMut;

use aya::maps::{Array, MapData};
use kci_common::{ControlCommand, ControlState, UNSET};
use log::{debug, info};

use crate::error::KciError;

/// Where the packed control word goes so the shims can see it.
pub trait ControlSink {
    fn publish(&mut self, word: u64) -> Result<(), KciError>;
}

impl<T: BorrowMut<MapData>> ControlSink for Array<T, u64> {
    fn publish(&mut self, word: u64) -> Result<(), KciError> {
        self.set(0, word, 0)?;
        Ok(())
    }
}

fn target(value: i32) -> i32 {
    if value < 0 {
        UNSET
    } else {
        value
    }
}

/// Owner of the control state. Each setter changes one field and republishes
/// the whole word; the state is only committed once the publish succeeded.
pub struct Control<S> {
    state: ControlState,
    sink: S,
}

impl<S: ControlSink> Control<S> {
    pub fn new(mut sink: S) -> Result<Self, KciError> {
        sink.publish(ControlState::UNSET.to_word())?;
        Ok(Control {
            state: ControlState::UNSET,
            sink,
        })
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn update(&mut self, next: ControlState) -> Result<ControlState, KciError> {
        self.sink.publish(next.to_word())?;
        self.state = next;
        debug!("Control state is now {next:?}");
        Ok(next)
    }

    pub fn set_pid(&mut self, pid: i32) -> Result<ControlState, KciError> {
        self.update(ControlState {
            target_pid: target(pid),
            ..self.state
        })
    }

    pub fn set_fd(&mut self, fd: i32) -> Result<ControlState, KciError> {
        self.update(ControlState {
            target_fd: target(fd),
            ..self.state
        })
    }

    pub fn set_cipher(&mut self, enabled: bool) -> Result<ControlState, KciError> {
        let state = self.update(ControlState {
            transform_enabled: enabled,
            ..self.state
        })?;
        info!(
            "Transform {} for pid {} fd {}",
            if enabled { "enabled" } else { "disabled" },
            state.target_pid,
            state.target_fd
        );
        Ok(state)
    }

    /// Applies an ioctl-style `(request, param)` pair. `param` is truncated to the
    /// target's width the way the C ABI would.
    pub fn dispatch(&mut self, request: u32, param: u64) -> Result<ControlState, KciError> {
        match ControlCommand::from_request(request) {
            Some(ControlCommand::SetPid) => self.set_pid(param as i32),
            Some(ControlCommand::SetFd) => self.set_fd(param as i32),
            Some(ControlCommand::Cipher) => self.set_cipher(param != 0),
            None => Err(KciError::UnknownCommand(request)),
        }
    }

    pub fn reset(&mut self) -> Result<ControlState, KciError> {
        self.update(ControlState::UNSET)
    }
}
