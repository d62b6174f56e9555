// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Gustavo Noronha Silva <gustavo@noronha.dev.br>

use std::sync::Arc;

use aya::maps::{Array, MapData};
use log::{info, trace};
use tokio::sync::{Mutex, Notify};
use zbus::{fdo, fdo::DBusProxy, message::Header, names::BusName};

use crate::{activity_log::ActivityLog, control::Control, error::KciError};

pub type ControlMap = Array<MapData, u64>;
pub type SharedControl = Arc<Mutex<Control<ControlMap>>>;

/// Largest log chunk handed out by a single `ReadLog` call.
pub const MAX_READ_CHUNK: u32 = 64 * 1024;

impl From<KciError> for fdo::Error {
    fn from(error: KciError) -> Self {
        match error {
            KciError::UnknownCommand(_) => fdo::Error::InvalidArgs(error.to_string()),
            _ => fdo::Error::Failed(error.to_string()),
        }
    }
}

/// Only a trusted operator may reconfigure the interceptor or read what it logged.
async fn require_root(header: &Header<'_>, conn: &zbus::Connection) -> fdo::Result<()> {
    let sender = header
        .sender()
        .ok_or_else(|| fdo::Error::AccessDenied("Message has no sender".to_string()))?;
    let bus_name =
        BusName::try_from(sender.as_str()).map_err(|e| fdo::Error::Failed(e.to_string()))?;

    let caller_uid = DBusProxy::new(conn)
        .await
        .map_err(|e| fdo::Error::AuthFailed(e.to_string()))?
        .get_connection_unix_user(bus_name)
        .await
        .map_err(|e| fdo::Error::AuthFailed(e.to_string()))?;

    trace!("dbus request came from uid {caller_uid}");

    if caller_uid == 0 {
        Ok(())
    } else {
        Err(fdo::Error::AccessDenied("Not authorized".to_string()))
    }
}

pub struct KciService {
    control: SharedControl,
    log: Arc<ActivityLog>,
    shutdown: Arc<Notify>,
}

impl KciService {
    pub fn new(control: SharedControl, log: Arc<ActivityLog>, shutdown: Arc<Notify>) -> Self {
        KciService {
            control,
            log,
            shutdown,
        }
    }
}

#[zbus::interface(name = "org.kci.Service")]
impl KciService {
    async fn set_pid(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
        pid: i32,
    ) -> fdo::Result<()> {
        require_root(&header, conn).await?;
        self.control.lock().await.set_pid(pid)?;
        Ok(())
    }

    async fn set_fd(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
        fd: i32,
    ) -> fdo::Result<()> {
        require_root(&header, conn).await?;
        self.control.lock().await.set_fd(fd)?;
        Ok(())
    }

    async fn cipher(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
        enabled: u32,
    ) -> fdo::Result<()> {
        require_root(&header, conn).await?;
        self.control.lock().await.set_cipher(enabled != 0)?;
        Ok(())
    }

    /// ioctl-compatible entry point taking the raw request code and argument.
    async fn command(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
        request: u32,
        param: u64,
    ) -> fdo::Result<()> {
        require_root(&header, conn).await?;
        self.control.lock().await.dispatch(request, param)?;
        Ok(())
    }

    async fn read_log(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
        offset: u64,
        length: u32,
    ) -> fdo::Result<Vec<u8>> {
        require_root(&header, conn).await?;
        Ok(self
            .log
            .read(offset, length.min(MAX_READ_CHUNK) as usize))
    }

    async fn log_size(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> fdo::Result<u64> {
        require_root(&header, conn).await?;
        Ok(self.log.len() as u64)
    }

    /// Changes whenever the log is cleared, so a reader can tell its chunks apart.
    async fn log_generation(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> fdo::Result<u64> {
        require_root(&header, conn).await?;
        Ok(self.log.generation())
    }

    async fn status(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> fdo::Result<(i32, i32, bool)> {
        require_root(&header, conn).await?;
        let state = self.control.lock().await.state();
        Ok((state.target_pid, state.target_fd, state.transform_enabled))
    }

    async fn unload(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> fdo::Result<()> {
        require_root(&header, conn).await?;
        info!("Unload requested over D-Bus");
        self.shutdown.notify_one();
        Ok(())
    }
}
