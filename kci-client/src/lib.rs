use std::{
    ffi::OsString,
    io,
    path::Path,
    process::Stdio,
    time::{Duration, Instant},
};

use kci_common::SERVICE_NAME;
use tokio::{process::Command, time::sleep};
use zbus::{
    Error as ZBusError, fdo,
    names::{BusName, WellKnownName},
    proxy,
};

/// Bytes requested per `ReadLog` round trip.
pub const LOG_CHUNK: u32 = 4096;

/// Times a log read is restarted because the daemon cleared the log under it.
pub const LOG_READ_ATTEMPTS: usize = 8;

#[proxy(interface = "org.kci.Service", default_path = "/org/kci/Service")]
pub trait Kci {
    fn set_pid(&self, pid: i32) -> zbus::Result<()>;
    fn set_fd(&self, fd: i32) -> zbus::Result<()>;
    fn cipher(&self, enabled: u32) -> zbus::Result<()>;
    fn command(&self, request: u32, param: u64) -> zbus::Result<()>;
    fn read_log(&self, offset: u64, length: u32) -> zbus::Result<Vec<u8>>;
    fn log_size(&self) -> zbus::Result<u64>;
    fn log_generation(&self) -> zbus::Result<u64>;
    fn status(&self) -> zbus::Result<(i32, i32, bool)>;
    fn unload(&self) -> zbus::Result<()>;
}

/// Sign-extends a target the way an `unsigned long` ioctl argument carries it.
pub fn ioctl_param(value: i32) -> u64 {
    value as i64 as u64
}

async fn connection() -> Result<zbus::Connection, ZBusError> {
    let (connection, bus_type) = match std::env::var("KCID_USE_SESSION_BUS") {
        Ok(value) if value == "true" => (zbus::Connection::session().await?, "session"),
        _ => (zbus::Connection::system().await?, "system"),
    };

    log::trace!("Connected to {bus_type} bus");

    Ok(connection)
}

pub async fn connect_to_server<'d>() -> Result<KciProxy<'d>, ZBusError> {
    let connection = connection().await?;
    let destination = WellKnownName::try_from(SERVICE_NAME)?;
    KciProxy::new(&connection, destination).await
}

async fn proxy<'d>() -> KciProxy<'d> {
    match connect_to_server().await {
        Ok(proxy) => proxy,
        Err(e) => handle_dbus_error(e),
    }
}

pub async fn send_command(request: u32, param: u64) {
    if let Err(e) = proxy().await.command(request, param).await {
        handle_dbus_error(e);
    }
}

pub async fn status() -> (i32, i32, bool) {
    match proxy().await.status().await {
        Ok(status) => status,
        Err(e) => handle_dbus_error(e),
    }
}

/// Where a chunked log read gets its data from.
#[allow(async_fn_in_trait)]
pub trait LogSource {
    async fn generation(&self) -> zbus::Result<u64>;
    async fn read(&self, offset: u64, length: u32) -> zbus::Result<Vec<u8>>;
}

impl LogSource for KciProxy<'_> {
    async fn generation(&self) -> zbus::Result<u64> {
        self.log_generation().await
    }

    async fn read(&self, offset: u64, length: u32) -> zbus::Result<Vec<u8>> {
        self.read_log(offset, length).await
    }
}

/// Reads the whole log in `LOG_CHUNK` pieces. The log is cleared when it fills
/// up, so the chunks only belong together if no clear happened in between;
/// otherwise the read starts over.
pub async fn read_whole_log<S: LogSource>(source: &S) -> zbus::Result<Vec<u8>> {
    let mut contents = Vec::new();

    for attempt in 1..=LOG_READ_ATTEMPTS {
        let before = source.generation().await?;

        contents.clear();
        loop {
            let chunk = source.read(contents.len() as u64, LOG_CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            contents.extend_from_slice(&chunk);
        }

        if source.generation().await? == before {
            return Ok(contents);
        }
        log::debug!("Log was cleared while reading it (attempt {attempt})");
    }

    log::warn!("Log kept changing, returning the last {} bytes read", contents.len());
    Ok(contents)
}

/// The whole activity log of the running daemon.
pub async fn fetch_log() -> Vec<u8> {
    match read_whole_log(&proxy().await).await {
        Ok(contents) => contents,
        Err(e) => handle_dbus_error(e),
    }
}

pub async fn unload() {
    if let Err(e) = proxy().await.unload().await {
        handle_dbus_error(e);
    }
}

pub async fn service_running() -> Result<bool, ZBusError> {
    let connection = connection().await?;
    let name = BusName::try_from(SERVICE_NAME)?;
    Ok(fdo::DBusProxy::new(&connection)
        .await?
        .name_has_owner(name)
        .await?)
}

/// Starts the daemon in its own process group and waits until it owns its bus
/// name. Returns the daemon's pid.
pub async fn spawn_daemon(program: &Path, args: &[OsString], timeout: Duration) -> io::Result<u32> {
    if unsafe { libc::geteuid() } != 0 {
        log::warn!("Not running as root, the daemon will most likely fail to load");
    }

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .process_group(0)
        .spawn()?;
    let pid = child.id().unwrap_or_default();

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(io::Error::other(format!(
                "{} exited before serving: {status}",
                program.display()
            )));
        }

        match service_running().await {
            Ok(true) => return Ok(pid),
            Ok(false) => (),
            Err(e) => log::debug!("Waiting for {SERVICE_NAME}: {e}"),
        }

        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{SERVICE_NAME} did not appear within {timeout:?}"),
            ));
        }

        sleep(Duration::from_millis(100)).await;
    }
}

pub fn handle_dbus_error(error: ZBusError) -> ! {
    match error {
        // Connection-related errors
        ZBusError::InputOutput(io_err) => {
            eprintln!("Failed to connect to D-Bus: {io_err}");
            eprintln!("Make sure the D-Bus system bus is running and accessible.");
            std::process::exit(2);
        }
        ZBusError::Address(addr) => {
            eprintln!("Invalid D-Bus address: {addr}");
            eprintln!("The D-Bus system bus address may be misconfigured.");
            std::process::exit(2);
        }
        ZBusError::Handshake(msg) => {
            eprintln!("D-Bus authentication failed: {msg}");
            eprintln!("You may not have permission to access the system D-Bus.");
            std::process::exit(2);
        }

        // Service-related errors
        ZBusError::MethodError(error_name, description, _) => match error_name.as_str() {
            "org.freedesktop.DBus.Error.ServiceUnknown" => {
                eprintln!("KCI service is not running.");
                eprintln!("Please start it with `kci init <path to kcid>` first.");
                std::process::exit(3);
            }
            "org.freedesktop.DBus.Error.AccessDenied" | "org.freedesktop.DBus.Error.AuthFailed" => {
                eprintln!("Permission denied: only root may control the interceptor.");
                std::process::exit(4);
            }
            "org.freedesktop.DBus.Error.NoReply" | "org.freedesktop.DBus.Error.TimedOut" => {
                eprintln!("Timeout: the kci service didn't respond in time.");
                std::process::exit(5);
            }
            "org.freedesktop.DBus.Error.InvalidArgs" => {
                if let Some(desc) = description {
                    eprintln!("Invalid arguments: {desc}");
                } else {
                    eprintln!("Invalid arguments provided to the kci service.");
                }
                std::process::exit(6);
            }
            _ => {
                eprintln!("D-Bus method call failed: {error_name}");
                if let Some(desc) = description {
                    eprintln!("Details: {desc}");
                }
                std::process::exit(7);
            }
        },

        // Proxy/Interface errors
        ZBusError::InterfaceNotFound => {
            eprintln!("KCI service interface not found.");
            eprintln!("The running kcid may be incompatible with this client version.");
            std::process::exit(8);
        }

        // FDO standard errors
        ZBusError::FDO(fdo_error) => match *fdo_error {
            fdo::Error::ServiceUnknown(_) => {
                eprintln!("KCI service is not running.");
                eprintln!("Please start it with `kci init <path to kcid>` first.");
                std::process::exit(3);
            }
            fdo::Error::AccessDenied(_) | fdo::Error::AuthFailed(_) => {
                eprintln!("Permission denied: only root may control the interceptor.");
                std::process::exit(4);
            }
            fdo::Error::NoReply(_) | fdo::Error::TimedOut(_) => {
                eprintln!("Timeout: the kci service didn't respond in time.");
                std::process::exit(5);
            }
            fdo::Error::InvalidArgs(ref msg) => {
                eprintln!("Invalid arguments: {msg}");
                std::process::exit(6);
            }
            fdo::Error::UnknownMethod(ref msg) => {
                eprintln!("Method not supported: {msg}");
                eprintln!("The running kcid may be incompatible with this client version.");
                std::process::exit(8);
            }
            _ => {
                eprintln!("D-Bus error: {fdo_error}");
                std::process::exit(7);
            }
        },

        // Generic/Other errors
        _ => {
            eprintln!("Unexpected D-Bus error: {error}");
            std::process::exit(1);
        }
    }
}
