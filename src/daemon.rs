//! Process-level concerns: running as a single instance, and telling
//! a service manager how start-up and shutdown are going.

use std::{
    ffi::OsStr,
    fs, io,
    os::unix::{ffi::OsStrExt, net::UnixDatagram},
    path::{Path, PathBuf},
};

use nix::{errno::Errno, sys::signal, unistd::Pid};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// File name of the pid file inside the log root.
pub const PID_FILE: &str = "uart-monitor.pid";

/// Holds the pid file for as long as it lives.
///
/// The file is removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim `path` for this process.
    ///
    /// Fails if another live process holds it.
    /// A file left behind by a process that is gone is replaced.
    pub fn acquire(path: &Path) -> Result<Self> {
        let ours = std::process::id() as i32;

        if let Ok(text) = fs::read_to_string(path) {
            match text.trim().parse::<i32>() {
                Ok(pid) if pid != ours && pid > 0 && is_alive(pid) => {
                    return Err(Error::AlreadyRunning(pid))
                }
                _ => warn!(path = %path.display(), "Replacing stale pid file"),
            }
        }

        fs::write(path, format!("{ours}\n"))
            .map_err(|e| Error::io(format!("Cannot write pid file {}", path.display()), e))?;

        debug!(path = %path.display(), pid = ours, "Pid file written");

        Ok(Self { path: path.into() })
    }

    /// Where the pid file is.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_alive(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists, but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Service manager notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    /// Start-up is complete.
    Ready,

    /// Shutdown has begun.
    Stopping,
}

impl Notify {
    fn message(self) -> &'static str {
        match self {
            Notify::Ready => "READY=1",
            Notify::Stopping => "STOPPING=1",
        }
    }
}

/// Tell the service manager about `state`, if one is listening on `$NOTIFY_SOCKET`.
///
/// Returns whether a notification was sent.
pub fn notify(state: Notify) -> io::Result<bool> {
    match std::env::var_os("NOTIFY_SOCKET") {
        Some(socket) => notify_to(&socket, state).map(|()| true),
        None => Ok(false),
    }
}

/// As [`notify`], but to the given socket.
/// A leading `@` names an abstract socket.
pub fn notify_to(socket: &OsStr, state: Notify) -> io::Result<()> {
    let sender = UnixDatagram::unbound()?;
    let message = state.message().as_bytes();

    match socket.as_bytes().split_first() {
        Some((b'@', name)) => {
            use std::os::{linux::net::SocketAddrExt, unix::net::SocketAddr};

            let addr = SocketAddr::from_abstract_name(name)?;
            sender.send_to_addr(message, &addr)?;
        }
        _ => {
            sender.send_to(message, Path::new(socket))?;
        }
    }

    debug!(message = state.message(), "Service manager notified");

    Ok(())
}
