//! Proxy mode: the daemon owns the device read-write and exclusively,
//! and exposes it to other tools through a pseudo-terminal.
//!
//! Device output is logged and copied to the pseudo-terminal.
//! Whatever a tool writes into the pseudo-terminal goes to the device.
//! This is the only path on which the daemon writes to a device.

use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use nix::{
    fcntl::{self, FcntlArg, OFlag},
    pty,
    sys::termios::{self, SetArg},
    unistd,
};
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWriteExt, ReadBuf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

use crate::{
    fd,
    serial::{error::SerialPortError, passthrough::poll_read_fd, Baud},
};

/// A raw pseudo-terminal pair.
///
/// The slave side is held open for as long as the pair lives,
/// so the master never sees a hang-up when tools come and go.
#[derive(Debug)]
pub struct PtyPair {
    master: AsyncFd<File>,
    _slave: File,
    slave_path: PathBuf,
}

impl PtyPair {
    /// Allocate a new pair, with the slave in raw mode.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open() -> Result<Self, SerialPortError> {
        let pty = pty::openpty(None, None).map_err(SerialPortError::Pty)?;
        let (master, slave) = (File::from(pty.master), File::from(pty.slave));

        let slave_path = unistd::ttyname(&slave).map_err(SerialPortError::Pty)?;

        let mut tty = termios::tcgetattr(&slave).map_err(SerialPortError::Pty)?;
        termios::cfmakeraw(&mut tty);
        termios::tcsetattr(&slave, SetArg::TCSANOW, &tty).map_err(SerialPortError::Pty)?;

        fcntl::fcntl(&master, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(SerialPortError::Pty)?;

        Ok(Self {
            master: fd::register(master)?,
            _slave: slave,
            slave_path,
        })
    }

    /// Where tools attach, e.g. `/dev/pts/7`.
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    pub(crate) fn poll_read(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        poll_read_fd(&self.master, cx, buf)
    }

    /// Write as much of `data` as fits without blocking.
    ///
    /// Returns how many bytes were written.
    /// When no tool drains the pseudo-terminal, the rest is dropped.
    pub fn try_write(&self, data: &[u8]) -> io::Result<usize> {
        let mut written = 0;

        while written < data.len() {
            match Write::write(&mut self.master.get_ref(), &data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }
}

/// A device opened read-write, shared through a [`PtyPair`].
#[derive(Debug)]
pub struct ProxyPort {
    path: PathBuf,
    device: SerialStream,
    pty: PtyPair,
}

impl ProxyPort {
    pub(crate) fn open(path: &Path, baud: Baud) -> Result<Self, SerialPortError> {
        let device = tokio_serial::new(path.to_string_lossy(), baud.rate())
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|source| SerialPortError::Proxy {
                path: path.into(),
                source,
            })?;

        let pty = PtyPair::open()?;

        debug!(path = %path.display(), pty = %pty.slave_path().display(), %baud, "Opened for proxying");

        Ok(Self {
            path: path.into(),
            device,
            pty,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// The pseudo-terminal tools attach to.
    pub fn pty(&self) -> &PtyPair {
        &self.pty
    }

    pub(crate) fn poll_read_device(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.device).poll_read(cx, buf)
    }

    /// Put bytes a tool wrote into the pseudo-terminal onto the wire.
    pub async fn write_to_device(&mut self, data: &[u8]) -> io::Result<()> {
        AsyncWriteExt::write_all(&mut self.device, data).await?;
        AsyncWriteExt::flush(&mut self.device).await
    }
}
