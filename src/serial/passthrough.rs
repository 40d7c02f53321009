//! Read-only device access.
//!
//! The device is opened `O_RDONLY | O_NOCTTY | O_NONBLOCK` and is never
//! written to. No exclusive lock is taken, so other readers may coexist.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    task::{Context, Poll},
};

use futures::ready;
use nix::sys::termios::{self, ControlFlags, SetArg, SpecialCharacterIndices};
use tokio::io::{unix::AsyncFd, ReadBuf};
use tracing::debug;

use crate::{
    fd,
    serial::{error::SerialPortError, Baud},
};

/// A device opened for reading only.
#[derive(Debug)]
pub struct PassthroughPort {
    path: PathBuf,
    fd: AsyncFd<File>,
}

impl PassthroughPort {
    pub(crate) fn open(path: &Path, baud: Baud) -> Result<Self, SerialPortError> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_NOCTTY | nix::libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| SerialPortError::Open {
                path: path.into(),
                source,
            })?;

        configure_raw(&file, path, baud)?;

        debug!(path = %path.display(), %baud, "Opened read-only");

        Ok(Self {
            path: path.into(),
            fd: fd::register(file)?,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn poll_read(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        poll_read_fd(&self.fd, cx, buf)
    }
}

/// Read whatever is available from a non-blocking descriptor,
/// registering interest in readability if nothing is.
pub(crate) fn poll_read_fd(
    fd: &AsyncFd<File>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<io::Result<()>> {
    loop {
        let mut guard = ready!(fd.poll_read_ready(cx))?;

        let unfilled = buf.initialize_unfilled();
        match guard.try_io(|inner| Read::read(&mut inner.get_ref(), unfilled)) {
            Ok(Ok(n)) => {
                buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Poll::Ready(Err(e)),
            Err(_would_block) => continue,
        }
    }
}

/// Raw mode, 8 data bits, no parity, one stop bit, no flow control.
/// With `VMIN=1` a non-blocking read reports `EAGAIN` when empty, so a
/// zero length read only ever means the device is gone.
pub(crate) fn configure_raw(
    file: &File,
    path: &Path,
    baud: Baud,
) -> Result<(), SerialPortError> {
    let configure_error = |source| SerialPortError::Configure {
        path: path.into(),
        source,
    };

    let mut tty = termios::tcgetattr(file).map_err(configure_error)?;

    termios::cfmakeraw(&mut tty);
    tty.control_flags &= !(ControlFlags::PARENB
        | ControlFlags::CSTOPB
        | ControlFlags::CSIZE
        | ControlFlags::CRTSCTS);
    tty.control_flags |= ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;
    tty.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    tty.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::cfsetspeed(&mut tty, baud.to_termios()?).map_err(configure_error)?;
    termios::tcsetattr(file, SetArg::TCSANOW, &tty).map_err(configure_error)?;

    Ok(())
}
