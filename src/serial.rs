use std::{
    fmt::Display,
    io,
    path::Path,
    task::{Context, Poll},
};

use nix::sys::termios::BaudRate;
use serde::{Deserialize, Serialize};
use tokio::io::ReadBuf;

use crate::serial::{error::SerialPortError, passthrough::PassthroughPort, proxy::ProxyPort};

/// Serial port related errors.
pub mod error;

/// Read-only access to a device.
pub(crate) mod passthrough;

/// Read-write access to a device, shared via a pseudo-terminal.
pub mod proxy;

/// How many bytes are read from a device per readiness event.
pub const READ_BUF_SIZE: usize = 4096;

/// A line rate a serial port can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Baud(u32);

impl Baud {
    /// Create a baud rate.
    /// Fails if the rate is not one the terminal layer supports.
    pub fn new(rate: u32) -> Result<Self, SerialPortError> {
        let baud = Self(rate);
        baud.to_termios()?;
        Ok(baud)
    }

    /// The numeric rate, e.g. `115200`.
    pub fn rate(self) -> u32 {
        self.0
    }

    pub(crate) fn to_termios(self) -> Result<BaudRate, SerialPortError> {
        let rate = match self.0 {
            9_600 => BaudRate::B9600,
            19_200 => BaudRate::B19200,
            38_400 => BaudRate::B38400,
            57_600 => BaudRate::B57600,
            115_200 => BaudRate::B115200,
            230_400 => BaudRate::B230400,
            460_800 => BaudRate::B460800,
            921_600 => BaudRate::B921600,
            1_000_000 => BaudRate::B1000000,
            1_500_000 => BaudRate::B1500000,
            2_000_000 => BaudRate::B2000000,
            3_000_000 => BaudRate::B3000000,
            4_000_000 => BaudRate::B4000000,
            other => return Err(SerialPortError::UnsupportedBaud(other)),
        };

        Ok(rate)
    }
}

impl Default for Baud {
    fn default() -> Self {
        Self(115_200)
    }
}

impl Display for Baud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a device is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialMode {
    /// Read-only. Nothing is ever written to the device.
    #[default]
    Passthrough,

    /// Read-write, with the device exposed to other tools via a pseudo-terminal.
    Proxy,
}

/// Something that happened on an open serial port.
#[derive(Debug)]
pub enum PortActivity {
    /// The device produced output.
    Output(Vec<u8>),

    /// A tool wrote these bytes into the proxy pseudo-terminal.
    ProxyInput(Vec<u8>),

    /// The device reached end-of-file, i.e. it went away.
    Closed,

    /// Reading the device failed.
    Failed(io::Error),

    /// Reading the proxy pseudo-terminal failed.
    ProxyFailed(io::Error),
}

/// An open serial device.
///
/// Dropping the port closes every descriptor it holds.
#[derive(Debug)]
pub enum SerialPort {
    /// See [`SerialMode::Passthrough`].
    Passthrough(PassthroughPort),

    /// See [`SerialMode::Proxy`].
    Proxy(ProxyPort),
}

impl SerialPort {
    /// Open the device at `path`, configured for raw 8N1 at the given rate.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(path: &Path, baud: Baud, mode: SerialMode) -> Result<Self, SerialPortError> {
        match mode {
            SerialMode::Passthrough => PassthroughPort::open(path, baud).map(Self::Passthrough),
            SerialMode::Proxy => ProxyPort::open(path, baud).map(Self::Proxy),
        }
    }

    /// The device path.
    pub fn path(&self) -> &Path {
        match self {
            SerialPort::Passthrough(port) => port.path(),
            SerialPort::Proxy(port) => port.path(),
        }
    }

    /// The mode the port was opened in.
    pub fn mode(&self) -> SerialMode {
        match self {
            SerialPort::Passthrough(_) => SerialMode::Passthrough,
            SerialPort::Proxy(_) => SerialMode::Proxy,
        }
    }

    /// Where tools may attach when in proxy mode.
    pub fn proxy_path(&self) -> Option<&Path> {
        match self {
            SerialPort::Passthrough(_) => None,
            SerialPort::Proxy(port) => Some(port.pty().slave_path()),
        }
    }

    pub(crate) fn poll_activity(&mut self, cx: &mut Context<'_>) -> Poll<PortActivity> {
        let mut buf = [0u8; READ_BUF_SIZE];

        let device = {
            let mut read_buf = ReadBuf::new(&mut buf);
            let result = match self {
                SerialPort::Passthrough(port) => port.poll_read(cx, &mut read_buf),
                SerialPort::Proxy(port) => port.poll_read_device(cx, &mut read_buf),
            };
            result.map(|result| device_activity(result, read_buf.filled()))
        };

        if device.is_ready() {
            return device;
        }

        let SerialPort::Proxy(port) = self else {
            return Poll::Pending;
        };

        let mut read_buf = ReadBuf::new(&mut buf);
        port.pty()
            .poll_read(cx, &mut read_buf)
            .map(|result| match result {
                Ok(()) if read_buf.filled().is_empty() => {
                    PortActivity::ProxyFailed(io::ErrorKind::UnexpectedEof.into())
                }
                Ok(()) => PortActivity::ProxyInput(read_buf.filled().to_vec()),
                Err(e) => PortActivity::ProxyFailed(e),
            })
    }

    /// Wait for the next thing to happen on this port.
    pub async fn next_activity(&mut self) -> PortActivity {
        futures::future::poll_fn(|cx| self.poll_activity(cx)).await
    }
}

fn device_activity(result: io::Result<()>, filled: &[u8]) -> PortActivity {
    match result {
        Ok(()) if filled.is_empty() => PortActivity::Closed,
        Ok(()) => PortActivity::Output(filled.to_vec()),
        Err(e) => PortActivity::Failed(e),
    }
}
