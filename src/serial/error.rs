use std::{io, path::PathBuf};

use thiserror::Error;

/// Problems opening or configuring a serial device.
#[derive(Debug, Error)]
pub enum SerialPortError {
    /// The device node could not be opened.
    #[error("Cannot open `{path}`")]
    Open {
        /// The device path.
        path: PathBuf,

        /// The underlying problem.
        #[source]
        source: io::Error,
    },

    /// The device was opened but the terminal settings could not be applied.
    #[error("Cannot configure `{path}` for raw 8N1")]
    Configure {
        /// The device path.
        path: PathBuf,

        /// The underlying problem.
        #[source]
        source: nix::Error,
    },

    /// The device could not be opened for proxying.
    #[error("Cannot open `{path}` for proxying")]
    Proxy {
        /// The device path.
        path: PathBuf,

        /// The underlying problem.
        #[source]
        source: tokio_serial::Error,
    },

    /// No pseudo-terminal could be set up.
    #[error("Cannot set up a pseudo-terminal")]
    Pty(#[source] nix::Error),

    /// The rate is not one the terminal layer knows.
    #[error("Unsupported baud rate {0}")]
    UnsupportedBaud(u32),

    /// IO related errors.
    #[error("Underlying IO problem")]
    IO(#[from] io::Error),
}
