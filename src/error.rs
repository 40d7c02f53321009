use std::{io, path::PathBuf};

use thiserror::Error;

use crate::serial::error::SerialPortError;

/// Errors that may occur in this library.
#[derive(Debug, Error)]
pub enum Error {
    /// No monitored port has this device path.
    #[error("port not found: {0}")]
    PortNotFound(PathBuf),

    /// The registry already holds an entry for this device path.
    #[error("The port `{0}` is already monitored")]
    AlreadyMonitored(PathBuf),

    /// The device allow-list does not include this port.
    #[error("The port `{0}` is excluded by the device filter")]
    Filtered(PathBuf),

    /// Adding another port would exceed the registry capacity.
    #[error("Cannot monitor `{path}`, the registry is full ({capacity} ports)")]
    RegistryFull {
        /// The rejected port.
        path: PathBuf,

        /// How many ports may be monitored at once.
        capacity: usize,
    },

    /// The serial device could not be (re)opened.
    #[error("cannot reopen {path}")]
    CannotReopen {
        /// The device path.
        path: PathBuf,

        /// Why opening failed.
        #[source]
        source: SerialPortError,
    },

    /// Problem with the serial access layer.
    #[error(transparent)]
    Serial(#[from] SerialPortError),

    /// Another daemon holds the pid file.
    #[error("Another instance is running (pid {0})")]
    AlreadyRunning(i32),

    /// The configuration was not valid.
    #[error("The configuration is not valid. Problem: {0}")]
    BadConfig(String),

    /// Some file system or socket operation failed.
    #[error("{context}")]
    Io {
        /// What we were trying to do.
        context: String,

        /// The underlying problem.
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wrap an [`io::Error`] with a description of what was being attempted.
    pub fn io<S: Into<String>>(context: S, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// If the error is a bad configuration, get the problem description.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}

/// Convenience alias for results in this library.
pub type Result<T, E = Error> = std::result::Result<T, E>;
