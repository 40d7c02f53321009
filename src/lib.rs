#![deny(missing_docs)]

//! This crate captures the output of USB-serial ports on a development host.
//!
//! Every port matching `/dev/ttyUSB*`, `/dev/ttyACM*` or `/dev/ttyUART*` is
//! opened read-only and its output is written, line by line and timestamped,
//! to `<log-root>/session-<date>-<time>/<label>.log`.
//! The label is derived from what is known about the USB device,
//! e.g. `VMK180_UART0`.
//!
//! A single-threaded [`reactor::Reactor`] owns all ports and waits on
//! - the ports themselves,
//! - a hot-plug monitor (kernel uevents, or inotify on `/dev` as fallback),
//! - a control socket accepting `YIELD`, `RECLAIM`, `STATUS` and `QUIT`,
//! - and signals.
//!
//! Yielding closes the device so e.g. a flashing tool can use it,
//! while the log stays open. Reclaiming reopens it.
//!
//! In proxy mode ports are opened read-write, and each one is shared with
//! other tools through a pseudo-terminal.

/// The command line interface.
pub mod cli;

/// Daemon configuration.
pub mod config;

/// The local control socket and its line protocol.
pub mod control;

/// Single-instance guard and service manager notification.
pub mod daemon;

/// Possible errors in this library.
pub mod error;

mod fd;

/// Device arrival and removal.
pub mod hotplug;

/// Finding out what is behind a tty.
pub mod identify;

/// Diagnostics.
pub mod logging;

/// The event loop tying everything together.
pub mod reactor;

/// The set of monitored ports.
pub mod registry;

/// Opening and reading serial devices.
pub mod serial;

/// Session directories and the per-port log files in them.
pub mod session;

/// The daemon's state as JSON.
pub mod status;
