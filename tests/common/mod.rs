#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};

use color_eyre::{eyre::eyre, Result};
use tokio::time::Instant;
use tracing::Level;
use uart_monitor::{
    config::Config,
    identify::{PortIdentifier, PortIdentity},
    logging,
    reactor::{Reactor, ReactorBuilder},
};

/// A pseudo-terminal standing in for a USB-serial adapter.
///
/// The daemon opens `path`, the test writes "device output" to `master`.
pub struct FakeDevice {
    pub master: File,
    slave: File,
    pub path: PathBuf,
}

impl FakeDevice {
    pub fn new() -> Result<Self> {
        let pty = nix::pty::openpty(None, None)?;
        let (master, slave) = (File::from(pty.master), File::from(pty.slave));
        let path = nix::unistd::ttyname(&slave)?;
        set_nonblocking(&master)?;

        Ok(Self {
            master,
            slave,
            path,
        })
    }

    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.master.write_all(data)?;
        Ok(())
    }

    /// Whatever the daemon wrote to the device so far.
    pub fn received(&mut self) -> Result<Vec<u8>> {
        read_available(&mut self.master)
    }

    pub fn identity(&self, label: &str) -> PortIdentity {
        let mut identity = PortIdentity::bare(&self.path);
        identity.label = label.into();
        identity
    }
}

pub fn set_nonblocking(file: &File) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let flags = OFlag::from_bits_truncate(fcntl(file, FcntlArg::F_GETFL)?);
    fcntl(file, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

    Ok(())
}

/// Read from a non-blocking file until it has nothing more to give.
pub fn read_available(file: &mut File) -> Result<Vec<u8>> {
    let mut out = vec![];
    let mut buf = [0u8; 1024];

    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(out)
}

/// Hands out whatever the test has "plugged in".
#[derive(Clone, Default)]
pub struct FakeIdentifier {
    devices: Rc<RefCell<BTreeMap<PathBuf, PortIdentity>>>,
}

impl FakeIdentifier {
    pub fn plug(&self, identity: PortIdentity) {
        self.devices
            .borrow_mut()
            .insert(identity.path.clone(), identity);
    }

    pub fn unplug(&self, path: &Path) {
        self.devices.borrow_mut().remove(path);
    }
}

impl PortIdentifier for FakeIdentifier {
    fn scan(&self) -> Vec<PortIdentity> {
        self.devices.borrow().values().cloned().collect()
    }

    fn identify(&self, path: &Path) -> Option<PortIdentity> {
        self.devices.borrow().get(path).cloned()
    }
}

/// Quick timings, no hot-plug, no signal handlers, no diagnostics file.
pub fn config(log_root: &Path) -> Config {
    Config {
        log_root: log_root.into(),
        hotplug: false,
        signals: false,
        settle_delay_ms: 10,
        stale_flush_ms: 50,
        poll_interval_ms: 20,
        file_logging: false,
        ..Default::default()
    }
}

pub async fn reactor(config: Config, identifier: &FakeIdentifier) -> Result<Reactor> {
    logging::init(Level::DEBUG, None).await;

    Ok(ReactorBuilder::new(config)
        .identifier(identifier.clone())
        .build()?)
}

/// Turn the reactor until `done` holds, or give up after a few seconds.
pub async fn turn_until(
    reactor: &mut Reactor,
    mut done: impl FnMut(&Reactor) -> bool,
) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);

    while !done(reactor) {
        if Instant::now() > deadline {
            return Err(eyre!("Timed out waiting for the reactor"));
        }
        reactor.turn().await;
    }

    Ok(())
}

/// Turn the reactor until the log at `path` contains `needle`.
pub async fn turn_until_logged(reactor: &mut Reactor, path: &Path, needle: &str) -> Result<String> {
    turn_until(reactor, |_| {
        std::fs::read_to_string(path)
            .map(|text| text.contains(needle))
            .unwrap_or(false)
    })
    .await?;

    Ok(std::fs::read_to_string(path)?)
}

/// The content lines of a log, without their timestamps.
pub fn content_lines(log: &str) -> Vec<String> {
    log.lines()
        .filter(|line| line.starts_with('[') && line.len() > 26)
        .map(|line| line[26..].to_string())
        .collect()
}
