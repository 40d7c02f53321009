//! The event loop.
//!
//! One [`Reactor`] value owns every port, the control socket, the hot-plug
//! monitor and the signal handlers. Each [`Reactor::turn`] waits for the
//! first of these to have something to say, handles exactly that, and then
//! flushes partial log lines that have been waiting too long.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, info, trace, warn};

use crate::{
    config::Config,
    control::{ControlCommand, ControlConnection, ControlResponse, ControlServer, IO_TIMEOUT},
    error::{Error, Result},
    hotplug::{HotplugAction, HotplugEvent, HotplugMonitor, HotplugNotice},
    identify::{PortIdentifier, PortIdentity, SysfsIdentifier},
    registry::{MonitoredPort, PortId, PortState, Registry},
    serial::{PortActivity, SerialPort},
    session::{self, Session},
    status::{self, StatusReport},
};

/// Log marker written when a device goes away.
pub const MARKER_DISCONNECTED: &str = "PORT DISCONNECTED";

/// Log marker written when a port is released.
pub const MARKER_YIELDED: &str = "PORT YIELDED (released for flashing)";

/// Log marker written when a released port is monitored again.
pub const MARKER_RECLAIMED: &str = "PORT RECLAIMED (monitoring resumed)";

/// Log marker written to every port when the daemon stops.
pub const MARKER_STOPPED: &str = "MONITOR STOPPED";

/// Whether a yield or reclaim changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The port changed state.
    Applied,

    /// The port already was in the requested state.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Received {
    Terminate,
    Interrupt,
    Hangup,
}

#[derive(Debug)]
struct Signals {
    terminate: Signal,
    interrupt: Signal,
    hangup: Signal,
}

impl Signals {
    fn new() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) -> Option<Received> {
        tokio::select! {
            Some(()) = self.terminate.recv() => Some(Received::Terminate),
            Some(()) = self.interrupt.recv() => Some(Received::Interrupt),
            Some(()) = self.hangup.recv() => Some(Received::Hangup),
            else => None,
        }
    }
}

async fn next_signal(signals: &mut Option<Signals>) -> Option<Received> {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_client(control: &Option<ControlServer>) -> io::Result<ControlConnection> {
    match control {
        Some(control) => control.accept().await,
        None => std::future::pending().await,
    }
}

async fn next_hotplug(hotplug: &mut Option<HotplugMonitor>) -> io::Result<HotplugNotice> {
    match hotplug {
        Some(hotplug) => hotplug.next().await,
        None => std::future::pending().await,
    }
}

/// Sets up a [`Reactor`].
pub struct ReactorBuilder {
    config: Config,
    identifier: Option<Box<dyn PortIdentifier>>,
}

impl ReactorBuilder {
    /// Start from a configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            identifier: None,
        }
    }

    /// Identify ports with something other than sysfs.
    pub fn identifier(mut self, identifier: impl PortIdentifier + 'static) -> Self {
        self.identifier = Some(Box::new(identifier));
        self
    }

    /// Create the session and acquire the event sources.
    ///
    /// Only a session that cannot be created is fatal.
    /// Everything else degrades with a warning.
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Reactor> {
        let Self { config, identifier } = self;

        let session = Session::create(&config.log_root)?;

        match session::prune(&config.log_root, config.max_sessions) {
            Ok(0) => {}
            Ok(removed) => info!(removed, keep = config.max_sessions, "Pruned old sessions"),
            Err(e) => warn!(?e, "Could not prune old sessions"),
        }

        let control = match ControlServer::bind(&config.socket_path()) {
            Ok(control) => Some(control),
            Err(e) => {
                warn!(path = %config.socket_path().display(), ?e, "Control socket disabled");
                None
            }
        };

        let hotplug = if config.hotplug {
            HotplugMonitor::init()
        } else {
            debug!("Hot-plug detection off");
            None
        };

        let signals = if config.signals {
            match Signals::new() {
                Ok(signals) => Some(signals),
                Err(e) => {
                    warn!(?e, "Signal handling disabled");
                    None
                }
            }
        } else {
            None
        };

        let identifier: Box<dyn PortIdentifier> = match identifier {
            Some(identifier) => identifier,
            None => Box::new(SysfsIdentifier::default()),
        };

        Ok(Reactor {
            registry: Registry::new(config.max_ports),
            identifier,
            config,
            session,
            control,
            hotplug,
            signals,
            running: true,
        })
    }
}

/// The daemon's state and event loop.
pub struct Reactor {
    config: Config,
    session: Session,
    registry: Registry,
    identifier: Box<dyn PortIdentifier>,
    control: Option<ControlServer>,
    hotplug: Option<HotplugMonitor>,
    signals: Option<Signals>,
    running: bool,
}

impl Reactor {
    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// This run's log session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// All known ports.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Where the control socket listens, if it could be set up.
    pub fn control_path(&self) -> Option<&Path> {
        self.control.as_ref().map(ControlServer::path)
    }

    /// Which hot-plug backend is in use, if any.
    pub fn hotplug_kind(&self) -> Option<&'static str> {
        self.hotplug.as_ref().map(HotplugMonitor::kind)
    }

    /// False once a stop was requested.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Ask the loop to stop after the current turn.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Start monitoring a port.
    ///
    /// Rejected if the path is already known, the allow-list excludes it,
    /// or the registry is full. Nothing changes if the device or its
    /// log cannot be opened.
    pub fn add_port(&mut self, identity: PortIdentity) -> Result<PortId> {
        let path = identity.path.clone();

        if self.registry.contains_path(&path) {
            return Err(Error::AlreadyMonitored(path));
        }

        if !self.config.only.matches(&path) {
            return Err(Error::Filtered(path));
        }

        if self.registry.is_full() {
            return Err(Error::RegistryFull {
                path,
                capacity: self.registry.capacity(),
            });
        }

        let baud = self.config.baud;
        let serial = SerialPort::open(&path, baud, self.config.mode())?;

        let log_name = if self.registry.label_in_use(&identity.label) {
            format!("{}_{}", identity.label, identity.name)
        } else {
            identity.label.clone()
        };

        let header = identity.log_header(baud, serial.proxy_path());
        let log = self
            .session
            .open_log(&log_name, &header)
            .map_err(|e| Error::io(format!("Cannot open log for {}", path.display()), e))?;

        info!(
            device = %path.display(),
            label = %identity.label,
            log = %log.path().display(),
            proxy = ?serial.proxy_path(),
            "Monitoring"
        );

        let id = self
            .registry
            .insert(MonitoredPort::new(identity, serial, log, baud))?;

        self.persist_status();

        Ok(id)
    }

    /// Stop monitoring a port for good, e.g. because it was unplugged.
    pub fn remove_port(&mut self, id: PortId) -> Option<PortIdentity> {
        let mut port = self.registry.remove(id)?;

        if let Err(e) = port.log_mut().marker(MARKER_DISCONNECTED) {
            warn!(device = %port.path().display(), ?e, "Could not write marker");
        }
        if let Err(e) = port.log_mut().close() {
            warn!(device = %port.path().display(), ?e, "Could not close log");
        }

        info!(
            device = %port.path().display(),
            label = %port.identity().label,
            bytes = port.bytes_read(),
            "Removed"
        );

        self.persist_status();

        let identity = port.identity().clone();
        drop(port);

        Some(identity)
    }

    /// Close the device so another tool can use it, keeping its log.
    pub fn yield_port(&mut self, path: &Path) -> Result<Transition> {
        let port = self.port_by_path(path)?;

        if port.state() == PortState::Yielded {
            debug!(device = %path.display(), "Already yielded");
            return Ok(Transition::Unchanged);
        }

        drop(port.release());

        if let Err(e) = port.log_mut().marker(MARKER_YIELDED) {
            warn!(device = %path.display(), ?e, "Could not write marker");
        }
        info!(device = %path.display(), "Yielded");

        self.persist_status();

        Ok(Transition::Applied)
    }

    /// Reopen a yielded device with the rate and mode it had before.
    ///
    /// If that fails the port stays yielded.
    pub fn reclaim_port(&mut self, path: &Path) -> Result<Transition> {
        let port = self.port_by_path(path)?;

        if port.state() == PortState::Monitoring {
            debug!(device = %path.display(), "Already monitoring");
            return Ok(Transition::Unchanged);
        }

        let serial = SerialPort::open(path, port.baud(), port.mode()).map_err(|source| {
            warn!(device = %path.display(), ?source, "Cannot reopen");
            Error::CannotReopen {
                path: path.into(),
                source,
            }
        })?;

        let proxy = serial.proxy_path().map(Path::to_path_buf);
        port.attach(serial);

        if let Err(e) = port.log_mut().marker(MARKER_RECLAIMED) {
            warn!(device = %path.display(), ?e, "Could not write marker");
        }
        info!(device = %path.display(), ?proxy, "Reclaimed");

        self.persist_status();

        Ok(Transition::Applied)
    }

    /// Look for devices again and monitor any not yet known.
    pub fn rescan(&mut self) {
        let found = self.identifier.scan();
        debug!(found = found.len(), "Rescanning");

        for identity in found {
            if self.registry.contains_path(&identity.path) {
                continue;
            }

            let path = identity.path.clone();
            match self.add_port(identity) {
                Ok(_) => {}
                Err(Error::Filtered(_)) => debug!(device = %path.display(), "Filtered out"),
                Err(e) => warn!(device = %path.display(), %e, "Not monitored"),
            }
        }

        self.persist_status();
    }

    /// React to a device arriving or leaving.
    pub async fn handle_hotplug(&mut self, notice: HotplugNotice) {
        match notice {
            HotplugNotice::Overflow => {
                warn!("Hot-plug events were lost, rescanning");
                self.rescan();
            }
            HotplugNotice::Event(HotplugEvent {
                action: HotplugAction::Add,
                path,
                ..
            }) => self.device_added(&path).await,
            HotplugNotice::Event(HotplugEvent {
                action: HotplugAction::Remove,
                path,
                ..
            }) => {
                if let Some(id) = self.registry.id_of(&path) {
                    info!(device = %path.display(), "Unplugged");
                    self.remove_port(id);
                }
            }
        }
    }

    async fn device_added(&mut self, path: &Path) {
        if self.registry.contains_path(path) {
            trace!(device = %path.display(), "Known already");
            return;
        }

        if !self.config.only.matches(path) {
            debug!(device = %path.display(), "Filtered out");
            return;
        }

        // Sysfs attributes show up some time after the device node.
        for attempt in 1..=self.config.identify_attempts {
            tokio::time::sleep(self.config.settle_delay()).await;

            let Some(identity) = self.identifier.identify(path) else {
                trace!(device = %path.display(), attempt, "Not identified yet");
                continue;
            };

            if let Err(e) = self.add_port(identity) {
                warn!(device = %path.display(), %e, "Not monitored");
            }
            return;
        }

        warn!(
            device = %path.display(),
            attempts = self.config.identify_attempts,
            "Could not identify"
        );
    }

    /// Carry out a control command.
    pub fn handle_command(&mut self, command: ControlCommand) -> ControlResponse {
        debug!(%command, "Control command");

        match command {
            ControlCommand::Status => ControlResponse::Status(self.status().to_json()),
            ControlCommand::Yield(path) => match self.yield_port(&path) {
                Ok(Transition::Applied) => ControlResponse::Yielded(path),
                Ok(Transition::Unchanged) => ControlResponse::AlreadyYielded(path),
                Err(e) => ControlResponse::from(&e),
            },
            ControlCommand::Reclaim(path) => match self.reclaim_port(&path) {
                Ok(Transition::Applied) => ControlResponse::Reclaimed(path),
                Ok(Transition::Unchanged) => ControlResponse::AlreadyMonitoring(path),
                Err(e) => ControlResponse::from(&e),
            },
            ControlCommand::Quit => {
                info!("Quit requested");
                self.stop();
                ControlResponse::ShuttingDown
            }
            ControlCommand::Unrecognized(text) => ControlResponse::unknown(&text),
        }
    }

    async fn serve_client(&mut self, mut connection: ControlConnection) {
        let command = match connection.read_command().await {
            Ok(command) => command,
            Err(e) => {
                debug!(?e, "Control client went quiet");
                return;
            }
        };

        let response = self.handle_command(command);

        if let Err(e) = connection.respond(&response).await {
            debug!(?e, "Could not answer control client");
        }
    }

    async fn handle_activity(&mut self, id: PortId, activity: PortActivity) {
        let Some(port) = self.registry.get_mut(id) else {
            return;
        };

        match activity {
            PortActivity::Output(data) => {
                if let Err(e) = port.log_mut().write(&data) {
                    warn!(device = %port.path().display(), ?e, "Could not log output");
                }

                if let Some(SerialPort::Proxy(proxy)) = port.serial() {
                    match proxy.pty().try_write(&data) {
                        Ok(n) if n < data.len() => {
                            trace!(dropped = data.len() - n, "Nobody reading the proxy")
                        }
                        Ok(_) => {}
                        Err(e) => debug!(?e, "Could not copy to proxy"),
                    }
                }
            }
            PortActivity::ProxyInput(data) => {
                let path = port.path().to_path_buf();

                if let Some(SerialPort::Proxy(proxy)) = port.serial_mut() {
                    match tokio::time::timeout(IO_TIMEOUT, proxy.write_to_device(&data)).await {
                        Ok(Ok(())) => trace!(device = %path.display(), n = data.len(), "Forwarded"),
                        Ok(Err(e)) => warn!(device = %path.display(), ?e, "Could not forward"),
                        Err(_) => warn!(device = %path.display(), "Forwarding timed out"),
                    }
                }
            }
            PortActivity::Closed => {
                info!(device = %port.path().display(), "Device closed");
                self.remove_port(id);
            }
            PortActivity::Failed(e) => {
                warn!(device = %port.path().display(), ?e, "Read failed");
                self.remove_port(id);
            }
            PortActivity::ProxyFailed(e) => {
                warn!(device = %port.path().display(), ?e, "Proxy failed");
                self.remove_port(id);
            }
        }
    }

    async fn handle_signal(&mut self, received: Received) {
        match received {
            Received::Terminate | Received::Interrupt => {
                info!(?received, "Stopping");
                self.stop();
            }
            Received::Hangup => {
                info!("SIGHUP, rescanning");
                self.rescan();
            }
        }
    }

    /// Wait for one event, handle it, then do maintenance.
    pub async fn turn(&mut self) {
        let poll_interval = self.config.poll_interval();

        tokio::select! {
            biased;

            Some(received) = next_signal(&mut self.signals) => {
                self.handle_signal(received).await
            }

            accepted = next_client(&self.control) => match accepted {
                Ok(connection) => self.serve_client(connection).await,
                Err(e) => warn!(?e, "Could not accept control client"),
            },

            notice = next_hotplug(&mut self.hotplug) => match notice {
                Ok(notice) => self.handle_hotplug(notice).await,
                Err(e) => {
                    warn!(?e, "Hot-plug detection failed, disabling it");
                    self.hotplug = None;
                }
            },

            (id, activity) = self.registry.next_activity() => {
                self.handle_activity(id, activity).await
            }

            _ = tokio::time::sleep(poll_interval) => {}
        }

        self.flush_stale();
    }

    /// Turn until stopped.
    pub async fn run(&mut self) {
        info!(
            session = %self.session.name(),
            ports = self.registry.len(),
            hotplug = ?self.hotplug_kind(),
            "Running"
        );

        while self.running {
            self.turn().await;
        }
    }

    /// Write out partial lines that have waited long enough.
    pub fn flush_stale(&mut self) {
        let max_age = self.config.stale_flush();

        for (_, port) in self.registry.iter_mut() {
            if let Err(e) = port.log_mut().flush_if_stale(max_age) {
                warn!(device = %port.path().display(), ?e, "Could not flush log");
            }
        }
    }

    /// A snapshot of every port.
    pub fn status(&self) -> StatusReport {
        StatusReport::new(&self.session, &self.registry)
    }

    fn persist_status(&self) {
        if let Err(e) = self.status().persist(&self.config.log_root) {
            warn!(?e, "Could not write status");
        }
    }

    fn port_by_path(&mut self, path: &Path) -> Result<&mut MonitoredPort> {
        let id = self
            .registry
            .id_of(path)
            .ok_or_else(|| Error::PortNotFound(path.into()))?;

        self.registry
            .get_mut(id)
            .ok_or_else(|| Error::PortNotFound(path.into()))
    }

    /// Mark every log, release every port newest first, and remove the
    /// status file and control socket.
    pub fn shutdown(mut self) {
        for id in self.registry.ids_newest_first() {
            let Some(mut port) = self.registry.remove(id) else {
                continue;
            };

            let log = port.log_mut();
            if let Err(e) = log.marker(MARKER_STOPPED).and_then(|()| log.close()) {
                warn!(device = %port.path().display(), ?e, "Could not finish log");
            }
        }

        status::remove(&self.config.log_root);

        let socket: Option<PathBuf> = self.control_path().map(Into::into);
        drop(self.control.take());

        info!(session = %self.session.name(), ?socket, "Stopped");
    }
}
