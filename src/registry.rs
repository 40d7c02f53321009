use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    ops::Bound,
    path::{Path, PathBuf},
    task::{Context, Poll},
};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    error::{Error, Result},
    identify::PortIdentity,
    serial::{Baud, PortActivity, SerialMode, SerialPort},
    session::LogFile,
};

/// Identifies a registry entry for the lifetime of the daemon.
/// Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(u64);

impl Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether a port is being read, or has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    /// The device is open and its output is logged.
    Monitoring,

    /// The device is closed so another tool may use it.
    Yielded,
}

// The serial handle only exists while monitoring.
#[derive(Debug)]
enum Link {
    Monitoring(SerialPort),
    Yielded,
}

/// A port known to the daemon.
#[derive(Debug)]
pub struct MonitoredPort {
    identity: PortIdentity,
    link: Link,
    log: LogFile,
    baud: Baud,
    mode: SerialMode,
    bytes_read: u64,
}

impl MonitoredPort {
    /// A port that is being monitored.
    pub fn new(identity: PortIdentity, serial: SerialPort, log: LogFile, baud: Baud) -> Self {
        Self {
            identity,
            mode: serial.mode(),
            link: Link::Monitoring(serial),
            log,
            baud,
            bytes_read: 0,
        }
    }

    /// What the port is.
    pub fn identity(&self) -> &PortIdentity {
        &self.identity
    }

    /// The device path.
    pub fn path(&self) -> &Path {
        &self.identity.path
    }

    /// Monitoring or yielded.
    pub fn state(&self) -> PortState {
        match self.link {
            Link::Monitoring(_) => PortState::Monitoring,
            Link::Yielded => PortState::Yielded,
        }
    }

    /// The port's log.
    pub fn log(&self) -> &LogFile {
        &self.log
    }

    /// The port's log, for writing.
    pub fn log_mut(&mut self) -> &mut LogFile {
        &mut self.log
    }

    /// The rate the port was first opened at. Reopening uses the same.
    pub fn baud(&self) -> Baud {
        self.baud
    }

    /// The mode the port was first opened in. Reopening uses the same.
    pub fn mode(&self) -> SerialMode {
        self.mode
    }

    /// Bytes read from the device so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// The pseudo-terminal tools may attach to, while proxying.
    pub fn proxy_path(&self) -> Option<&Path> {
        self.serial().and_then(SerialPort::proxy_path)
    }

    /// The open device, unless yielded.
    pub fn serial(&self) -> Option<&SerialPort> {
        match &self.link {
            Link::Monitoring(serial) => Some(serial),
            Link::Yielded => None,
        }
    }

    /// The open device, unless yielded.
    pub fn serial_mut(&mut self) -> Option<&mut SerialPort> {
        match &mut self.link {
            Link::Monitoring(serial) => Some(serial),
            Link::Yielded => None,
        }
    }

    /// Become yielded, handing back the device handle (if it was open).
    pub(crate) fn release(&mut self) -> Option<SerialPort> {
        match std::mem::replace(&mut self.link, Link::Yielded) {
            Link::Monitoring(serial) => Some(serial),
            Link::Yielded => None,
        }
    }

    /// Resume monitoring with a freshly opened device.
    pub(crate) fn attach(&mut self, serial: SerialPort) {
        self.link = Link::Monitoring(serial);
    }

    pub(crate) fn record_read(&mut self, n: usize) {
        self.bytes_read += n as u64;
    }
}

/// Every port the daemon knows about.
///
/// Entries are ordered by [`PortId`] and indexed by device path.
/// At most one entry exists per device path.
#[derive(Debug)]
pub struct Registry {
    ports: BTreeMap<PortId, MonitoredPort>,
    by_path: HashMap<PathBuf, PortId>,
    next_id: u64,
    capacity: usize,

    // The port served last. Polling starts after it.
    cursor: Option<PortId>,
}

impl Registry {
    /// An empty registry with room for `capacity` ports.
    pub fn new(capacity: usize) -> Self {
        Self {
            ports: BTreeMap::new(),
            by_path: HashMap::new(),
            next_id: 0,
            capacity,
            cursor: None,
        }
    }

    /// How many ports there are.
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// True if there are no ports.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// How many ports fit.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True if no more ports fit.
    pub fn is_full(&self) -> bool {
        self.ports.len() >= self.capacity
    }

    /// Add a port.
    ///
    /// Fails if its path is taken or the registry is full.
    pub fn insert(&mut self, port: MonitoredPort) -> Result<PortId> {
        let path = port.path().to_path_buf();

        if self.by_path.contains_key(&path) {
            return Err(Error::AlreadyMonitored(path));
        }

        if self.is_full() {
            return Err(Error::RegistryFull {
                path,
                capacity: self.capacity,
            });
        }

        let id = PortId(self.next_id);
        self.next_id += 1;

        self.by_path.insert(path, id);
        self.ports.insert(id, port);

        Ok(id)
    }

    /// Take a port out.
    pub fn remove(&mut self, id: PortId) -> Option<MonitoredPort> {
        let port = self.ports.remove(&id)?;
        self.by_path.remove(port.path());
        Some(port)
    }

    /// Look up a port.
    pub fn get(&self, id: PortId) -> Option<&MonitoredPort> {
        self.ports.get(&id)
    }

    /// Look up a port, for changing it.
    pub fn get_mut(&mut self, id: PortId) -> Option<&mut MonitoredPort> {
        self.ports.get_mut(&id)
    }

    /// The id of the port with this device path.
    pub fn id_of(&self, path: &Path) -> Option<PortId> {
        self.by_path.get(path).copied()
    }

    /// Whether a port with this device path exists.
    pub fn contains_path(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    /// Whether any port is labelled `label`.
    pub fn label_in_use(&self, label: &str) -> bool {
        self.ports.values().any(|port| port.identity.label == label)
    }

    /// All ports, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (PortId, &MonitoredPort)> {
        self.ports.iter().map(|(id, port)| (*id, port))
    }

    /// All ports, in insertion order, for changing them.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PortId, &mut MonitoredPort)> {
        self.ports.iter_mut().map(|(id, port)| (*id, port))
    }

    /// All ids, newest first.
    pub fn ids_newest_first(&self) -> Vec<PortId> {
        self.ports.keys().rev().copied().collect()
    }

    /// Poll every monitored port for activity.
    ///
    /// Ports are visited round-robin, starting after the one served last,
    /// so a busy port cannot starve the others.
    pub(crate) fn poll_activity(&mut self, cx: &mut Context<'_>) -> Poll<(PortId, PortActivity)> {
        let order: Vec<PortId> = match self.cursor {
            Some(cursor) => self
                .ports
                .range((Bound::Excluded(cursor), Bound::Unbounded))
                .chain(self.ports.range(..=cursor))
                .map(|(id, _)| *id)
                .collect(),
            None => self.ports.keys().copied().collect(),
        };

        for id in order {
            let Some(port) = self.ports.get_mut(&id) else {
                continue;
            };
            let Some(serial) = port.serial_mut() else {
                continue;
            };

            if let Poll::Ready(activity) = serial.poll_activity(cx) {
                if let PortActivity::Output(data) = &activity {
                    port.record_read(data.len());
                }

                self.cursor = Some(id);
                trace!(%id, "Serial activity");

                return Poll::Ready((id, activity));
            }
        }

        Poll::Pending
    }

    /// Wait until some monitored port has something to report.
    ///
    /// Never completes if no port is being monitored.
    pub async fn next_activity(&mut self) -> (PortId, PortActivity) {
        futures::future::poll_fn(|cx| self.poll_activity(cx)).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::File,
        io::Write,
        time::Duration,
    };

    use pretty_assertions::assert_eq;

    use super::*;

    // A pseudo-terminal standing in for a USB-serial device.
    // Writing to `master` looks like the device talking.
    struct FakeDevice {
        master: File,
        _slave: File,
        path: PathBuf,
    }

    fn fake_device() -> FakeDevice {
        let pty = nix::pty::openpty(None, None).unwrap();
        let (master, slave) = (File::from(pty.master), File::from(pty.slave));
        let path = nix::unistd::ttyname(&slave).unwrap();

        FakeDevice {
            master,
            _slave: slave,
            path,
        }
    }

    fn port(device: &FakeDevice, label: &str, dir: &Path) -> MonitoredPort {
        let mut identity = PortIdentity::bare(&device.path);
        identity.label = label.into();

        let serial = SerialPort::open(&device.path, Baud::default(), SerialMode::Passthrough)
            .unwrap();
        let log = LogFile::open(&dir.join(format!("{label}.log")), "").unwrap();

        MonitoredPort::new(identity, serial, log, Baud::default())
    }

    #[tokio::test]
    async fn ids_are_stable_and_paths_unique() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, c) = (fake_device(), fake_device(), fake_device());
        let mut registry = Registry::new(8);

        let id_a = registry.insert(port(&a, "A", dir.path())).unwrap();
        let id_b = registry.insert(port(&b, "B", dir.path())).unwrap();

        assert!(matches!(
            registry.insert(port(&a, "A2", dir.path())),
            Err(Error::AlreadyMonitored(path)) if path == a.path
        ));

        registry.remove(id_a).unwrap();
        assert_eq!(registry.id_of(&b.path), Some(id_b));
        assert!(!registry.contains_path(&a.path));

        let id_c = registry.insert(port(&c, "C", dir.path())).unwrap();
        assert!(id_c > id_b);

        // Same path again after removal gets a new id.
        let id_a2 = registry.insert(port(&a, "A", dir.path())).unwrap();
        assert!(id_a2 != id_a);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (fake_device(), fake_device());
        let mut registry = Registry::new(1);

        registry.insert(port(&a, "A", dir.path())).unwrap();
        assert!(registry.is_full());
        assert!(matches!(
            registry.insert(port(&b, "B", dir.path())),
            Err(Error::RegistryFull { capacity: 1, .. })
        ));
    }

    #[tokio::test]
    async fn release_and_attach() {
        let dir = tempfile::tempdir().unwrap();
        let a = fake_device();
        let mut registry = Registry::new(8);
        let id = registry.insert(port(&a, "A", dir.path())).unwrap();

        let port = registry.get_mut(id).unwrap();
        assert_eq!(port.state(), PortState::Monitoring);

        assert!(port.release().is_some());
        assert_eq!(port.state(), PortState::Yielded);
        assert!(port.release().is_none());
        assert!(port.serial().is_none());

        let serial = SerialPort::open(&a.path, port.baud(), port.mode()).unwrap();
        port.attach(serial);
        assert_eq!(port.state(), PortState::Monitoring);
    }

    #[tokio::test]
    async fn labels_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let a = fake_device();
        let mut registry = Registry::new(8);
        registry.insert(port(&a, "VMK180_UART0", dir.path())).unwrap();

        assert!(registry.label_in_use("VMK180_UART0"));
        assert!(!registry.label_in_use("VMK180_UART1"));
    }

    #[tokio::test]
    async fn activity_is_round_robin() {
        let dir = tempfile::tempdir().unwrap();
        let (mut a, mut b) = (fake_device(), fake_device());
        let mut registry = Registry::new(8);
        let id_a = registry.insert(port(&a, "A", dir.path())).unwrap();
        let id_b = registry.insert(port(&b, "B", dir.path())).unwrap();

        a.master.write_all(b"from a\n").unwrap();
        b.master.write_all(b"from b\n").unwrap();

        let wait = Duration::from_secs(2);
        let mut served = vec![];
        while served.len() < 2 {
            let (id, activity) = tokio::time::timeout(wait, registry.next_activity())
                .await
                .unwrap();
            assert!(matches!(activity, PortActivity::Output(_)));
            if served.last() != Some(&id) {
                served.push(id);
            }
        }

        served.sort();
        assert_eq!(served, [id_a, id_b]);
        assert!(registry.get(id_a).unwrap().bytes_read() > 0);
    }

    #[tokio::test]
    async fn yielded_ports_are_not_polled() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = fake_device();
        let mut registry = Registry::new(8);
        let id = registry.insert(port(&a, "A", dir.path())).unwrap();

        drop(registry.get_mut(id).unwrap().release());
        a.master.write_all(b"ignored\n").unwrap();

        let polled =
            tokio::time::timeout(Duration::from_millis(100), registry.next_activity()).await;
        assert!(polled.is_err());
    }
}
