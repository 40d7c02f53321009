use std::{
    io,
    path::{Path, PathBuf},
};

use tracing::{info, warn};

use crate::hotplug::{inotify::InotifyMonitor, netlink::NetlinkMonitor};

/// Directory-watch fallback.
pub mod inotify;

/// Kernel uevent listener.
pub mod netlink;

/// Where device nodes appear.
pub const DEV_DIR: &str = "/dev";

const MONITORED_PREFIXES: [&str; 3] = ["ttyUSB", "ttyACM", "ttyUART"];

/// Whether a device with this short name (e.g. `ttyUSB0`) is one we monitor.
pub fn is_monitored(name: &str) -> bool {
    MONITORED_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Whether the device arrived or left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    /// A device node appeared.
    Add,

    /// A device node went away.
    Remove,
}

/// A monitored device arrived or left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    /// Arrival or departure.
    pub action: HotplugAction,

    /// Short name, e.g. `ttyACM0`.
    pub name: String,

    /// Device node, e.g. `/dev/ttyACM0`.
    pub path: PathBuf,
}

impl HotplugEvent {
    pub(crate) fn new(action: HotplugAction, dev_dir: &Path, name: &str) -> Self {
        Self {
            action,
            name: name.into(),
            path: dev_dir.join(name),
        }
    }
}

/// What a [`HotplugMonitor`] has to say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugNotice {
    /// A single event.
    Event(HotplugEvent),

    /// The kernel dropped events. The device list must be rescanned.
    Overflow,
}

/// Watches for monitored devices coming and going.
///
/// The backend is chosen once, see [`HotplugMonitor::init`].
#[derive(Debug)]
pub enum HotplugMonitor {
    /// Kernel uevents over netlink.
    Netlink(NetlinkMonitor),

    /// `inotify` on the device directory.
    Inotify(InotifyMonitor),
}

impl HotplugMonitor {
    /// Use netlink if possible, else watch [`DEV_DIR`].
    /// `None` if neither works, which disables hot-plug detection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn init() -> Option<Self> {
        match NetlinkMonitor::new() {
            Ok(monitor) => {
                info!("Hot-plug detection via netlink");
                return Some(Self::Netlink(monitor));
            }
            Err(e) => warn!(?e, "Netlink unavailable, falling back to inotify"),
        }

        match InotifyMonitor::new(Path::new(DEV_DIR)) {
            Ok(monitor) => {
                info!(dir = DEV_DIR, "Hot-plug detection via inotify");
                Some(Self::Inotify(monitor))
            }
            Err(e) => {
                warn!(?e, "Hot-plug detection disabled");
                None
            }
        }
    }

    /// A short name for the backend in use.
    pub fn kind(&self) -> &'static str {
        match self {
            HotplugMonitor::Netlink(_) => "netlink",
            HotplugMonitor::Inotify(_) => "inotify",
        }
    }

    /// Wait for the next relevant notice.
    ///
    /// Cancel safe: dropping the future loses no events.
    pub async fn next(&mut self) -> io::Result<HotplugNotice> {
        match self {
            HotplugMonitor::Netlink(monitor) => monitor.next().await,
            HotplugMonitor::Inotify(monitor) => monitor.next().await,
        }
    }
}
