use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    control::SOCKET_NAME,
    daemon::PID_FILE,
    error::Error,
    serial::{Baud, SerialMode},
};

/// An allow-list of devices, by path (`/dev/ttyUSB0`) or short name (`ttyUSB0`).
///
/// An empty list allows everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceFilter(Vec<String>);

impl DeviceFilter {
    /// Parse a comma separated list, e.g. `ttyUSB0, /dev/ttyACM1`.
    pub fn parse(list: &str) -> Self {
        Self(
            list.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(Into::into)
                .collect(),
        )
    }

    /// True if nothing is filtered out.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the device at `path` is allowed.
    pub fn matches(&self, path: &Path) -> bool {
        if self.0.is_empty() {
            return true;
        }

        let name = path.file_name().and_then(|name| name.to_str());

        self.0
            .iter()
            .any(|entry| Path::new(entry) == path || Some(entry.as_str()) == name)
    }
}

/// How the daemon runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where sessions, the control socket, the status file and the pid file live.
    pub log_root: PathBuf,

    /// Line rate for every port.
    pub baud: Baud,

    /// How many session directories are kept.
    pub max_sessions: usize,

    /// How many ports may be monitored at once.
    pub max_ports: usize,

    /// Only monitor these devices.
    /// See [`DeviceFilter`].
    pub only: DeviceFilter,

    /// Open ports read-write and share them through a pseudo-terminal.
    pub proxy: bool,

    /// Watch for devices being plugged in and out.
    pub hotplug: bool,

    /// Handle SIGTERM, SIGINT and SIGHUP.
    pub signals: bool,

    /// Pause after a device appears before reading its metadata.
    pub settle_delay_ms: u64,

    /// How many times identification of a new device is tried.
    pub identify_attempts: u32,

    /// A partial line older than this is written out.
    pub stale_flush_ms: u64,

    /// Upper bound on a single wait for events.
    pub poll_interval_ms: u64,

    /// Also write diagnostics to a daily rotated file in the log root.
    pub file_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_root: "/tmp/uart-monitor".into(),
            baud: Baud::default(),
            max_sessions: 10,
            max_ports: 64,
            only: DeviceFilter::default(),
            proxy: false,
            hotplug: true,
            signals: true,
            settle_delay_ms: 200,
            identify_attempts: 3,
            stale_flush_ms: 200,
            poll_interval_ms: 500,
            file_logging: true,
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    /// Omitted fields take their default value.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Not valid RON: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            log_root: "/var/log/uart-monitor".into(),
            only: DeviceFilter::parse("ttyUSB0, ttyUSB1, /dev/ttyACM0"),
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(format!("Cannot serialize: {e}")))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("Cannot read config {}", path.display()), e))?;

        Self::deserialize(&s)
    }

    fn check_baud(&self) -> Result<(), Error> {
        Baud::new(self.baud.rate())
            .map(|_| ())
            .map_err(|e| Error::BadConfig(e.to_string()))
    }

    fn check_nonzero(&self) -> Result<(), Error> {
        let fields = [
            ("max_sessions", self.max_sessions as u64),
            ("max_ports", self.max_ports as u64),
            ("identify_attempts", u64::from(self.identify_attempts)),
            ("poll_interval_ms", self.poll_interval_ms),
        ];

        match fields.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(Error::BadConfig(format!(
                "`{name}` must be at least 1"
            ))),
            None => Ok(()),
        }
    }

    fn check_filter_duplicates(&self) -> Result<(), Error> {
        let duplicates = self.only.0.iter().duplicates().collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "The device allow-list names some devices more than once: {duplicates:?}"
            )))
        }
    }

    /// Check the configuration makes sense.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_baud()?;
        self.check_nonzero()?;
        self.check_filter_duplicates()?;

        Ok(())
    }

    /// How ports are opened.
    pub fn mode(&self) -> SerialMode {
        if self.proxy {
            SerialMode::Proxy
        } else {
            SerialMode::Passthrough
        }
    }

    /// See [`Config::settle_delay_ms`].
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// See [`Config::stale_flush_ms`].
    pub fn stale_flush(&self) -> Duration {
        Duration::from_millis(self.stale_flush_ms)
    }

    /// See [`Config::poll_interval_ms`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The control socket.
    pub fn socket_path(&self) -> PathBuf {
        self.log_root.join(SOCKET_NAME)
    }

    /// The single-instance pid file.
    pub fn pid_path(&self) -> PathBuf {
        self.log_root.join(PID_FILE)
    }
}
