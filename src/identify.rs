//! Working out what a tty is: which USB bridge, which interface, which board.
//!
//! The daemon only depends on the [`PortIdentifier`] trait.
//! [`SysfsIdentifier`] is the implementation used outside of tests.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, trace};

use crate::{
    hotplug::{is_monitored, DEV_DIR},
    identify::devices::{KnownDevice, DEFAULT_FUNCTION},
    serial::Baud,
};

/// The table of USB bridges we can name.
pub mod devices;

/// Grouping ports by physical device, for display.
pub mod table;

/// Where sysfs is mounted.
pub const SYS_DIR: &str = "/sys";

// How far up from the tty's device directory the USB device may be.
const MAX_SYSFS_DEPTH: usize = 12;

const UNKNOWN: &str = "Unknown";

/// Everything known about one tty.
///
/// A fresh identity is produced for every insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortIdentity {
    /// Device node, e.g. `/dev/ttyUSB0`.
    pub path: PathBuf,

    /// Short name, e.g. `ttyUSB0`.
    pub name: String,

    /// USB vendor id.
    pub vid: u16,

    /// USB product id.
    pub pid: u16,

    /// USB interface number of this tty.
    pub interface: u8,

    /// USB topology path, e.g. `1-6.2`.
    pub usb_path: String,

    /// USB serial number, possibly empty.
    pub serial: String,

    /// USB manufacturer string.
    pub manufacturer: String,

    /// USB product string.
    pub product: String,

    /// Entry in the known device table, if any.
    pub known: Option<&'static KnownDevice>,

    /// What the interface is wired to, e.g. `UART0 (Console)`.
    pub function: String,

    /// Board name configured by the user for this serial number.
    pub board_override: Option<String>,

    /// Filesystem safe display name, e.g. `VMK180_UART1`.
    pub label: String,
}

impl PortIdentity {
    /// An identity with nothing but the device path.
    /// The label is the short name.
    pub fn bare(path: &Path) -> Self {
        let name = short_name(path);

        Self {
            path: path.into(),
            label: name.clone(),
            name,
            vid: 0,
            pid: 0,
            interface: 0,
            usb_path: String::new(),
            serial: String::new(),
            manufacturer: UNKNOWN.into(),
            product: UNKNOWN.into(),
            known: None,
            function: DEFAULT_FUNCTION.into(),
            board_override: None,
        }
    }

    /// The board this port most likely belongs to.
    pub fn board(&self) -> &str {
        self.board_override
            .as_deref()
            .or_else(|| self.known.and_then(KnownDevice::primary_board))
            .unwrap_or(UNKNOWN)
    }

    /// Use a user-configured board name, and derive the label from it.
    pub fn set_board_override(&mut self, board: &str) {
        self.board_override = Some(board.into());
        self.relabel();
    }

    fn relabel(&mut self) {
        self.label = label_for(
            &self.name,
            self.interface,
            self.known,
            self.board_override.as_deref(),
        );
    }

    /// The text placed at the top of this port's log file.
    pub fn log_header(&self, baud: Baud, proxy: Option<&Path>) -> String {
        let mut header = format!(
            "Device: {} ({})\nBoard: {} | Interface {} | Function: {}\nBaud: {baud} 8N1\n",
            self.path.display(),
            self.label,
            self.board(),
            self.interface,
            self.function,
        );

        if let Some(proxy) = proxy {
            header += &format!("Proxy: {}\n", proxy.display());
        }

        header
    }
}

/// The last path component, e.g. `ttyUSB0` for `/dev/ttyUSB0`.
pub fn short_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Upper case, with spaces as underscores.
pub fn sanitize_board(board: &str) -> String {
    board.replace(' ', "_").to_ascii_uppercase()
}

/// Derive a port label.
///
/// A configured board wins, then the known device's primary board.
/// Multi-port bridges get the interface number appended.
/// Otherwise the label is the short name.
pub fn label_for(
    name: &str,
    interface: u8,
    known: Option<&KnownDevice>,
    board_override: Option<&str>,
) -> String {
    if let Some(board) = board_override.filter(|board| !board.is_empty()) {
        return format!("{}_UART{interface}", sanitize_board(board));
    }

    match known.and_then(|known| Some((known, known.primary_board()?))) {
        Some((known, board)) if known.expected_ports > 1 => {
            format!("{}_UART{interface}", sanitize_board(board))
        }
        Some((_, board)) => format!("{}_UART", sanitize_board(board)),
        None => name.into(),
    }
}

/// Finds and describes serial ports.
pub trait PortIdentifier {
    /// Identify every monitored device present right now, sorted by path.
    fn scan(&self) -> Vec<PortIdentity>;

    /// Identify one device. `None` if it cannot be (yet).
    fn identify(&self, path: &Path) -> Option<PortIdentity>;
}

/// User supplied board names, keyed by USB serial number.
///
/// Read from a file of the form:
///
/// ```text
/// # === ZynqMP ZCU102 ===
/// # USB: 1-6.2 | S/N: 8523A1F0
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardConfig {
    boards: HashMap<String, String>,
}

impl BoardConfig {
    /// Parse the contents of a boards file.
    pub fn parse(text: &str) -> Self {
        let mut boards = HashMap::new();
        let mut current: Option<&str> = None;

        for line in text.lines() {
            let trimmed = line.trim_start();

            if let Some(rest) = trimmed.strip_prefix("# === ") {
                if let Some((board, _)) = rest.split_once(" ===") {
                    current = Some(board);
                }
                continue;
            }

            let Some(board) = current else {
                continue;
            };

            if !line.contains("# USB:") {
                continue;
            }

            let serial = line
                .split_once("S/N:")
                .and_then(|(_, rest)| rest.split_whitespace().next());

            if let Some(serial) = serial {
                boards
                    .entry(serial.to_string())
                    .or_insert_with(|| board.to_string());
            }
        }

        Self { boards }
    }

    /// Read `path`. A missing or unreadable file means no overrides.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) => {
                trace!(path = %path.display(), ?e, "No board config");
                Self::default()
            }
        }
    }

    /// `~/.boards`, if there is a home directory.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".boards"))
    }

    /// The board configured for this serial number.
    pub fn board_for(&self, serial: &str) -> Option<&str> {
        if serial.is_empty() {
            return None;
        }
        self.boards.get(serial).map(String::as_str)
    }

    /// How many serial numbers have a board.
    pub fn len(&self) -> usize {
        self.boards.len()
    }

    /// True if there are no overrides.
    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }
}

/// Identifies ports by reading sysfs.
#[derive(Debug, Clone)]
pub struct SysfsIdentifier {
    dev_dir: PathBuf,
    sys_dir: PathBuf,
    boards_path: Option<PathBuf>,
}

impl Default for SysfsIdentifier {
    fn default() -> Self {
        Self {
            dev_dir: DEV_DIR.into(),
            sys_dir: SYS_DIR.into(),
            boards_path: BoardConfig::default_path(),
        }
    }
}

impl SysfsIdentifier {
    /// Look in other places than `/dev`, `/sys` and `~/.boards`.
    pub fn with_roots(dev_dir: &Path, sys_dir: &Path, boards_path: Option<&Path>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            sys_dir: sys_dir.into(),
            boards_path: boards_path.map(Into::into),
        }
    }

    // Re-read on every call so edits take effect without a restart.
    fn boards(&self) -> BoardConfig {
        self.boards_path
            .as_deref()
            .map(BoardConfig::load)
            .unwrap_or_default()
    }

    fn identify_with(&self, path: &Path, boards: &BoardConfig) -> Option<PortIdentity> {
        let mut identity = PortIdentity::bare(path);

        let link = self
            .sys_dir
            .join("class/tty")
            .join(&identity.name)
            .join("device");

        let resolved = match fs::canonicalize(&link) {
            Ok(resolved) => resolved,
            Err(e) => {
                trace!(link = %link.display(), ?e, "No sysfs device, not a USB tty");
                return None;
            }
        };

        let mut found_interface = false;

        for dir in resolved.ancestors().take(MAX_SYSFS_DEPTH) {
            if !found_interface {
                // The kernel prints this attribute as two hex digits.
                if let Some(interface) = read_attr(dir, "bInterfaceNumber")
                    .and_then(|v| u8::from_str_radix(&v, 16).ok())
                {
                    identity.interface = interface;
                    found_interface = true;
                }
            }

            let Some(vid) = read_attr(dir, "idVendor").and_then(|v| parse_hex(&v)) else {
                continue;
            };

            identity.vid = vid;
            identity.pid = read_attr(dir, "idProduct")
                .and_then(|v| parse_hex(&v))
                .unwrap_or_default();
            identity.serial = read_attr(dir, "serial").unwrap_or_default();
            if let Some(manufacturer) = read_attr(dir, "manufacturer") {
                identity.manufacturer = manufacturer;
            }
            if let Some(product) = read_attr(dir, "product") {
                identity.product = product;
            }
            identity.usb_path = usb_path(dir).unwrap_or_default();
            break;
        }

        identity.known = devices::lookup(identity.vid, identity.pid);
        identity.function = identity
            .known
            .and_then(|known| known.port_function(identity.interface))
            .unwrap_or(DEFAULT_FUNCTION)
            .into();

        match boards.board_for(&identity.serial) {
            Some(board) => identity.set_board_override(board),
            None => identity.relabel(),
        }

        debug!(
            path = %identity.path.display(),
            vid = %format!("{:04x}", identity.vid),
            pid = %format!("{:04x}", identity.pid),
            interface = identity.interface,
            label = %identity.label,
            "Identified"
        );

        Some(identity)
    }
}

impl PortIdentifier for SysfsIdentifier {
    fn scan(&self) -> Vec<PortIdentity> {
        let entries = match fs::read_dir(&self.dev_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.dev_dir.display(), ?e, "Cannot list devices");
                return vec![];
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_monitored(name))
            .collect();
        names.sort();

        let boards = self.boards();

        names
            .iter()
            .filter_map(|name| self.identify_with(&self.dev_dir.join(name), &boards))
            .collect()
    }

    fn identify(&self, path: &Path) -> Option<PortIdentity> {
        self.identify_with(path, &self.boards())
    }
}

fn read_attr(dir: &Path, attr: &str) -> Option<String> {
    let value = fs::read_to_string(dir.join(attr)).ok()?;
    Some(value.trim_end().to_string())
}

fn parse_hex(value: &str) -> Option<u16> {
    u16::from_str_radix(value.trim(), 16).ok()
}

// The USB device directory name (`1-6.2`), provided it sits below a `usbN` bus.
fn usb_path(device_dir: &Path) -> Option<String> {
    let under_bus = device_dir.ancestors().skip(1).any(|dir| {
        dir.file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix("usb"))
            .map(|bus| !bus.is_empty() && bus.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false)
    });

    if !under_bus {
        return None;
    }

    let name = device_dir.file_name()?.to_str()?;
    Some(name.split(':').next().unwrap_or(name).to_string())
}
