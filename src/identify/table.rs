use std::{fmt::Write, path::Path};

use itertools::Itertools;
use nix::unistd::{access, AccessFlags};

use crate::identify::PortIdentity;

const RULE_WIDTH: usize = 100;

/// The ports of one physical USB device, sorted by interface.
#[derive(Debug)]
pub struct DeviceGroup<'a> {
    /// Never empty.
    pub ports: Vec<&'a PortIdentity>,
}

impl<'a> DeviceGroup<'a> {
    fn first(&self) -> &'a PortIdentity {
        self.ports[0]
    }
}

fn group_key(port: &PortIdentity) -> (u16, u16, &str, &str) {
    (port.vid, port.pid, &port.serial, &port.usb_path)
}

/// Group ports sharing vendor, product, serial number and USB path.
pub fn group(ports: &[PortIdentity]) -> Vec<DeviceGroup<'_>> {
    ports
        .iter()
        .sorted_by(|a, b| {
            group_key(a)
                .cmp(&group_key(b))
                .then(a.interface.cmp(&b.interface))
        })
        .group_by(|port| group_key(*port))
        .into_iter()
        .map(|(_, ports)| DeviceGroup {
            ports: ports.collect(),
        })
        .collect()
}

fn access_string(path: &Path) -> String {
    let mut s = String::new();
    if access(path, AccessFlags::R_OK).is_ok() {
        s.push('R');
    }
    if access(path, AccessFlags::W_OK).is_ok() {
        s.push('W');
    }
    if s.is_empty() {
        s.push_str("---");
    }
    s
}

/// Render the inventory shown by `uart-monitor identify`.
pub fn render(groups: &[DeviceGroup<'_>], verbose: bool) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let mut out = String::new();

    // Writing to a String cannot fail.
    let _ = writeln!(out, "\n{rule}\nUSB Serial Port Inventory - Grouped by Device\n{rule}");

    if groups.is_empty() {
        out.push_str("No USB serial ports found!\n");
        return out;
    }

    for (n, group) in groups.iter().enumerate() {
        let first = group.first();

        let _ = writeln!(
            out,
            "\n{rule}\nDevice #{}: {} - {}\n{rule}",
            n + 1,
            first.manufacturer,
            first.product
        );
        let _ = writeln!(out, "  VID:PID       : {:04x}:{:04x}", first.vid, first.pid);
        let _ = writeln!(
            out,
            "  Device Type   : {}",
            first.known.map(|k| k.name).unwrap_or("Unknown")
        );

        let boards = match (&first.board_override, first.known) {
            (Some(board), _) => board.clone(),
            (None, Some(known)) if !known.boards.is_empty() => known.boards.join(", "),
            _ => "Unknown".into(),
        };
        let _ = writeln!(out, "  Possible Board: {boards}");

        if !first.serial.is_empty() {
            let _ = writeln!(out, "  Serial Number : {}", first.serial);
        }
        let _ = writeln!(out, "  USB Path      : {}", first.usb_path);
        let _ = writeln!(
            out,
            "  Port Count    : {}/{}",
            group.ports.len(),
            first
                .known
                .map(|k| k.expected_ports)
                .unwrap_or(group.ports.len())
        );

        let _ = writeln!(
            out,
            "\n  {:<15} {:<7} {:<25} {:<8}",
            "Port", "Iface", "Function", "Access"
        );
        let _ = writeln!(
            out,
            "  {:<15} {:<7} {:<25} {:<8}",
            "-".repeat(15),
            "-".repeat(7),
            "-".repeat(25),
            "-".repeat(8)
        );

        for port in &group.ports {
            let _ = writeln!(
                out,
                "  {:<15} {:<7} {:<25} {:<8}",
                port.path.display().to_string(),
                port.interface,
                port.function,
                access_string(&port.path)
            );
        }

        if verbose {
            let _ = writeln!(out, "\n  Labels:");
            for port in &group.ports {
                let _ = writeln!(out, "    {} -> {}", port.path.display(), port.label);
            }
        }
    }

    out
}
