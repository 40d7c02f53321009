/// A USB-serial bridge seen on development boards.
#[derive(Debug, PartialEq, Eq)]
pub struct KnownDevice {
    /// USB vendor id.
    pub vid: u16,

    /// USB product id.
    pub pid: u16,

    /// Human readable device type.
    pub name: &'static str,

    /// How many tty interfaces one such device exposes.
    pub expected_ports: usize,

    /// Boards this bridge is usually found on, most likely first.
    pub boards: &'static [&'static str],
}

/// Function of a port when nothing more specific is known.
pub const DEFAULT_FUNCTION: &str = "Main UART";

const fn device(
    vid: u16,
    pid: u16,
    name: &'static str,
    expected_ports: usize,
    boards: &'static [&'static str],
) -> KnownDevice {
    KnownDevice {
        vid,
        pid,
        name,
        expected_ports,
        boards,
    }
}

/// Every bridge we can name.
pub static KNOWN_DEVICES: &[KnownDevice] = &[
    // FTDI
    device(0x0403, 0x6010, "FTDI FT2232H", 2, &["VMK180", "ZCU102", "Various"]),
    device(0x0403, 0x6011, "FTDI FT4232H", 4, &["VMK180", "ZCU102"]),
    device(0x0403, 0x6014, "FTDI FT232H", 1, &["Generic"]),
    device(0x0403, 0x6001, "FTDI FT232R", 1, &["Generic"]),
    // Xilinx/AMD
    device(0x04b4, 0x0008, "Cypress FX3", 4, &["Versal VMK180", "ZCU102"]),
    // Microchip PolarFire SoC
    device(0x10c4, 0xea71, "Silicon Labs CP210x", 4, &["PolarFire SoC"]),
    device(0x10c4, 0xea60, "Silicon Labs CP210x", 1, &["PolarFire SoC", "Generic"]),
    // STMicroelectronics
    device(0x0483, 0x374b, "STM32 ST-LINK", 1, &["STM32H563", "STM32 boards"]),
    device(0x0483, 0x374e, "STM32 Virtual COM Port", 1, &["STM32H563"]),
    device(0x0483, 0x5740, "STM32 USB CDC", 1, &["USB Relay Controller"]),
    // Relays and generic adapters
    device(0x1a86, 0x7523, "CH340 USB-Serial", 1, &["USB Relay", "Generic"]),
    device(0x067b, 0x2303, "Prolific PL2303", 1, &["Generic"]),
    // Debuggers
    device(0x0897, 0x0002, "Lauterbach TRACE32", 1, &["Debugger"]),
];

// Per-interface functions, indexed by interface number.
static PORT_FUNCTIONS: &[(&str, &[&str])] = &[
    ("FTDI FT2232H", &["UART/JTAG Port A", "UART/JTAG Port B"]),
    ("FTDI FT4232H", &["UART0/JTAG", "UART1", "UART2", "UART3"]),
    (
        "Cypress FX3",
        &["UART0 (Console)", "UART1 (PMC)", "UART2 (Debug)", "UART3"],
    ),
    ("Silicon Labs CP210x", &["UART0", "UART1", "UART2", "UART3"]),
];

/// Find a bridge by its USB ids.
pub fn lookup(vid: u16, pid: u16) -> Option<&'static KnownDevice> {
    KNOWN_DEVICES.iter().find(|d| d.vid == vid && d.pid == pid)
}

impl KnownDevice {
    /// What the given interface of this bridge is wired to, if known.
    pub fn port_function(&self, interface: u8) -> Option<&'static str> {
        PORT_FUNCTIONS
            .iter()
            .find(|(name, _)| *name == self.name)
            .and_then(|(_, functions)| functions.get(usize::from(interface)))
            .copied()
    }

    /// The most likely board.
    pub fn primary_board(&self) -> Option<&'static str> {
        self.boards.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cp210x_quad() {
        let device = lookup(0x10c4, 0xea71).unwrap();

        assert_eq!(device.name, "Silicon Labs CP210x");
        assert_eq!(device.expected_ports, 4);
        assert_eq!(device.port_function(2), Some("UART2"));
        assert_eq!(device.primary_board(), Some("PolarFire SoC"));
    }

    #[test]
    fn unknown_ids() {
        assert_eq!(lookup(0xffff, 0xffff), None);
    }

    #[test]
    fn function_out_of_range() {
        let ft2232 = lookup(0x0403, 0x6010).unwrap();
        assert_eq!(ft2232.port_function(1), Some("UART/JTAG Port B"));
        assert_eq!(ft2232.port_function(2), None);

        let ch340 = lookup(0x1a86, 0x7523).unwrap();
        assert_eq!(ch340.port_function(0), None);
    }

    #[test]
    fn ids_are_unique() {
        for (i, a) in KNOWN_DEVICES.iter().enumerate() {
            for b in &KNOWN_DEVICES[i + 1..] {
                assert!((a.vid, a.pid) != (b.vid, b.pid), "{}", a.name);
            }
        }
    }
}
