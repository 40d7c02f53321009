use std::{
    io,
    os::unix::io::{AsRawFd, OwnedFd},
    path::Path,
};

use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use tokio::io::unix::AsyncFd;
use tracing::trace;

use crate::{
    fd,
    hotplug::{is_monitored, HotplugAction, HotplugEvent, HotplugNotice, DEV_DIR},
};

// The multicast group the kernel itself broadcasts on.
const KERNEL_GROUP: u32 = 1;

const UEVENT_BUF_SIZE: usize = 8192;

/// A `NETLINK_KOBJECT_UEVENT` listener.
#[derive(Debug)]
pub struct NetlinkMonitor {
    fd: AsyncFd<OwnedFd>,
}

impl NetlinkMonitor {
    pub(crate) fn new() -> io::Result<Self> {
        let sock = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )?;

        bind(sock.as_raw_fd(), &NetlinkAddr::new(0, KERNEL_GROUP))?;

        Ok(Self {
            fd: fd::register(sock)?,
        })
    }

    pub(crate) async fn next(&mut self) -> io::Result<HotplugNotice> {
        let mut buf = [0u8; UEVENT_BUF_SIZE];

        loop {
            let mut guard = self.fd.readable().await?;

            let received = guard.try_io(|fd| {
                recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()).map_err(io::Error::from)
            });

            match received {
                Ok(Ok(n)) => {
                    if let Some(event) = parse_uevent(&buf[..n]) {
                        return Ok(HotplugNotice::Event(event));
                    }
                }
                Ok(Err(e)) if e.raw_os_error() == Some(nix::libc::ENOBUFS) => {
                    return Ok(HotplugNotice::Overflow)
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
    }
}

/// Decode one uevent datagram.
///
/// The payload is a `action@devpath` summary followed by NUL-separated
/// `KEY=value` fields. Only tty add/remove for monitored names is an event.
pub fn parse_uevent(datagram: &[u8]) -> Option<HotplugEvent> {
    let mut action = None;
    let mut subsystem = None;
    let mut devname = None;

    for field in datagram.split(|&b| b == 0) {
        let Ok(field) = std::str::from_utf8(field) else {
            continue;
        };

        if let Some(value) = field.strip_prefix("ACTION=") {
            action = Some(value);
        } else if let Some(value) = field.strip_prefix("SUBSYSTEM=") {
            subsystem = Some(value);
        } else if let Some(value) = field.strip_prefix("DEVNAME=") {
            devname = Some(value);
        }
    }

    let action = match action? {
        "add" => HotplugAction::Add,
        "remove" => HotplugAction::Remove,
        _ => return None,
    };

    if subsystem? != "tty" {
        return None;
    }

    let name = devname?.trim_start_matches("/dev/");
    if !is_monitored(name) {
        return None;
    }

    trace!(?action, name, "uevent");

    Some(HotplugEvent::new(action, Path::new(DEV_DIR), name))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;

    fn datagram(fields: &[&str]) -> Vec<u8> {
        fields.join("\0").into_bytes()
    }

    #[test]
    fn tty_add() {
        let event = parse_uevent(&datagram(&[
            "add@/devices/pci0000:00/0000:00:14.0/usb1/1-6/1-6.2/1-6.2:1.1/ttyUSB1/tty/ttyUSB1",
            "ACTION=add",
            "DEVPATH=/devices/pci0000:00/0000:00:14.0/usb1/1-6/1-6.2/1-6.2:1.1/ttyUSB1/tty/ttyUSB1",
            "SUBSYSTEM=tty",
            "MAJOR=188",
            "MINOR=1",
            "DEVNAME=ttyUSB1",
            "SEQNUM=4242",
        ]))
        .unwrap();

        assert_eq!(
            event,
            HotplugEvent {
                action: HotplugAction::Add,
                name: "ttyUSB1".into(),
                path: PathBuf::from("/dev/ttyUSB1"),
            }
        );
    }

    #[test]
    fn tty_remove() {
        let event = parse_uevent(&datagram(&[
            "remove@/devices/.../ttyACM0",
            "ACTION=remove",
            "SUBSYSTEM=tty",
            "DEVNAME=ttyACM0",
        ]))
        .unwrap();

        assert_eq!(event.action, HotplugAction::Remove);
        assert_eq!(event.path, PathBuf::from("/dev/ttyACM0"));
    }

    #[test]
    fn other_subsystems_are_ignored() {
        assert_eq!(
            parse_uevent(&datagram(&[
                "add@/devices/.../1-6.2:1.1",
                "ACTION=add",
                "SUBSYSTEM=usb",
                "DEVNAME=bus/usb/001/007",
            ])),
            None
        );
    }

    #[test]
    fn other_actions_are_ignored() {
        assert_eq!(
            parse_uevent(&datagram(&[
                "change@/devices/.../ttyUSB0",
                "ACTION=change",
                "SUBSYSTEM=tty",
                "DEVNAME=ttyUSB0",
            ])),
            None
        );
    }

    #[test]
    fn unmonitored_ttys_are_ignored() {
        assert_eq!(
            parse_uevent(&datagram(&["ACTION=add", "SUBSYSTEM=tty", "DEVNAME=ttyS4"])),
            None
        );
    }

    #[test]
    fn missing_fields_are_ignored() {
        assert_eq!(parse_uevent(&datagram(&["ACTION=add", "SUBSYSTEM=tty"])), None);
        assert_eq!(parse_uevent(b""), None);
        assert_eq!(parse_uevent(&[0xff, 0xfe, 0]), None);
    }
}
