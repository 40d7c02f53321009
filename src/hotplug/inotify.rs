use std::{
    collections::VecDeque,
    io,
    os::unix::io::{AsFd, AsRawFd, RawFd},
    path::{Path, PathBuf},
};

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use tokio::io::unix::AsyncFd;

use crate::{
    fd,
    hotplug::{is_monitored, HotplugAction, HotplugEvent, HotplugNotice},
};

// `AsyncFd` wants `AsRawFd`, which `Inotify` only offers through `AsFd`.
#[derive(Debug)]
struct InotifyFd(Inotify);

impl AsRawFd for InotifyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

/// Watches a device directory for nodes being created and deleted.
#[derive(Debug)]
pub struct InotifyMonitor {
    fd: AsyncFd<InotifyFd>,
    dir: PathBuf,
    queue: VecDeque<HotplugNotice>,
}

impl InotifyMonitor {
    /// Watch `dir`, which is `/dev` outside of tests.
    pub fn new(dir: &Path) -> io::Result<Self> {
        let inotify = InotifyFd(Inotify::init(
            InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC,
        )?);

        inotify
            .0
            .add_watch(dir, AddWatchFlags::IN_CREATE | AddWatchFlags::IN_DELETE)?;

        Ok(Self {
            fd: fd::register(inotify)?,
            dir: dir.into(),
            queue: VecDeque::new(),
        })
    }

    pub(crate) async fn next(&mut self) -> io::Result<HotplugNotice> {
        loop {
            if let Some(notice) = self.queue.pop_front() {
                return Ok(notice);
            }

            let mut guard = self.fd.readable().await?;

            match guard.try_io(|fd| fd.get_ref().0.read_events().map_err(io::Error::from)) {
                Ok(Ok(events)) => {
                    let dir = &self.dir;
                    self.queue.extend(events.into_iter().filter_map(|event| {
                        let name = event.name.as_ref().and_then(|n| n.to_str());
                        notice_for(dir, event.mask, name)
                    }));
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
    }
}

fn notice_for(dir: &Path, mask: AddWatchFlags, name: Option<&str>) -> Option<HotplugNotice> {
    if mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
        return Some(HotplugNotice::Overflow);
    }

    let action = if mask.contains(AddWatchFlags::IN_CREATE) {
        HotplugAction::Add
    } else if mask.contains(AddWatchFlags::IN_DELETE) {
        HotplugAction::Remove
    } else {
        return None;
    };

    let name = name.filter(|name| is_monitored(name))?;

    Some(HotplugNotice::Event(HotplugEvent::new(action, dir, name)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn mask_mapping() {
        let dir = Path::new("/dev");

        assert_eq!(
            notice_for(dir, AddWatchFlags::IN_CREATE, Some("ttyACM3")),
            Some(HotplugNotice::Event(HotplugEvent {
                action: HotplugAction::Add,
                name: "ttyACM3".into(),
                path: "/dev/ttyACM3".into(),
            }))
        );
        assert!(matches!(
            notice_for(dir, AddWatchFlags::IN_DELETE, Some("ttyUSB0")),
            Some(HotplugNotice::Event(HotplugEvent {
                action: HotplugAction::Remove,
                ..
            }))
        ));
        assert_eq!(notice_for(dir, AddWatchFlags::IN_CREATE, Some("ttyS0")), None);
        assert_eq!(notice_for(dir, AddWatchFlags::IN_CREATE, None), None);
        assert_eq!(
            notice_for(dir, AddWatchFlags::IN_Q_OVERFLOW, None),
            Some(HotplugNotice::Overflow)
        );
    }

    #[tokio::test]
    async fn sees_nodes_come_and_go() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = InotifyMonitor::new(dir.path()).unwrap();

        std::fs::write(dir.path().join("not-a-tty"), "").unwrap();
        std::fs::write(dir.path().join("ttyUSB9"), "").unwrap();
        std::fs::remove_file(dir.path().join("ttyUSB9")).unwrap();

        let wait = Duration::from_secs(2);

        let added = tokio::time::timeout(wait, monitor.next()).await.unwrap().unwrap();
        assert_eq!(
            added,
            HotplugNotice::Event(HotplugEvent {
                action: HotplugAction::Add,
                name: "ttyUSB9".into(),
                path: dir.path().join("ttyUSB9"),
            })
        );

        let removed = tokio::time::timeout(wait, monitor.next()).await.unwrap().unwrap();
        assert!(matches!(
            removed,
            HotplugNotice::Event(HotplugEvent {
                action: HotplugAction::Remove,
                ..
            })
        ));
    }
}
