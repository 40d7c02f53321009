use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, NaiveDateTime};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub use log_file::LogFile;

/// Per-port log files.
pub mod log_file;

const SESSION_PREFIX: &str = "session-";
const SESSION_FORMAT: &str = "%Y%m%d-%H%M%S";
/// Symlink in the log root pointing at the newest session.
pub const LATEST: &str = "latest";

/// Local wall-clock time with millisecond precision, as used in log files.
pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// One daemon run's log directory.
#[derive(Debug, Clone)]
pub struct Session {
    root: PathBuf,
    name: String,
}

impl Session {
    /// Create a session named after the current local time under `root`,
    /// and point `root/latest` at it.
    pub fn create(root: &Path) -> Result<Self> {
        Self::create_at(root, Local::now())
    }

    /// As [`Session::create`], but named after the given time.
    ///
    /// A directory of the same name is reused.
    pub fn create_at(root: &Path, when: DateTime<Local>) -> Result<Self> {
        fs::create_dir_all(root)
            .map_err(|e| Error::io(format!("Cannot create log root {}", root.display()), e))?;

        let name = format!("{SESSION_PREFIX}{}", when.format(SESSION_FORMAT));
        let dir = root.join(&name);

        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(session = %name, "Reusing session directory")
            }
            Err(e) => {
                return Err(Error::io(
                    format!("Cannot create session directory {}", dir.display()),
                    e,
                ))
            }
        }

        let session = Self {
            root: root.into(),
            name,
        };
        session.point_latest()?;

        info!(session = %session.name, root = %root.display(), "Session created");

        Ok(session)
    }

    /// The directory name, e.g. `session-20240131-123456`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The log root the session lives in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The session directory.
    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    /// Where the log named `name` lives in this session.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.dir().join(format!("{name}.log"))
    }

    /// Open (or append to) `<session>/<name>.log`.
    pub fn open_log(&self, name: &str, header: &str) -> io::Result<LogFile> {
        LogFile::open(&self.log_path(name), header)
    }

    // Swap the symlink in with a rename so readers never see it missing.
    fn point_latest(&self) -> Result<()> {
        let tmp = self
            .root
            .join(format!("{LATEST}.tmp.{}", std::process::id()));
        let latest = self.root.join(LATEST);

        let _ = fs::remove_file(&tmp);

        std::os::unix::fs::symlink(&self.name, &tmp)
            .and_then(|()| fs::rename(&tmp, &latest))
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                Error::io(format!("Cannot update {}", latest.display()), e)
            })
    }
}

fn is_session_name(name: &str) -> bool {
    name.strip_prefix(SESSION_PREFIX)
        .map(|rest| NaiveDateTime::parse_from_str(rest, SESSION_FORMAT).is_ok())
        .unwrap_or(false)
}

/// Remove all but the `keep` newest session directories under `root`.
///
/// Only directories named `session-YYYYMMDD-HHMMSS` are considered.
/// Returns how many were removed.
pub fn prune(root: &Path, keep: usize) -> Result<usize> {
    let entries = fs::read_dir(root)
        .map_err(|e| Error::io(format!("Cannot list {}", root.display()), e))?;

    let mut sessions: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_session_name(name))
        .collect();

    if sessions.len() <= keep {
        return Ok(0);
    }

    // Names sort chronologically.
    sessions.sort_unstable();
    let excess = sessions.len() - keep;

    let mut removed = 0;
    for name in &sessions[..excess] {
        match fs::remove_dir_all(root.join(name)) {
            Ok(()) => {
                debug!(session = %name, "Pruned");
                removed += 1;
            }
            Err(e) => warn!(session = %name, ?e, "Could not prune"),
        }
    }

    Ok(removed)
}

/// Where the newest session keeps the log for a label or device,
/// e.g. `VMK180_UART0` or `/dev/ttyUSB0`.
pub fn latest_log(root: &Path, name: &str) -> PathBuf {
    let name = name.strip_prefix("/dev/").unwrap_or(name);
    root.join(LATEST).join(format!("{name}.log"))
}

/// Names of the logs in the newest session, sorted, without `.log`.
pub fn latest_logs(root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(root.join(LATEST)) else {
        return vec![];
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.strip_suffix(".log").map(Into::into))
        .collect();
    names.sort_unstable();

    names
}

/// Where the last `lines` lines of `tail` begin.
///
/// A trailing newline does not start another line.
/// With fewer lines than asked for, everything is kept.
pub fn tail_offset(tail: &[u8], lines: usize) -> usize {
    if lines == 0 {
        return tail.len();
    }

    let body = tail.strip_suffix(b"\n").unwrap_or(tail);

    body.iter()
        .enumerate()
        .rev()
        .filter(|&(_, &b)| b == b'\n')
        .nth(lines - 1)
        .map_or(0, |(newline, _)| newline + 1)
}
