use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    registry::{PortState, Registry},
    session::Session,
};

/// File name of the status projection inside the log root.
pub const STATUS_FILE: &str = "status.json";

/// One port, as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    /// Device node.
    pub device: PathBuf,

    /// Display name.
    pub label: String,

    /// Most likely board.
    pub board: String,

    /// What the interface is wired to.
    pub function: String,

    /// USB vendor id, as four lowercase hex digits.
    pub vid: String,

    /// USB product id, as four lowercase hex digits.
    pub pid: String,

    /// Monitoring or yielded.
    pub status: PortState,

    /// Where the output goes.
    pub log_file: PathBuf,

    /// Content bytes logged so far.
    pub bytes_logged: u64,

    /// Pseudo-terminal path, when proxying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<PathBuf>,
}

/// A snapshot of the daemon's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// The daemon's process id.
    pub pid: u32,

    /// The session directory name.
    pub session: String,

    /// Number of entries in `ports`.
    pub port_count: usize,

    /// Every known port.
    pub ports: Vec<PortStatus>,
}

impl StatusReport {
    /// Take a snapshot.
    pub fn new(session: &Session, registry: &Registry) -> Self {
        let ports: Vec<_> = registry
            .iter()
            .map(|(_, port)| {
                let identity = port.identity();

                PortStatus {
                    device: identity.path.clone(),
                    label: identity.label.clone(),
                    board: identity.board().into(),
                    function: identity.function.clone(),
                    vid: format!("{:04x}", identity.vid),
                    pid: format!("{:04x}", identity.pid),
                    status: port.state(),
                    log_file: port.log().path().into(),
                    bytes_logged: port.log().bytes_written(),
                    proxy: port.proxy_path().map(Into::into),
                }
            })
            .collect();

        Self {
            pid: std::process::id(),
            session: session.name().into(),
            port_count: ports.len(),
            ports,
        }
    }

    /// Pretty printed JSON.
    pub fn to_json(&self) -> String {
        // Only strings, numbers and paths, which cannot fail to serialize.
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }

    /// Write `<root>/status.json` via a temporary file and a rename,
    /// so readers never see a partial file.
    pub fn persist(&self, root: &Path) -> Result<()> {
        let path = root.join(STATUS_FILE);
        let tmp = root.join(format!("{STATUS_FILE}.tmp.{}", std::process::id()));

        let mut json = self.to_json();
        json.push('\n');

        fs::write(&tmp, json)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                Error::io(format!("Cannot write {}", path.display()), e)
            })
    }
}

/// Delete `<root>/status.json`, if there is one.
pub fn remove(root: &Path) {
    let _ = fs::remove_file(root.join(STATUS_FILE));
}
