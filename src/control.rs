//! The local control socket.
//!
//! Newline-delimited ASCII over a Unix stream socket.
//! Each connection carries exactly one command and one response.

use std::{
    convert::Infallible,
    fmt::Display,
    io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};
use tracing::{debug, trace, warn};

use crate::error::Error;

/// File name of the socket inside the log root.
pub const SOCKET_NAME: &str = "uart-monitor.sock";

/// Longest request accepted.
pub const MAX_REQUEST: usize = 512;

/// Bound on reading a request and on writing a response.
pub const IO_TIMEOUT: Duration = Duration::from_secs(1);

// Clients wait longer, since the daemon may be busy with a settle delay.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A request sent to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Release the port so another tool may use it.
    Yield(PathBuf),

    /// Resume monitoring a released port.
    Reclaim(PathBuf),

    /// Get the status projection.
    Status,

    /// Stop the daemon.
    Quit,

    /// Anything else, as received.
    Unrecognized(String),
}

impl FromStr for ControlCommand {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim_end_matches(['\r', '\n']);

        let command = match line {
            "STATUS" => Self::Status,
            "QUIT" => Self::Quit,
            _ => {
                if let Some(path) = line.strip_prefix("YIELD ") {
                    Self::Yield(path.into())
                } else if let Some(path) = line.strip_prefix("RECLAIM ") {
                    Self::Reclaim(path.into())
                } else {
                    Self::Unrecognized(line.into())
                }
            }
        };

        Ok(command)
    }
}

impl Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlCommand::Yield(path) => write!(f, "YIELD {}", path.display()),
            ControlCommand::Reclaim(path) => write!(f, "RECLAIM {}", path.display()),
            ControlCommand::Status => write!(f, "STATUS"),
            ControlCommand::Quit => write!(f, "QUIT"),
            ControlCommand::Unrecognized(text) => write!(f, "{text}"),
        }
    }
}

/// The daemon's answer to a [`ControlCommand`].
///
/// Displays as the exact text sent on the wire, newline included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// A JSON status projection.
    Status(String),

    /// The port was released.
    Yielded(PathBuf),

    /// The port had already been released.
    AlreadyYielded(PathBuf),

    /// The port is monitored again.
    Reclaimed(PathBuf),

    /// The port was being monitored already.
    AlreadyMonitoring(PathBuf),

    /// The daemon is stopping.
    ShuttingDown,

    /// Something went wrong.
    Error(String),
}

impl ControlResponse {
    /// An `ERROR unknown command` response.
    pub fn unknown(text: &str) -> Self {
        Self::Error(format!("unknown command: {text}"))
    }

    /// Whether this is an `ERROR ...` response.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl From<&Error> for ControlResponse {
    fn from(error: &Error) -> Self {
        Self::Error(error.to_string())
    }
}

impl Display for ControlResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlResponse::Status(json) => writeln!(f, "{}", json.trim_end()),
            ControlResponse::Yielded(path) => writeln!(f, "OK yielded {}", path.display()),
            ControlResponse::AlreadyYielded(path) => {
                writeln!(f, "OK already yielded {}", path.display())
            }
            ControlResponse::Reclaimed(path) => writeln!(f, "OK reclaimed {}", path.display()),
            ControlResponse::AlreadyMonitoring(path) => {
                writeln!(f, "OK already monitoring {}", path.display())
            }
            ControlResponse::ShuttingDown => writeln!(f, "OK shutting down"),
            ControlResponse::Error(message) => writeln!(f, "ERROR {message}"),
        }
    }
}

/// The listening control socket.
///
/// The socket file is removed when this is dropped.
#[derive(Debug)]
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Listen at `path`, replacing any stale socket file left there.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: &Path) -> io::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale control socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(path)?;
        debug!(path = %path.display(), "Control socket listening");

        Ok(Self {
            listener,
            path: path.into(),
        })
    }

    /// Where the socket lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next client.
    pub async fn accept(&self) -> io::Result<ControlConnection> {
        let (stream, _) = self.listener.accept().await?;
        trace!("Control client connected");

        Ok(ControlConnection { stream })
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), ?e, "Could not remove control socket");
            }
        }
    }
}

/// One accepted client.
#[derive(Debug)]
pub struct ControlConnection {
    stream: UnixStream,
}

impl ControlConnection {
    /// Read one request line, bounded by [`MAX_REQUEST`] and [`IO_TIMEOUT`].
    ///
    /// A client that stops sending before the line ending gets whatever
    /// arrived until the timeout treated as its request.
    pub async fn read_command(&mut self) -> io::Result<ControlCommand> {
        let mut request = Vec::with_capacity(64);

        let read = tokio::time::timeout(IO_TIMEOUT, read_request(&mut self.stream, &mut request)).await;

        match read {
            Ok(read) => read?,
            Err(_) if request.is_empty() => return Err(io::ErrorKind::TimedOut.into()),
            Err(_) => trace!(len = request.len(), "Unterminated control request"),
        }

        if let Some(newline) = request.iter().position(|&b| b == b'\n') {
            request.truncate(newline);
        }

        let text = String::from_utf8_lossy(&request);
        trace!(request = %text.trim_end(), "Control request");

        match text.parse() {
            Ok(command) => Ok(command),
            Err(never) => match never {},
        }
    }

    /// Send the response, bounded by [`IO_TIMEOUT`].
    pub async fn respond(&mut self, response: &ControlResponse) -> io::Result<()> {
        let text = response.to_string();

        tokio::time::timeout(IO_TIMEOUT, async {
            self.stream.write_all(text.as_bytes()).await?;
            self.stream.shutdown().await
        })
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
    }
}

async fn read_request(stream: &mut UnixStream, request: &mut Vec<u8>) -> io::Result<()> {
    let mut buf = [0u8; MAX_REQUEST];

    while request.len() < MAX_REQUEST && !request.contains(&b'\n') {
        let room = MAX_REQUEST - request.len();
        let n = stream.read(&mut buf[..room]).await?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
    }

    Ok(())
}

/// Send one command to a running daemon and get its raw response.
pub async fn send_command(socket: &Path, command: &ControlCommand) -> io::Result<String> {
    tokio::time::timeout(CLIENT_TIMEOUT, async {
        let mut stream = UnixStream::connect(socket).await?;

        stream.write_all(format!("{command}\n").as_bytes()).await?;

        let mut response = String::new();
        stream.read_to_string(&mut response).await?;

        Ok(response)
    })
    .await
    .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(s: &str) -> ControlCommand {
        s.parse().unwrap()
    }

    #[test]
    fn parse_commands() {
        assert_eq!(parse("STATUS"), ControlCommand::Status);
        assert_eq!(parse("QUIT\n"), ControlCommand::Quit);
        assert_eq!(
            parse("YIELD /dev/ttyUSB0\r\n"),
            ControlCommand::Yield("/dev/ttyUSB0".into())
        );
        assert_eq!(
            parse("RECLAIM /dev/ttyACM1\n"),
            ControlCommand::Reclaim("/dev/ttyACM1".into())
        );
    }

    #[test]
    fn parse_unrecognized() {
        assert_eq!(parse("status\n"), ControlCommand::Unrecognized("status".into()));
        assert_eq!(parse("YIELD\n"), ControlCommand::Unrecognized("YIELD".into()));
        assert_eq!(parse("QUIT now"), ControlCommand::Unrecognized("QUIT now".into()));
        assert_eq!(parse(""), ControlCommand::Unrecognized("".into()));
    }

    #[test]
    fn command_wire_form_parses_back() {
        for command in [
            ControlCommand::Status,
            ControlCommand::Quit,
            ControlCommand::Yield("/dev/ttyUSB3".into()),
            ControlCommand::Reclaim("/dev/ttyUSB3".into()),
        ] {
            assert_eq!(parse(&command.to_string()), command);
        }
    }

    #[test]
    fn response_wire_text() {
        let path = PathBuf::from("/dev/ttyUSB0");

        assert_eq!(
            ControlResponse::Yielded(path.clone()).to_string(),
            "OK yielded /dev/ttyUSB0\n"
        );
        assert_eq!(
            ControlResponse::AlreadyYielded(path.clone()).to_string(),
            "OK already yielded /dev/ttyUSB0\n"
        );
        assert_eq!(
            ControlResponse::Reclaimed(path.clone()).to_string(),
            "OK reclaimed /dev/ttyUSB0\n"
        );
        assert_eq!(
            ControlResponse::AlreadyMonitoring(path.clone()).to_string(),
            "OK already monitoring /dev/ttyUSB0\n"
        );
        assert_eq!(ControlResponse::ShuttingDown.to_string(), "OK shutting down\n");
        assert_eq!(
            ControlResponse::unknown("HELLO").to_string(),
            "ERROR unknown command: HELLO\n"
        );
        assert_eq!(
            ControlResponse::from(&Error::PortNotFound(path.clone())).to_string(),
            "ERROR port not found: /dev/ttyUSB0\n"
        );
        assert_eq!(
            ControlResponse::Status("{\n  \"pid\": 1\n}\n".into()).to_string(),
            "{\n  \"pid\": 1\n}\n"
        );
    }

    #[tokio::test]
    async fn round_trip_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        let server = ControlServer::bind(&path).unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move { send_command(&path, &ControlCommand::Yield("/dev/ttyUSB0".into())).await }
        });

        let mut connection = server.accept().await.unwrap();
        let command = connection.read_command().await.unwrap();
        assert_eq!(command, ControlCommand::Yield("/dev/ttyUSB0".into()));

        connection
            .respond(&ControlResponse::Yielded("/dev/ttyUSB0".into()))
            .await
            .unwrap();

        let response = client.await.unwrap().unwrap();
        assert_eq!(response, "OK yielded /dev/ttyUSB0\n");
    }

    #[tokio::test]
    async fn stale_socket_is_replaced_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        std::fs::write(&path, "stale").unwrap();

        let server = ControlServer::bind(&path).unwrap();
        assert_eq!(server.path(), path);

        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn oversized_request_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        let server = ControlServer::bind(&path).unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        let huge = "A".repeat(4 * MAX_REQUEST);
        client.write_all(huge.as_bytes()).await.unwrap();

        let mut connection = server.accept().await.unwrap();
        match connection.read_command().await.unwrap() {
            ControlCommand::Unrecognized(text) => assert_eq!(text.len(), MAX_REQUEST),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unterminated_request_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        let server = ControlServer::bind(&path).unwrap();

        // No line ending, and the connection stays open.
        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(b"STATUS").await.unwrap();

        let mut connection = server.accept().await.unwrap();
        assert_eq!(connection.read_command().await.unwrap(), ControlCommand::Status);

        connection
            .respond(&ControlResponse::Status("{}".into()))
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert_eq!(response, "{}\n");
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        let server = ControlServer::bind(&path).unwrap();

        let _client = UnixStream::connect(&path).await.unwrap();
        let mut connection = server.accept().await.unwrap();

        let started = std::time::Instant::now();
        let error = connection.read_command().await.unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < IO_TIMEOUT * 3);
    }
}
