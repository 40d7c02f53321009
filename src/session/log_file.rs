use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::session::timestamp;

/// Longest partial line kept before it is forced out.
pub const LINE_BUF_SIZE: usize = 2048;

#[derive(Debug)]
struct PendingLine {
    started: Instant,
    timestamp: String,
}

/// An append-only, line-timestamped log of one port's output.
///
/// Every line written gets a `[YYYY-MM-DD HH:MM:SS.mmm] ` prefix
/// taken when the first byte of that line arrived.
#[derive(Debug)]
pub struct LogFile {
    file: Option<File>,
    path: PathBuf,

    line: Vec<u8>,
    pending: Option<PendingLine>,

    // The previous chunk ended in `\r`, so a leading `\n` belongs to it.
    pending_cr: bool,

    // The previous line was split because the buffer filled up.
    split: bool,

    bytes_written: u64,
}

impl LogFile {
    /// Create or append-open the file at `path`.
    ///
    /// A non-empty `header` is written as a session banner first.
    pub fn open(path: &Path, header: &str) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let mut log = Self {
            file: Some(file),
            path: path.into(),
            line: Vec::with_capacity(LINE_BUF_SIZE),
            pending: None,
            pending_cr: false,
            split: false,
            bytes_written: 0,
        };

        if !header.is_empty() {
            let banner = format!(
                "=== UART Monitor Session ===\n{header}Started: {}\n===\n\n",
                timestamp()
            );
            log.write_raw(banner.as_bytes())?;
        }

        debug!(path = %path.display(), "Log opened");

        Ok(log)
    }

    /// Where the log lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content bytes and line breaks received so far.
    /// Timestamps, markers and headers are not counted.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// True once [`LogFile::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Append raw device output.
    ///
    /// `\r\n` and a lone `\r` both end a line, also when the pair is split
    /// across two calls. Complete lines go to disk right away.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        for &byte in data {
            if std::mem::take(&mut self.pending_cr) && byte == b'\n' {
                continue;
            }

            match byte {
                b'\r' => {
                    self.end_line()?;
                    self.pending_cr = true;
                }
                b'\n' => self.end_line()?,
                byte => {
                    if self.pending.is_none() {
                        self.pending = Some(PendingLine {
                            started: Instant::now(),
                            timestamp: timestamp(),
                        });
                    }

                    self.line.push(byte);
                    self.bytes_written += 1;

                    if self.line.len() >= LINE_BUF_SIZE {
                        trace!(path = %self.path.display(), "Line buffer full, splitting");
                        self.write_pending()?;
                        self.split = true;
                    }
                }
            }
        }

        Ok(())
    }

    /// Write out a pending partial line, terminated by a newline.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_some() {
            self.write_pending()?;
        }

        Ok(())
    }

    /// [`LogFile::flush`], but only if the partial line is older than `max_age`.
    pub fn flush_if_stale(&mut self, max_age: Duration) -> io::Result<()> {
        match &self.pending {
            Some(pending) if pending.started.elapsed() >= max_age => self.flush(),
            _ => Ok(()),
        }
    }

    /// Record an event, e.g. the port being released, as its own block.
    pub fn marker(&mut self, text: &str) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        self.flush()?;
        self.write_raw(format!("\n--- {text} [{}] ---\n\n", timestamp()).as_bytes())
    }

    /// Flush and release the file.
    /// Calling this again, or writing afterwards, does nothing.
    pub fn close(&mut self) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let flushed = self.flush();
        self.file = None;
        debug!(path = %self.path.display(), bytes = self.bytes_written, "Log closed");

        flushed
    }

    fn end_line(&mut self) -> io::Result<()> {
        self.bytes_written += 1;

        if self.pending.is_some() {
            self.write_pending()
        } else if std::mem::take(&mut self.split) {
            // The line break already went out with the split.
            Ok(())
        } else {
            self.write_raw(b"\n")
        }
    }

    fn write_pending(&mut self) -> io::Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        self.split = false;

        let mut out = Vec::with_capacity(pending.timestamp.len() + self.line.len() + 4);
        out.push(b'[');
        out.extend_from_slice(pending.timestamp.as_bytes());
        out.extend_from_slice(b"] ");
        out.append(&mut self.line);
        out.push(b'\n');

        self.write_raw(&out)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.file {
            Some(file) => file.write_all(bytes),
            None => Ok(()),
        }
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn open_blank(dir: &tempfile::TempDir) -> LogFile {
        LogFile::open(&dir.path().join("port.log"), "").unwrap()
    }

    fn contents(log: &LogFile) -> String {
        std::fs::read_to_string(log.path()).unwrap()
    }

    // Strip the `[...] ` prefix of each line.
    fn strip_timestamps(s: &str) -> Vec<String> {
        s.lines()
            .map(|line| match line.strip_prefix('[') {
                Some(rest) => rest.split_once("] ").map(|(_, l)| l).unwrap_or(line).into(),
                None => line.into(),
            })
            .collect()
    }

    fn is_timestamped(line: &str) -> bool {
        // [2024-01-31 12:34:56.789]
        line.len() > 26
            && line.as_bytes()[0] == b'['
            && line.as_bytes()[24] == b']'
            && line.as_bytes()[20] == b'.'
    }

    #[test]
    fn two_lines_two_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_blank(&dir);

        log.write(b"Hello world\n").unwrap();
        log.write(b"Second line\n").unwrap();

        let text = contents(&log);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| is_timestamped(l)));
        assert_eq!(strip_timestamps(&text), ["Hello world", "Second line"]);
    }

    #[test]
    fn crlf_is_one_line_break() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_blank(&dir);

        log.write(b"line1\r\nline2\r\n").unwrap();

        assert_eq!(strip_timestamps(&contents(&log)), ["line1", "line2"]);
        assert_eq!(log.bytes_written(), 12);
    }

    #[test]
    fn crlf_split_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_blank(&dir);

        log.write(b"one\r").unwrap();
        log.write(b"\ntwo\n").unwrap();

        assert_eq!(strip_timestamps(&contents(&log)), ["one", "two"]);
    }

    #[test]
    fn lone_cr_ends_a_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_blank(&dir);

        log.write(b"progress 10%\rprogress 20%\r").unwrap();

        assert_eq!(
            strip_timestamps(&contents(&log)),
            ["progress 10%", "progress 20%"]
        );
    }

    #[test]
    fn empty_line_is_bare_newline() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_blank(&dir);

        log.write(b"a\n\nb\n").unwrap();

        let text = contents(&log);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[1], "");
        assert_eq!(strip_timestamps(&text), ["a", "", "b"]);
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_blank(&dir);

        log.write(b"U-Boot 2023").unwrap();
        assert_eq!(contents(&log), "");

        log.write(b".01\n").unwrap();
        assert_eq!(strip_timestamps(&contents(&log)), ["U-Boot 2023.01"]);
    }

    #[test]
    fn stale_partial_line_is_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_blank(&dir);

        log.write(b"login: ").unwrap();

        log.flush_if_stale(Duration::from_secs(60)).unwrap();
        assert_eq!(contents(&log), "");

        std::thread::sleep(Duration::from_millis(20));
        log.flush_if_stale(Duration::from_millis(10)).unwrap();
        assert_eq!(strip_timestamps(&contents(&log)), ["login: "]);

        // Nothing pending any more.
        log.flush_if_stale(Duration::ZERO).unwrap();
        assert_eq!(contents(&log).lines().count(), 1);
    }

    #[test]
    fn full_buffer_is_split() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_blank(&dir);

        let long = vec![b'x'; LINE_BUF_SIZE + 10];
        log.write(&long).unwrap();
        log.write(b"\n").unwrap();

        let lines = strip_timestamps(&contents(&log));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), LINE_BUF_SIZE);
        assert_eq!(lines[1].len(), 10);
    }

    #[test]
    fn split_exactly_at_newline_adds_no_blank_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_blank(&dir);

        let mut exact = vec![b'y'; LINE_BUF_SIZE];
        exact.push(b'\n');
        log.write(&exact).unwrap();
        log.write(b"next\n").unwrap();

        let lines = strip_timestamps(&contents(&log));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "next");
    }

    #[test]
    fn marker_is_a_separate_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_blank(&dir);

        log.write(b"before").unwrap();
        log.marker("PORT YIELDED (released for flashing)").unwrap();
        log.write(b"after\n").unwrap();

        let text = contents(&log);
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("] before"));
        assert_eq!(lines[1], "");
        assert!(lines[2].starts_with("--- PORT YIELDED (released for flashing) ["));
        assert!(lines[2].ends_with("] ---"));
        assert_eq!(lines[3], "");
        assert!(lines[4].ends_with("] after"));
    }

    #[test]
    fn header_banner() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::open(&dir.path().join("h.log"), "Device: /dev/ttyUSB0\n").unwrap();

        let text = contents(&log);
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines[0], "=== UART Monitor Session ===");
        assert_eq!(lines[1], "Device: /dev/ttyUSB0");
        assert!(lines[2].starts_with("Started: "));
        assert_eq!(lines[3], "===");
        assert_eq!(lines[4], "");
        assert_eq!(log.bytes_written(), 0);
    }

    #[test]
    fn close_flushes_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_blank(&dir);

        log.write(b"partial").unwrap();
        log.close().unwrap();
        log.close().unwrap();
        assert!(log.is_closed());

        log.write(b"ignored\n").unwrap();
        log.marker("ignored").unwrap();

        assert_eq!(strip_timestamps(&contents(&log)), ["partial"]);
    }

    #[test]
    fn reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("again.log");

        LogFile::open(&path, "").unwrap().write(b"first\n").unwrap();
        LogFile::open(&path, "").unwrap().write(b"second\n").unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(strip_timestamps(&text), ["first", "second"]);
    }
}
