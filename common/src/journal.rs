use std::{
    collections::VecDeque,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Write},
    net::UdpSocket,
    path::{Path, PathBuf},
};

use chrono::NaiveDateTime;
use thiserror::Error;

pub const NO_TIME_MARKER: &str = "- No Network Time -";
pub const SYSLOG_PORT: u16 = 514;
const SYSLOG_PRIORITY: u8 = 134;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: Option<NaiveDateTime>,
    pub message: String,
}

impl LogEntry {
    pub fn new(timestamp: Option<NaiveDateTime>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
        }
    }

    pub fn timestamp_text(&self) -> String {
        match self.timestamp {
            Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => NO_TIME_MARKER.to_string(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp_text(), self.message)
    }
}

/// Append-only diagnostic trail.
pub trait LogSink {
    fn append(&mut self, entry: &LogEntry);
}

/// Bounded in-memory copy of the most recent log lines.
#[derive(Debug, Clone)]
pub struct LogTail {
    lines: VecDeque<String>,
    bytes: usize,
    capacity_bytes: usize,
}

impl LogTail {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            capacity_bytes,
        }
    }

    pub fn push(&mut self, entry: &LogEntry) {
        let line = entry.to_string();
        self.bytes += line.len();
        self.lines.push_back(line);

        // Always keep the newest line, even if it alone exceeds the budget.
        while self.bytes > self.capacity_bytes && self.lines.len() > 1 {
            if let Some(evicted) = self.lines.pop_front() {
                self.bytes -= evicted.len();
            }
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.bytes = 0;
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.bytes + self.lines.len());
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// BSD-style syslog payload (local0.info) for the remote log transport.
pub fn syslog_datagram(tag: &str, message: &str) -> String {
    format!("<{SYSLOG_PRIORITY}>{tag}: {message}")
}

/// Fire-and-forget UDP syslog transport.
#[derive(Debug)]
pub struct SyslogForwarder {
    socket: UdpSocket,
    host: String,
    port: u16,
    tag: &'static str,
}

impl SyslogForwarder {
    /// `Ok(None)` when no host is configured.
    pub fn connect(host: &str, port: u16, tag: &'static str) -> io::Result<Option<Self>> {
        let host = host.trim();
        if host.is_empty() {
            return Ok(None);
        }
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        Ok(Some(Self {
            socket,
            host: host.to_string(),
            port,
            tag,
        }))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn forward(&self, message: &str) -> io::Result<()> {
        let payload = syslog_datagram(self.tag, message);
        self.socket
            .send_to(payload.as_bytes(), (self.host.as_str(), self.port))
            .map(|_| ())
    }
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("log file append failed: {0}")]
    File(io::Error),
    #[error("syslog send failed: {0}")]
    Syslog(io::Error),
}

/// Persistent log: an append-only file (when a filesystem is mounted), the
/// in-memory tail served to the UI, and an optional syslog forwarder.
#[derive(Debug)]
pub struct Journal {
    path: Option<PathBuf>,
    tail: LogTail,
    syslog: Option<SyslogForwarder>,
}

impl Journal {
    pub fn new(path: Option<PathBuf>, tail_bytes: usize) -> Self {
        Self {
            path,
            tail: LogTail::new(tail_bytes),
            syslog: None,
        }
    }

    pub fn set_syslog(&mut self, forwarder: Option<SyslogForwarder>) {
        self.syslog = forwarder;
    }

    pub fn syslog_host(&self) -> Option<&str> {
        self.syslog.as_ref().map(SyslogForwarder::host)
    }

    pub fn tail(&self) -> &LogTail {
        &self.tail
    }

    /// Every sink is attempted; a file error is reported ahead of a syslog error.
    pub fn write(&mut self, entry: &LogEntry) -> Result<(), JournalError> {
        self.tail.push(entry);

        let file = match &self.path {
            Some(path) => append_line(path, &entry.to_string()).map_err(JournalError::File),
            None => Ok(()),
        };
        let syslog = match &self.syslog {
            Some(syslog) => syslog.forward(&entry.message).map_err(JournalError::Syslog),
            None => Ok(()),
        };
        file.and(syslog)
    }

    /// Whole log file, or the in-memory tail if there is no file.
    pub fn contents(&self) -> io::Result<String> {
        let Some(path) = &self.path else {
            return Ok(self.tail.render());
        };
        match fs::read_to_string(path) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(self.tail.render()),
            Err(err) => Err(err),
        }
    }

    /// Empties the tail and truncates the file.
    pub fn clear(&mut self) -> io::Result<()> {
        self.tail.clear();
        if let Some(path) = &self.path {
            File::create(path)?;
        }
        Ok(())
    }
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn stamp() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 3)
            .unwrap()
    }

    #[test]
    fn renders_timestamp_or_marker() {
        let synced = LogEntry::new(Some(stamp()), "Ping OK for Router (10.0.0.1)");
        assert_eq!(
            synced.to_string(),
            "2026-03-09 07:05:03 Ping OK for Router (10.0.0.1)"
        );

        let unsynced = LogEntry::new(None, "Rebooting");
        assert_eq!(unsynced.to_string(), "- No Network Time - Rebooting");
    }

    #[test]
    fn tail_drops_oldest_lines_past_budget() {
        let mut tail = LogTail::new(64);
        for n in 0..10 {
            tail.push(&LogEntry::new(None, format!("entry {n}")));
        }

        let lines: Vec<&str> = tail.lines().collect();
        assert!(tail.render().len() <= 64 + tail.len());
        assert_eq!(lines.last(), Some(&"- No Network Time - entry 9"));
        assert!(!lines.contains(&"- No Network Time - entry 0"));
    }

    #[test]
    fn tail_keeps_single_oversized_line() {
        let mut tail = LogTail::new(4);
        tail.push(&LogEntry::new(None, "longer than the budget"));
        assert_eq!(tail.len(), 1);

        tail.clear();
        assert!(tail.is_empty());
        assert_eq!(tail.render(), "");
    }

    #[test]
    fn forwarder_sends_framed_datagram() {
        let listener = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        listener
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let forwarder = SyslogForwarder::connect(" 127.0.0.1 ", port, "RelayController")
            .unwrap()
            .unwrap();
        assert_eq!(forwarder.host(), "127.0.0.1");
        forwarder.forward("Ping failed for Modem").unwrap();

        let mut buffer = [0_u8; 128];
        let len = listener.recv(&mut buffer).unwrap();
        assert_eq!(
            &buffer[..len],
            b"<134>RelayController: Ping failed for Modem"
        );
    }

    #[test]
    fn forwarder_is_disabled_without_host() {
        assert!(SyslogForwarder::connect("  ", SYSLOG_PORT, "RelayController")
            .unwrap()
            .is_none());
    }

    fn scratch_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "relay-journal-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir.join("log.txt")
    }

    #[test]
    fn journal_appends_to_file_and_tail() {
        let path = scratch_file("append");
        let mut journal = Journal::new(Some(path.clone()), 512);

        journal.write(&LogEntry::new(None, "Ping failed for Modem")).unwrap();
        journal.write(&LogEntry::new(Some(stamp()), "Resetting Modem")).unwrap();

        let expected =
            "- No Network Time - Ping failed for Modem\n2026-03-09 07:05:03 Resetting Modem\n";
        assert_eq!(journal.contents().unwrap(), expected);
        assert_eq!(fs::read_to_string(&path).unwrap(), expected);
        assert_eq!(journal.tail().len(), 2);
    }

    #[test]
    fn journal_file_outlives_the_tail() {
        let path = scratch_file("reopen");
        let mut before = Journal::new(Some(path.clone()), 512);
        before.write(&LogEntry::new(None, "Rebooting")).unwrap();

        let after = Journal::new(Some(path), 512);
        assert!(after.tail().is_empty());
        assert_eq!(after.contents().unwrap(), "- No Network Time - Rebooting\n");
    }

    #[test]
    fn clearing_truncates_the_file() {
        let path = scratch_file("clear");
        let mut journal = Journal::new(Some(path.clone()), 512);
        journal.write(&LogEntry::new(None, "Resetting Modem")).unwrap();

        journal.clear().unwrap();
        assert!(journal.tail().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
        assert_eq!(journal.contents().unwrap(), "");
    }

    #[test]
    fn journal_without_file_serves_the_tail() {
        let mut journal = Journal::new(None, 512);
        journal.write(&LogEntry::new(None, "Log cleared")).unwrap();
        assert_eq!(journal.contents().unwrap(), "- No Network Time - Log cleared\n");
        assert_eq!(journal.syslog_host(), None);
    }

    #[test]
    fn frames_syslog_payload() {
        assert_eq!(
            syslog_datagram("RelayController", "Resetting Modem"),
            "<134>RelayController: Resetting Modem"
        );
    }
}
