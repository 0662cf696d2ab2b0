//! Error and access logs.
//!
//! The error log is the `tracing` output; the access log gets one line per
//! served request. Both are plain append-mode files that can be reopened in
//! place after an external rotation, and both fall back to stderr when no path
//! is configured.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::error::Result;

struct Inner {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

/// A reopenable append-only log destination.
#[derive(Clone)]
pub struct LogFile(Arc<Inner>);

impl LogFile {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path)?;
        Ok(Self(Arc::new(Inner {
            path: Some(path),
            file: Mutex::new(Some(file)),
        })))
    }

    /// A destination that writes to stderr.
    pub fn stderr() -> Self {
        Self(Arc::new(Inner {
            path: None,
            file: Mutex::new(None),
        }))
    }

    fn from_config(path: Option<&Path>) -> io::Result<Self> {
        match path {
            Some(path) => Self::open(path),
            None => Ok(Self::stderr()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.0.path.as_deref()
    }

    /// Reopens the file at its configured path. Stderr destinations are untouched.
    pub fn reopen(&self) -> io::Result<()> {
        let Some(path) = self.0.path.as_deref() else {
            return Ok(());
        };
        let file = open_append(path)?;
        *self.0.file.lock() = Some(file);
        Ok(())
    }
}

impl io::Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.file.lock().as_mut() {
            Some(file) => file.write(buf),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.file.lock().as_mut() {
            Some(file) => file.flush(),
            None => io::stderr().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl fmt::Debug for LogFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path() {
            Some(path) => write!(f, "LogFile({})", path.display()),
            None => f.write_str("LogFile(stderr)"),
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// One line per served request.
#[derive(Debug, Clone)]
pub struct AccessLog {
    file: LogFile,
}

impl AccessLog {
    pub fn new(file: LogFile) -> Self {
        Self { file }
    }

    /// Appends `<unix-seconds> <peer> <bytes-in> <bytes-out> <first request line>`.
    pub fn record(&self, peer: Option<SocketAddr>, bytes_in: usize, bytes_out: usize, request: &[u8]) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let first = request
            .split(|&b| b == b'\n')
            .next()
            .unwrap_or_default();
        let first = String::from_utf8_lossy(first);
        let first = first.trim_end_matches('\r');
        let peer = peer.map_or_else(|| "-".to_string(), |p| p.to_string());

        let mut file = self.file.clone();
        if let Err(e) = writeln!(file, "{ts} {peer} {bytes_in} {bytes_out} \"{first}\"") {
            error!(error = %e, "access log write failed");
        }
    }

    pub fn reopen(&self) -> io::Result<()> {
        self.file.reopen()
    }
}

/// Logging state shared by one process: both destinations plus the filter.
#[derive(Debug, Clone)]
pub struct LogContext {
    error_log: LogFile,
    access_log: AccessLog,
}

impl LogContext {
    /// Opens the configured files without touching the global subscriber.
    pub fn open(config: &ServerConfig) -> Result<Self> {
        Ok(Self {
            error_log: LogFile::from_config(config.error_log.as_deref())?,
            access_log: AccessLog::new(LogFile::from_config(config.access_log.as_deref())?),
        })
    }

    /// Opens the configured files and installs the global `tracing` subscriber
    /// writing to the error log.
    ///
    /// `RUST_LOG`, when set, overrides `log_level`.
    pub fn init(config: &ServerConfig) -> Result<Self> {
        let ctx = Self::open(config)?;

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(ctx.error_log.clone())
            .with_ansi(ctx.error_log.path().is_none())
            .try_init();
        if installed.is_err() {
            debug!("tracing subscriber already installed");
        }
        Ok(ctx)
    }

    pub fn access_log(&self) -> &AccessLog {
        &self.access_log
    }

    /// Reopens both files. Failures are logged and otherwise ignored.
    pub fn reopen(&self) {
        if let Err(e) = self.error_log.reopen() {
            error!(error = %e, path = ?self.error_log.path(), "failed to reopen error log");
        }
        if let Err(e) = self.access_log.reopen() {
            error!(error = %e, "failed to reopen access log");
        }
        debug!("log files reopened");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn reopen_follows_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("error.log");
        let rotated = dir.path().join("error.log.1");

        let mut log = LogFile::open(&path).unwrap();
        writeln!(log, "before").unwrap();
        fs::rename(&path, &rotated).unwrap();

        writeln!(log, "still old").unwrap();
        log.reopen().unwrap();
        writeln!(log, "after").unwrap();

        assert_eq!(fs::read_to_string(&rotated).unwrap(), "before\nstill old\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "after\n");
    }

    #[test]
    fn access_log_records_first_request_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let log = AccessLog::new(LogFile::open(&path).unwrap());

        log.record(
            Some("127.0.0.1:4000".parse().unwrap()),
            18,
            40,
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
        );

        let line = fs::read_to_string(&path).unwrap();
        assert!(line.ends_with(" 127.0.0.1:4000 18 40 \"GET / HTTP/1.1\"\n"), "{line}");
    }

    #[test]
    fn stderr_reopen_is_a_no_op() {
        assert!(LogFile::stderr().reopen().is_ok());
    }
}
