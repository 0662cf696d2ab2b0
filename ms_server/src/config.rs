//! Server configuration loaded from TOML.
//!
//! Every key is optional; missing keys take the defaults below.
//!
//! ```toml
//! listen_ip = "0.0.0.0"
//! listen_port = 8080
//! workers = 4
//! capacity = 10240
//! read_timeout_ms = 30000
//! error_log = "/var/log/ms_server/error.log"
//! ```

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::arena::DEFAULT_CAPACITY;
use crate::connection::{ConnectionSettings, DEFAULT_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::net::{Keepalive, SocketOptions};
use crate::reactor::ReactorConfig;

/// Upper bound on forked workers.
pub const MAX_WORKERS: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub listen_backlog: i32,
    /// Worker processes, clamped to `1..=48`.
    pub workers: usize,
    /// Capacity of each reactor arena block.
    pub arena_size: usize,
    /// Descriptor slots per worker; also the per-iteration event limit.
    pub capacity: usize,
    /// Size of each connection's receive and send buffer.
    pub buffer_size: usize,
    /// Longest single multiplexer wait; negative waits indefinitely.
    pub max_wait_ms: i64,
    /// 0 disables the read timeout.
    pub read_timeout_ms: u64,
    /// 0 disables the write timeout.
    pub write_timeout_ms: u64,
    pub tcp_nodelay: bool,
    pub keepalive: bool,
    pub keepalive_idle_secs: u64,
    pub keepalive_interval_secs: u64,
    pub keepalive_count: u32,
    /// `RLIMIT_NOFILE` to request before forking; 0 leaves it alone.
    pub max_open_files: u64,
    /// Error log path; stderr when unset.
    pub error_log: Option<PathBuf>,
    /// Access log path; stderr when unset.
    pub access_log: Option<PathBuf>,
    /// `tracing` filter directive, e.g. `info` or `ms_server=debug`.
    pub log_level: String,
    /// Base port of the per-worker Prometheus listener; worker `n` uses `base + n`.
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 8080,
            listen_backlog: 1024,
            workers: 1,
            arena_size: DEFAULT_CAPACITY,
            capacity: 1024,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_wait_ms: 1000,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            tcp_nodelay: false,
            keepalive: false,
            keepalive_idle_secs: 60,
            keepalive_interval_secs: 5,
            keepalive_count: 3,
            max_open_files: 0,
            error_log: None,
            access_log: None,
            log_level: "info".to_string(),
            metrics_port: None,
        }
    }
}

impl ServerConfig {
    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Parses and validates TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks. Out-of-range worker counts are clamped, not refused.
    pub fn validate(&mut self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config("capacity must be non-zero".into()));
        }
        if self.buffer_size < 2 {
            return Err(Error::Config("buffer_size must be at least 2".into()));
        }
        if self.listen_backlog <= 0 {
            return Err(Error::Config("listen_backlog must be positive".into()));
        }
        if self.keepalive && self.keepalive_idle_secs == 0 {
            return Err(Error::Config("keepalive_idle_secs must be positive".into()));
        }

        let clamped = self.workers.clamp(1, MAX_WORKERS);
        if clamped != self.workers {
            warn!(requested = self.workers, using = clamped, "worker count clamped");
            self.workers = clamped;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        u64::try_from(self.max_wait_ms).ok().map(Duration::from_millis)
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            nodelay: self.tcp_nodelay,
            keepalive: self.keepalive.then(|| Keepalive {
                idle: Duration::from_secs(self.keepalive_idle_secs),
                interval: Duration::from_secs(self.keepalive_interval_secs),
                retries: self.keepalive_count,
            }),
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            options: self.socket_options(),
            read_timeout_ms: self.read_timeout_ms,
            write_timeout_ms: self.write_timeout_ms,
        }
    }

    pub fn reactor_config(&self) -> ReactorConfig {
        ReactorConfig {
            capacity: self.capacity,
            arena_size: self.arena_size,
            payload_size: self.buffer_size * 2,
        }
    }
}
