//! Error types shared by the reactor, the connection manager and the
//! process supervisor.

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every fallible operation in the crate reports one of these.
#[derive(Error, Debug)]
pub enum Error {
    /// The system allocator refused an arena block.
    #[error("arena allocation of {size} bytes failed")]
    OutOfMemory {
        /// Bytes requested from the system allocator.
        size: usize,
    },

    /// A descriptor does not fit the reactor's slot array.
    #[error("descriptor {fd} exceeds reactor capacity {capacity}")]
    DescriptorOutOfRange { fd: RawFd, capacity: usize },

    /// The timer pool reached its bound.
    #[error("timer pool exhausted ({limit} timers)")]
    TimerCapacity { limit: usize },

    /// Creating the multiplexer instance failed.
    #[error("failed to create multiplexer: {0}")]
    PollerCreate(#[source] io::Error),

    /// A multiplexer control call (add/modify/delete) failed.
    #[error("multiplexer {op} failed for fd {fd}: {source}")]
    Control {
        op: &'static str,
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// The request handler refused a request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Configuration did not pass validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A process-control syscall (fork, kill, waitpid, sigprocmask) failed.
    #[error("process control failed: {0}")]
    Process(#[from] nix::Error),

    /// The metrics exporter could not be installed.
    #[error("metrics exporter: {0}")]
    Metrics(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Shorthand for a handler-side rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Error::Rejected(reason.into())
    }
}
