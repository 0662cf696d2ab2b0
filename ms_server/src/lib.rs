//! A multi-process TCP server engine built around a single-threaded reactor.
//!
//! A master process binds one listening socket, forks a fixed number of
//! workers and supervises them through signals. Each worker runs its own
//! event loop over the shared listener. It consists of:
//!
//! - [`arena`]: Bump allocator backing per-connection buffers
//! - [`rbtree`]: Index-based red-black tree ordering timer deadlines
//! - [`reactor`]: Readiness multiplexing, interest registration and timers
//! - [`connection`]: Accept/read/process/write state machine and the [`connection::Service`] seam
//! - [`runtime`]: One worker's reactor, connection manager and signal watcher
//! - [`process`]: Master supervision of forked workers
//! - [`signal`], [`logging`], [`config`], [`net`], [`clock`]: Supporting plumbing
//! - [`testing`]: Mock poller, sockets and clock for deterministic tests

pub mod arena;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod net;
pub mod process;
pub mod rbtree;
pub mod reactor;
pub mod runtime;
pub mod signal;
pub mod testing;

pub use error::{Error, Result};
