//! Master process: fans the listening socket out to forked workers and
//! supervises them through signals.
//!
//! The master owns no reactor. After forking it blocks on a `signalfd` and
//! translates what it reads into signals for the workers.

mod worker;

pub use self::worker::WorkerHandle;

use std::os::fd::AsRawFd;
use std::rc::Rc;

use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::Service;
use crate::error::Result;
use crate::logging::LogContext;
use crate::net;
use crate::signal::{self, SignalAction, WORKER_RELOAD, WORKER_SHUTDOWN};

/// Supervisor of the worker processes.
#[derive(Debug)]
pub struct Master {
    config: ServerConfig,
    logs: LogContext,
    workers: Vec<WorkerHandle>,
}

impl Master {
    pub fn new(config: ServerConfig, logs: LogContext) -> Self {
        Self {
            config,
            logs,
            workers: Vec::new(),
        }
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Starts the workers and supervises them until all have exited.
    ///
    /// `make_service` runs inside each child to build that worker's service.
    pub fn run<F>(mut self, make_service: F) -> Result<()>
    where
        F: Fn(usize, &LogContext) -> Rc<dyn Service>,
    {
        raise_open_files(self.config.max_open_files);

        // Blocked before forking so children inherit the mask and nothing is
        // delivered asynchronously in either role.
        let handled = signal::server_signals();
        signal::block(&handled)?;

        let listener = net::bind_listener(self.config.listen_addr(), self.config.listen_backlog)?;
        info!(addr = %self.config.listen_addr(), workers = self.config.workers, "master started");

        for id in 0..self.config.workers {
            match worker::spawn(id, &self.config, listener.as_raw_fd(), &self.logs, &make_service) {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.broadcast(WORKER_SHUTDOWN);
                    self.reap_all();
                    return Err(e);
                }
            }
        }

        let result = self.supervise(&master_signals());
        info!("master exiting");
        result
    }

    fn supervise(&mut self, signals: &SigSet) -> Result<()> {
        let mut fd = SignalFd::with_flags(signals, SfdFlags::SFD_CLOEXEC).inspect_err(|e| {
            error!(error = %e, "signalfd creation failed");
        })?;

        let mut shutting_down = false;
        while !self.workers.is_empty() {
            let info = match fd.read_signal() {
                Ok(Some(info)) => info,
                Ok(None) | Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "signalfd read failed");
                    self.broadcast(WORKER_SHUTDOWN);
                    self.reap_all();
                    return Err(e.into());
                }
            };
            let Ok(received) = Signal::try_from(info.ssi_signo as i32) else {
                continue;
            };

            match SignalAction::for_master(received) {
                Some(SignalAction::Shutdown) if !shutting_down => {
                    info!(signal = %received, "shutting workers down");
                    shutting_down = true;
                    self.broadcast(WORKER_SHUTDOWN);
                }
                Some(SignalAction::Shutdown) => debug!(signal = %received, "already shutting down"),
                Some(SignalAction::Reload) => {
                    info!(signal = %received, "reopening logs");
                    self.broadcast(WORKER_RELOAD);
                    self.logs.reopen();
                }
                Some(SignalAction::ChildExited) => self.reap(shutting_down),
                None => {}
            }
        }
        Ok(())
    }

    /// Sends `sig` to every live worker. Failures are logged per worker.
    fn broadcast(&self, sig: Signal) {
        for worker in &self.workers {
            let _ = worker.signal(sig);
        }
    }

    /// Collects every worker that has exited, without blocking.
    fn reap(&mut self, expected: bool) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let Some(pid) = status.pid() else { break };
                    if expected {
                        debug!(pid = %pid, ?status, "worker exited");
                    } else {
                        warn!(pid = %pid, ?status, "worker exited unexpectedly");
                    }
                    self.workers.retain(|w| w.pid != pid);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    self.workers.clear();
                    break;
                }
                Err(e) => {
                    error!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
    }

    /// Blocks until every worker has exited.
    fn reap_all(&mut self) {
        while let Some(worker) = self.workers.pop() {
            loop {
                match waitpid(worker.pid, None) {
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        error!(pid = %worker.pid, error = %e, "waitpid failed");
                        break;
                    }
                    Ok(_) => break,
                }
            }
        }
    }
}

/// Signals the master reacts to.
fn master_signals() -> SigSet {
    let mut set = SigSet::empty();
    for sig in [
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGCHLD,
    ] {
        set.add(sig);
    }
    set
}

/// Sets `RLIMIT_NOFILE` to `limit`; 0 leaves it unchanged.
fn raise_open_files(limit: u64) {
    if limit == 0 {
        return;
    }
    match setrlimit(Resource::RLIMIT_NOFILE, limit, limit) {
        Ok(()) => debug!(limit, "open file limit set"),
        Err(e) => warn!(limit, error = %e, "setrlimit(RLIMIT_NOFILE) failed, keeping current limit"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_signals_are_a_subset_of_server_signals() {
        let all = signal::server_signals();
        for sig in master_signals().iter() {
            assert!(all.contains(sig));
            assert!(SignalAction::for_master(sig).is_some());
        }
    }
}
