//! Worker process implementation for the master.
//!
//! Each worker is a forked copy of the master that builds its own
//! [`Runtime`] over the inherited listening descriptor and exits when the
//! runtime returns. Workers never share memory; the master reaches them only
//! through signals.

use std::os::fd::RawFd;
use std::rc::Rc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, error};

use crate::config::ServerConfig;
use crate::connection::Service;
use crate::error::Result;
use crate::logging::LogContext;
use crate::runtime::Runtime;

/// The master's handle to one forked worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerHandle {
    /// Worker index, `0..workers`.
    pub id: usize,
    /// Process id of the worker.
    pub pid: Pid,
}

impl WorkerHandle {
    /// Sends `signal` to the worker.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        kill(self.pid, signal).inspect_err(|e| {
            error!(worker = self.id, pid = %self.pid, %signal, error = %e, "kill failed");
        })?;
        Ok(())
    }
}

/// Forks worker `id`.
///
/// Returns the handle in the master. In the child this never returns: the
/// runtime runs to completion and the process exits with 0, or with 1 when
/// the runtime cannot be built.
pub(crate) fn spawn<F>(
    id: usize,
    config: &ServerConfig,
    listener: RawFd,
    logs: &LogContext,
    make_service: &F,
) -> Result<WorkerHandle>
where
    F: Fn(usize, &LogContext) -> Rc<dyn Service>,
{
    // SAFETY: the master is single-threaded at this point, so the child
    // starts with a consistent copy of every lock and allocator.
    match unsafe { fork() }.inspect_err(|e| error!(worker = id, error = %e, "fork failed"))? {
        ForkResult::Parent { child } => {
            debug!(worker = id, pid = %child, "worker forked");
            Ok(WorkerHandle { id, pid: child })
        }
        ForkResult::Child => {
            let code = run(id, config, listener, logs, make_service);
            std::process::exit(code);
        }
    }
}

fn run<F>(id: usize, config: &ServerConfig, listener: RawFd, logs: &LogContext, make_service: &F) -> i32
where
    F: Fn(usize, &LogContext) -> Rc<dyn Service>,
{
    let service = make_service(id, logs);
    match Runtime::new(id, config, listener, service, logs.clone()) {
        Ok(runtime) => {
            runtime.run();
            0
        }
        Err(e) => {
            error!(worker = id, error = %e, "worker failed to start");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};

    #[test]
    fn signal_reaches_a_live_process() {
        // A forked child that just sleeps stands in for a worker.
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                nix::unistd::sleep(5);
                unsafe { nix::libc::_exit(0) }
            }
            ForkResult::Parent { child } => child,
        };

        let handle = WorkerHandle { id: 0, pid: child };
        handle.signal(Signal::SIGKILL).unwrap();
        assert!(matches!(
            waitpid(child, None).unwrap(),
            WaitStatus::Signaled(_, Signal::SIGKILL, _)
        ));
    }
}
