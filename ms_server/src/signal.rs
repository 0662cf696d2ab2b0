//! Process signals as reactor events.
//!
//! Signals are blocked process-wide before any worker is forked and read back
//! through a `signalfd`, so they arrive as ordinary readiness on the reactor
//! instead of interrupting it.
//!
//! | process | signal                        | effect                        |
//! |---------|-------------------------------|-------------------------------|
//! | master  | `SIGINT`, `SIGQUIT`, `SIGTERM`| shut every worker down, exit  |
//! | master  | `SIGHUP`                      | reopen logs everywhere        |
//! | master  | `SIGCHLD`                     | reap exited workers           |
//! | worker  | `SIGUSR2`, `SIGTERM`          | stop the reactor              |
//! | worker  | `SIGUSR1`                     | reopen log files              |

use std::cell::RefCell;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::reactor::{FileHandler, Interest, Reactor};

/// Signal the master sends to stop a worker.
pub const WORKER_SHUTDOWN: Signal = Signal::SIGUSR2;

/// Signal the master sends to make a worker reopen its logs.
pub const WORKER_RELOAD: Signal = Signal::SIGUSR1;

/// What a received signal asks the process to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Shutdown,
    Reload,
    ChildExited,
}

impl SignalAction {
    /// Meaning of a signal delivered to the master.
    pub fn for_master(signal: Signal) -> Option<Self> {
        match signal {
            Signal::SIGINT | Signal::SIGQUIT | Signal::SIGTERM => Some(Self::Shutdown),
            Signal::SIGHUP => Some(Self::Reload),
            Signal::SIGCHLD => Some(Self::ChildExited),
            _ => None,
        }
    }

    /// Meaning of a signal delivered to a worker.
    pub fn for_worker(signal: Signal) -> Option<Self> {
        match signal {
            Signal::SIGUSR2 | Signal::SIGTERM => Some(Self::Shutdown),
            Signal::SIGUSR1 => Some(Self::Reload),
            _ => None,
        }
    }
}

/// Every signal the server handles, in either role.
pub fn server_signals() -> SigSet {
    let mut set = SigSet::empty();
    for signal in [
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGCHLD,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
    ] {
        set.add(signal);
    }
    set
}

/// Signals a worker listens for.
pub fn worker_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(WORKER_SHUTDOWN);
    set.add(WORKER_RELOAD);
    set.add(Signal::SIGTERM);
    set
}

/// Blocks `set` for the calling thread; inherited by forked children.
pub fn block(set: &SigSet) -> Result<()> {
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(set), None).inspect_err(|e| {
        error!(error = %e, "sigprocmask(SIG_BLOCK) failed");
    })?;
    Ok(())
}

/// Drains every pending signal from a signalfd.
pub(crate) fn drain(fd: &mut SignalFd) -> Vec<Signal> {
    let mut signals = Vec::new();
    loop {
        match fd.read_signal() {
            Ok(Some(info)) => match Signal::try_from(info.ssi_signo as i32) {
                Ok(signal) => signals.push(signal),
                Err(_) => debug!(signo = info.ssi_signo, "unknown signal number"),
            },
            Ok(None) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!(error = %e, "signalfd read failed");
                break;
            }
        }
    }
    signals
}

/// Worker-side watcher: a non-blocking signalfd registered on the reactor.
pub struct SignalWatcher {
    fd: RefCell<SignalFd>,
    raw: RawFd,
    on_reload: Box<dyn Fn()>,
}

impl SignalWatcher {
    /// Creates a watcher for `signals`, which must already be blocked.
    pub fn new(signals: &SigSet, on_reload: impl Fn() + 'static) -> Result<Rc<Self>> {
        let fd = SignalFd::with_flags(signals, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .inspect_err(|e| {
                error!(error = %e, "signalfd creation failed");
            })?;
        let raw = fd.as_raw_fd();
        Ok(Rc::new(Self {
            fd: RefCell::new(fd),
            raw,
            on_reload: Box::new(on_reload),
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.raw
    }

    pub fn register<P>(self: &Rc<Self>, reactor: &mut Reactor<P>) -> Result<()>
    where
        Self: FileHandler<P>,
    {
        reactor.register_interest(self.raw, Interest::READABLE, self.clone())
    }

    /// Signals received since the last call.
    pub fn pending(&self) -> Vec<Signal> {
        drain(&mut self.fd.borrow_mut())
    }
}

impl<P> FileHandler<P> for SignalWatcher {
    fn on_readable(self: Rc<Self>, reactor: &mut Reactor<P>, _: RawFd, _: Interest) {
        for signal in self.pending() {
            match SignalAction::for_worker(signal) {
                Some(SignalAction::Shutdown) => {
                    info!(%signal, "worker shutting down");
                    reactor.stop();
                }
                Some(SignalAction::Reload) => {
                    info!(%signal, "reopening log files");
                    (self.on_reload)();
                }
                _ => debug!(%signal, "ignored signal"),
            }
        }
    }
}
