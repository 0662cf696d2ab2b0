//! Readiness multiplexer behind the reactor.
//!
//! [`Poller`] is the seam the reactor talks to; [`MioPoller`] implements it
//! over `mio::Poll`. Registrations are edge-triggered and keyed by the raw
//! descriptor, so a ready event maps straight back to a reactor slot.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use tracing::trace;

bitflags! {
    /// Readiness bits, used both for registered interest and for reported events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u8 {
        /// Data can be read, or the peer hung up, or the socket has an error.
        const READABLE = 0b0000_0001;

        /// Data can be written, or the write half is closed.
        const WRITABLE = 0b0000_0010;
    }
}

impl Interest {
    /// Interest in both directions.
    pub fn both() -> Self {
        Self::READABLE | Self::WRITABLE
    }

    pub fn is_readable(&self) -> bool {
        self.contains(Self::READABLE)
    }

    pub fn is_writable(&self) -> bool {
        self.contains(Self::WRITABLE)
    }

    fn to_mio(self) -> Option<mio::Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Multiplexer control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Add,
    Modify,
    Delete,
}

impl Control {
    pub fn as_str(&self) -> &'static str {
        match self {
            Control::Add => "add",
            Control::Modify => "modify",
            Control::Delete => "delete",
        }
    }
}

/// One descriptor reported ready by [`Poller::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub ready: Interest,
}

/// A readiness multiplexer.
pub trait Poller {
    /// Adds, modifies or removes the registration of `fd`.
    ///
    /// `interest` is ignored for [`Control::Delete`].
    fn control(&mut self, op: Control, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Blocks for at most `timeout` (`None` = indefinitely) and appends up to
    /// `max` ready descriptors to `events`.
    ///
    /// An interrupted wait reports zero events rather than an error.
    fn wait(
        &mut self,
        events: &mut Vec<ReadyEvent>,
        max: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize>;
}

/// [`Poller`] backed by `mio` (epoll on Linux).
pub struct MioPoller {
    poll: Poll,
    events: Events,
}

impl MioPoller {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
        })
    }
}

impl Poller for MioPoller {
    fn control(&mut self, op: Control, fd: RawFd, interest: Interest) -> io::Result<()> {
        let registry = self.poll.registry();
        let token = Token(fd as usize);

        match op {
            Control::Delete => registry.deregister(&mut SourceFd(&fd)),
            Control::Add | Control::Modify => {
                let interest = interest.to_mio().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "empty interest")
                })?;
                if op == Control::Add {
                    registry.register(&mut SourceFd(&fd), token, interest)
                } else {
                    registry.reregister(&mut SourceFd(&fd), token, interest)
                }
            }
        }
    }

    fn wait(
        &mut self,
        events: &mut Vec<ReadyEvent>,
        max: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                trace!("poll interrupted");
                return Ok(0);
            }
            return Err(e);
        }

        let before = events.len();
        for event in self.events.iter().take(max) {
            let mut ready = Interest::empty();
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                ready |= Interest::READABLE;
            }
            if event.is_writable() || event.is_write_closed() {
                ready |= Interest::WRITABLE;
            }
            events.push(ReadyEvent {
                fd: event.token().0 as RawFd,
                ready,
            });
        }
        Ok(events.len() - before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn empty_interest_is_refused() {
        let mut poller = MioPoller::new(8).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let err = poller
            .control(Control::Add, a.as_raw_fd(), Interest::empty())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn reports_readable_descriptor() {
        let mut poller = MioPoller::new(8).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        poller
            .control(Control::Add, a.as_raw_fd(), Interest::READABLE)
            .unwrap();

        b.write_all(b"ping").unwrap();

        let mut events = Vec::new();
        let n = poller
            .wait(&mut events, 8, Some(Duration::from_millis(500)))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].fd, a.as_raw_fd());
        assert!(events[0].ready.is_readable());

        poller
            .control(Control::Delete, a.as_raw_fd(), Interest::empty())
            .unwrap();
    }

    #[test]
    fn wait_times_out_with_no_events() {
        let mut poller = MioPoller::new(8).unwrap();
        let mut events = Vec::new();
        let n = poller
            .wait(&mut events, 8, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
        assert!(events.is_empty());
    }
}
