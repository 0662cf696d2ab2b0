//! Deterministic stand-ins for the multiplexer, the socket layer and the
//! clock.
//!
//! Every mock is a cheap handle over shared state: hand one clone to the
//! reactor or connection manager and keep another to script and inspect.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::Result;
use crate::net::{SocketIo, SocketOptions};
use crate::reactor::{Control, Interest, Poller, Reactor, ReactorConfig, ReadyEvent};

/// Manually driven clock.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    now: Rc<Cell<u64>>,
}

impl MockClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get().wrapping_add(ms));
    }

    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

#[derive(Default)]
struct PollerState {
    registered: HashMap<RawFd, Interest>,
    calls: Vec<(Control, RawFd, Interest)>,
    script: VecDeque<Vec<ReadyEvent>>,
    waits: Vec<Option<Duration>>,
    fail_next: Option<io::ErrorKind>,
    fail_waits: usize,
    clock: Option<MockClock>,
}

/// Scripted multiplexer.
///
/// Each `wait` returns the next scripted batch. With an attached clock, a
/// wait that has nothing scripted advances the clock by its timeout, as if
/// it had really blocked.
#[derive(Clone, Default)]
pub struct MockPoller {
    state: Rc<RefCell<PollerState>>,
}

impl MockPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: MockClock) -> Self {
        let poller = Self::default();
        poller.state.borrow_mut().clock = Some(clock);
        poller
    }

    /// Queues one batch of ready events for a future `wait`.
    pub fn push_ready(&self, events: Vec<ReadyEvent>) {
        self.state.borrow_mut().script.push_back(events);
    }

    /// Queues a single ready descriptor.
    pub fn ready(&self, fd: RawFd, ready: Interest) {
        self.push_ready(vec![ReadyEvent { fd, ready }]);
    }

    /// Makes the next control call fail with `kind`.
    pub fn fail_next_control(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().fail_next = Some(kind);
    }

    /// Makes the next `count` waits fail with `ENOMEM`.
    pub fn fail_waits(&self, count: usize) {
        self.state.borrow_mut().fail_waits = count;
    }

    /// Interest currently registered for `fd`.
    pub fn registered(&self, fd: RawFd) -> Option<Interest> {
        self.state.borrow().registered.get(&fd).copied()
    }

    /// Every control call so far, successful or not.
    pub fn calls(&self) -> Vec<(Control, RawFd, Interest)> {
        self.state.borrow().calls.clone()
    }

    /// Timeouts passed to each `wait`.
    pub fn waits(&self) -> Vec<Option<Duration>> {
        self.state.borrow().waits.clone()
    }
}

impl Poller for MockPoller {
    fn control(&mut self, op: Control, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push((op, fd, interest));
        if let Some(kind) = state.fail_next.take() {
            return Err(io::Error::from(kind));
        }

        let known = state.registered.contains_key(&fd);
        match op {
            Control::Add if known => Err(io::Error::from(io::ErrorKind::AlreadyExists)),
            Control::Modify | Control::Delete if !known => {
                Err(io::Error::from(io::ErrorKind::NotFound))
            }
            Control::Add | Control::Modify => {
                state.registered.insert(fd, interest);
                Ok(())
            }
            Control::Delete => {
                state.registered.remove(&fd);
                Ok(())
            }
        }
    }

    fn wait(
        &mut self,
        events: &mut Vec<ReadyEvent>,
        max: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.waits.push(timeout);
        if state.fail_waits > 0 {
            state.fail_waits -= 1;
            return Err(io::Error::from(nix::errno::Errno::ENOMEM));
        }

        match state.script.pop_front() {
            Some(batch) => {
                let n = batch.len().min(max);
                events.extend(batch.into_iter().take(n));
                Ok(n)
            }
            None => {
                if let (Some(clock), Some(timeout)) = (&state.clock, timeout) {
                    clock.advance(timeout.as_millis() as u64);
                }
                Ok(0)
            }
        }
    }
}

#[derive(Default)]
struct SocketState {
    accepts: VecDeque<(RawFd, SocketAddr)>,
    inbound: HashMap<RawFd, VecDeque<u8>>,
    written: HashMap<RawFd, Vec<u8>>,
    closed: Vec<RawFd>,
    options: Vec<(RawFd, SocketOptions)>,
    write_limit: Option<usize>,
    fail_nonblocking: HashSet<RawFd>,
    fail_read: HashSet<RawFd>,
}

/// In-memory socket layer.
#[derive(Clone, Default)]
pub struct MockSockets {
    state: Rc<RefCell<SocketState>>,
}

impl MockSockets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a connection for the next `accept`.
    pub fn queue_accept(&self, fd: RawFd, peer: SocketAddr) {
        self.state.borrow_mut().accepts.push_back((fd, peer));
    }

    /// Makes `bytes` readable on `fd`.
    pub fn feed(&self, fd: RawFd, bytes: &[u8]) {
        self.state
            .borrow_mut()
            .inbound
            .entry(fd)
            .or_default()
            .extend(bytes.iter().copied());
    }

    /// Caps every write at `limit` bytes.
    pub fn limit_writes(&self, limit: usize) {
        self.state.borrow_mut().write_limit = Some(limit);
    }

    pub fn fail_nonblocking(&self, fd: RawFd) {
        self.state.borrow_mut().fail_nonblocking.insert(fd);
    }

    pub fn fail_read(&self, fd: RawFd) {
        self.state.borrow_mut().fail_read.insert(fd);
    }

    /// Everything written to `fd` so far.
    pub fn written(&self, fd: RawFd) -> Vec<u8> {
        self.state
            .borrow()
            .written
            .get(&fd)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_closed(&self, fd: RawFd) -> bool {
        self.state.borrow().closed.contains(&fd)
    }

    /// Descriptors closed so far, in order.
    pub fn closed(&self) -> Vec<RawFd> {
        self.state.borrow().closed.clone()
    }

    /// Options applied per descriptor, in order.
    pub fn applied_options(&self) -> Vec<(RawFd, SocketOptions)> {
        self.state.borrow().options.clone()
    }
}

impl SocketIo for MockSockets {
    fn accept(&self, _listener: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
        Ok(self.state.borrow_mut().accepts.pop_front())
    }

    fn set_nonblocking(&self, fd: RawFd) -> io::Result<()> {
        if self.state.borrow().fail_nonblocking.contains(&fd) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        Ok(())
    }

    fn apply_options(&self, fd: RawFd, options: &SocketOptions) -> io::Result<()> {
        self.state.borrow_mut().options.push((fd, *options));
        Ok(())
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.fail_read.contains(&fd) {
            return Err(io::Error::from(io::ErrorKind::ConnectionReset));
        }
        let Some(queue) = state.inbound.get_mut(&fd) else {
            return Ok(0);
        };
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        let n = state.write_limit.map_or(buf.len(), |limit| buf.len().min(limit));
        state.written.entry(fd).or_default().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn close(&self, fd: RawFd) {
        let mut state = self.state.borrow_mut();
        state.closed.push(fd);
        state.inbound.remove(&fd);
    }
}

/// A reactor over a [`MockPoller`] and [`MockClock`] starting at time 0.
///
/// The poller advances the clock on empty waits.
pub fn mock_reactor<P>(
    config: ReactorConfig,
    init: impl FnMut(RawFd) -> P,
) -> Result<(Reactor<P>, MockPoller, MockClock)> {
    let clock = MockClock::new(0);
    let poller = MockPoller::with_clock(clock.clone());
    let reactor = Reactor::new(
        config,
        Box::new(poller.clone()),
        Rc::new(clock.clone()),
        init,
    )?;
    Ok((reactor, poller, clock))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poller_tracks_registrations() {
        let mut poller = MockPoller::new();
        poller.control(Control::Add, 3, Interest::READABLE).unwrap();
        assert!(poller.control(Control::Add, 3, Interest::READABLE).is_err());
        poller.control(Control::Modify, 3, Interest::WRITABLE).unwrap();
        assert_eq!(poller.registered(3), Some(Interest::WRITABLE));
        poller.control(Control::Delete, 3, Interest::empty()).unwrap();
        assert_eq!(poller.registered(3), None);
        assert!(poller.control(Control::Modify, 3, Interest::READABLE).is_err());
    }

    #[test]
    fn empty_wait_advances_attached_clock() {
        let clock = MockClock::new(10);
        let mut poller = MockPoller::with_clock(clock.clone());
        let mut events = Vec::new();
        poller
            .wait(&mut events, 8, Some(Duration::from_millis(40)))
            .unwrap();
        assert_eq!(clock.now_ms(), 50);
    }

    #[test]
    fn sockets_honor_write_limit() {
        let io = MockSockets::new();
        io.limit_writes(3);
        assert_eq!(io.write(5, b"hello").unwrap(), 3);
        assert_eq!(io.written(5), b"hel");
    }
}
