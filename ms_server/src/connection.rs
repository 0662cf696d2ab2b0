//! Per-descriptor connection state machine layered on the reactor.
//!
//! ```text
//! ACCEPTING ──► READING ──► PROCESSING ──► WRITE-PENDING ──► WRITING ─┐
//!                  ▲                                                   │
//!                  └───────────────────────────────────────────────────┘
//!        any state ──(error / timeout / end of stream)──► CLOSED
//! ```
//!
//! Every slot of a `Reactor<Connection>` carries a [`Connection`] built once at
//! reactor creation. Its receive and send buffers are the two halves of the
//! slot's arena region, so a reactor serving connections must be created with
//! [`ConnectionManager::payload_size`] bytes per slot.
//!
//! One request is one read: whatever a single readiness event drains is handed
//! to the [`Service`], and the response must be written in one go. A write that
//! comes up short closes the connection.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;

use metrics::{counter, gauge};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::net::{SocketIo, SocketOptions};
use crate::reactor::{FileHandler, Interest, Reactor, TimerHandler, TimerId};

/// Default size of each of a connection's two buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Settings shared by every connection of one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub options: SocketOptions,
    /// Idle time allowed while waiting for a request; 0 disables the timer.
    pub read_timeout_ms: u64,
    /// Time allowed for the socket to become writable; 0 disables the timer.
    pub write_timeout_ms: u64,
}

/// Slot payload describing one client connection.
#[derive(Debug, Default)]
pub struct Connection {
    read_timer: Option<TimerId>,
    write_timer: Option<TimerId>,
    buf_capacity: usize,
    send_len: usize,
    fd: Option<RawFd>,
    peer: Option<SocketAddr>,
    settings: Option<Rc<ConnectionSettings>>,
}

impl Connection {
    fn reset(
        &mut self,
        fd: RawFd,
        peer: SocketAddr,
        buf_capacity: usize,
        settings: Rc<ConnectionSettings>,
    ) {
        *self = Connection {
            read_timer: None,
            write_timer: None,
            buf_capacity,
            send_len: 0,
            fd: Some(fd),
            peer: Some(peer),
            settings: Some(settings),
        };
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Bytes queued for the next write.
    pub fn send_len(&self) -> usize {
        self.send_len
    }

    /// Size of each of the two buffers.
    pub fn buffer_capacity(&self) -> usize {
        self.buf_capacity
    }

    pub fn read_timer(&self) -> Option<TimerId> {
        self.read_timer
    }

    pub fn write_timer(&self) -> Option<TimerId> {
        self.write_timer
    }

    pub fn settings(&self) -> Option<&ConnectionSettings> {
        self.settings.as_deref()
    }
}

/// One request/response turn handed to a [`Service`].
pub struct Exchange<'a> {
    request: &'a [u8],
    response: &'a mut [u8],
    send_len: &'a mut usize,
    peer: Option<SocketAddr>,
    fd: RawFd,
}

impl Exchange<'_> {
    /// Bytes received in this turn.
    pub fn request(&self) -> &[u8] {
        self.request
    }

    /// The whole (zeroed) send buffer, for services that format in place.
    pub fn response_buf(&mut self) -> &mut [u8] {
        &mut *self.response
    }

    /// Declares how many bytes of [`response_buf`](Self::response_buf) to send.
    pub fn set_response_len(&mut self, len: usize) {
        *self.send_len = len;
    }

    /// Copies `bytes` into the send buffer.
    ///
    /// The pending length is always `bytes.len()`, so a response that does not
    /// fit is detected and the connection closed.
    pub fn respond(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.response.len());
        self.response[..n].copy_from_slice(&bytes[..n]);
        *self.send_len = bytes.len();
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

/// Application logic driven by the connection manager.
///
/// Handlers run on the reactor thread and must not block.
pub trait Service {
    /// Processes `received` bytes and queues a response.
    ///
    /// An error closes the connection.
    fn handle(&self, exchange: &mut Exchange<'_>, received: usize) -> Result<()>;

    /// Called before a connection is closed for sitting idle.
    fn on_read_timeout(&self, conn: &Connection) {
        warn!(fd = ?conn.fd(), peer = ?conn.peer(), "read timed out");
    }

    /// Called before a connection is closed for not draining its response.
    fn on_write_timeout(&self, conn: &Connection) {
        warn!(fd = ?conn.fd(), peer = ?conn.peer(), "write timed out");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Read,
    Write,
}

/// Drives accept, read, process, write and timeout for every connection of a
/// worker.
pub struct ConnectionManager {
    listener: RawFd,
    buf_capacity: usize,
    settings: Rc<ConnectionSettings>,
    service: Rc<dyn Service>,
    io: Rc<dyn SocketIo>,
}

impl ConnectionManager {
    pub fn new(
        listener: RawFd,
        buf_capacity: usize,
        settings: ConnectionSettings,
        service: Rc<dyn Service>,
        io: Rc<dyn SocketIo>,
    ) -> Rc<Self> {
        Rc::new(Self {
            listener,
            buf_capacity: buf_capacity.max(2),
            settings: Rc::new(settings),
            service,
            io,
        })
    }

    /// Arena bytes each reactor slot needs: a receive and a send buffer.
    pub fn payload_size(&self) -> usize {
        self.buf_capacity * 2
    }

    pub fn listener(&self) -> RawFd {
        self.listener
    }

    /// Registers the accept handler on the listening descriptor.
    pub fn listen(self: &Rc<Self>, reactor: &mut Reactor<Connection>) -> Result<()> {
        let acceptor = Rc::new(Acceptor {
            manager: self.clone(),
        });
        reactor.register_interest(self.listener, Interest::READABLE, acceptor)
    }

    /// Removes the accept handler; open connections are left alone.
    pub fn unlisten(&self, reactor: &mut Reactor<Connection>) {
        reactor.unregister_interest(self.listener, Interest::READABLE);
    }

    /// Accepts connections until the listener would block.
    pub fn accept_ready(self: &Rc<Self>, reactor: &mut Reactor<Connection>) {
        loop {
            let (fd, peer) = match self.io.accept(self.listener) {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(_) => break,
            };
            debug!(fd, %peer, "new client");

            if reactor.payload(fd).is_none() {
                error!(fd, capacity = reactor.capacity(), "connection table full, rejecting");
                counter!("ms_server_connections_rejected_total").increment(1);
                self.io.close(fd);
                continue;
            }

            if self.io.set_nonblocking(fd).is_err()
                || self.io.apply_options(fd, &self.settings.options).is_err()
            {
                counter!("ms_server_connections_rejected_total").increment(1);
                self.io.close(fd);
                continue;
            }

            if let Some((conn, _)) = reactor.payload_mut(fd) {
                conn.reset(fd, peer, self.buf_capacity, self.settings.clone());
            }
            counter!("ms_server_connections_accepted_total").increment(1);
            gauge!("ms_server_connections_active").increment(1.0);

            if self.arm(reactor, fd, TimerKind::Read).is_err() {
                self.close(reactor, fd);
                continue;
            }

            if reactor
                .register_interest(fd, Interest::READABLE, self.clone())
                .is_err()
            {
                self.close(reactor, fd);
            }
        }
    }

    /// Arms the read or write timer if one is configured.
    fn arm(self: &Rc<Self>, reactor: &mut Reactor<Connection>, fd: RawFd, kind: TimerKind) -> Result<()> {
        let delay = match kind {
            TimerKind::Read => self.settings.read_timeout_ms,
            TimerKind::Write => self.settings.write_timeout_ms,
        };
        if delay == 0 {
            return Ok(());
        }

        let id = reactor.add_timer(delay, self.clone(), fd as usize)?;
        if let Some((conn, _)) = reactor.payload_mut(fd) {
            match kind {
                TimerKind::Read => conn.read_timer = Some(id),
                TimerKind::Write => conn.write_timer = Some(id),
            }
        }
        Ok(())
    }

    /// Reads one request and runs the service over it.
    ///
    /// Returns `false` when the connection has to be closed.
    fn receive(&self, fd: RawFd, conn: &mut Connection, region: &mut [u8]) -> bool {
        let cap = conn.buf_capacity.min(region.len() / 2);
        let (recv, rest) = region.split_at_mut(cap);
        let send = &mut rest[..cap];
        recv.fill(0);
        send.fill(0);
        conn.send_len = 0;

        let limit = cap.saturating_sub(1);
        let received = match self.io.read(fd, &mut recv[..limit]) {
            Ok(0) => {
                debug!(fd, "peer closed the connection");
                return false;
            }
            Ok(n) => n,
            Err(_) => return false,
        };
        if received >= limit {
            error!(fd, received, "receive buffer full, closing connection");
            return false;
        }

        let mut exchange = Exchange {
            request: &recv[..received],
            response: send,
            send_len: &mut conn.send_len,
            peer: conn.peer,
            fd,
        };
        if let Err(e) = self.service.handle(&mut exchange, received) {
            warn!(fd, error = %e, "request handler failed");
            return false;
        }

        if conn.send_len >= limit {
            error!(fd, send_len = conn.send_len, "send buffer full, closing connection");
            return false;
        }
        true
    }

    fn on_read(self: &Rc<Self>, reactor: &mut Reactor<Connection>, fd: RawFd) {
        let (timer, keep) = {
            let Some((conn, region)) = reactor.payload_mut(fd) else {
                return;
            };
            if !conn.is_open() {
                return;
            }
            let timer = conn.read_timer.take();
            (timer, self.receive(fd, conn, region))
        };
        if let Some(timer) = timer {
            reactor.cancel_timer(timer);
        }
        if !keep {
            self.close(reactor, fd);
            return;
        }

        if reactor
            .modify_interest(fd, Interest::WRITABLE, self.clone())
            .is_err()
            || self.arm(reactor, fd, TimerKind::Write).is_err()
        {
            self.close(reactor, fd);
        }
    }

    fn on_write(self: &Rc<Self>, reactor: &mut Reactor<Connection>, fd: RawFd) {
        let (timer, pending, written) = {
            let Some((conn, region)) = reactor.payload_mut(fd) else {
                return;
            };
            if !conn.is_open() {
                return;
            }
            let timer = conn.write_timer.take();
            let cap = conn.buf_capacity.min(region.len() / 2);
            let pending = conn.send_len.min(cap);
            let written = self.io.write(fd, &region[cap..cap + pending]);
            (timer, pending, written)
        };
        if let Some(timer) = timer {
            reactor.cancel_timer(timer);
        }

        match written {
            Ok(n) if n == pending => {}
            Ok(n) => {
                warn!(fd, written = n, pending, "short write, closing connection");
                self.close(reactor, fd);
                return;
            }
            Err(_) => {
                self.close(reactor, fd);
                return;
            }
        }

        if reactor
            .modify_interest(fd, Interest::READABLE, self.clone())
            .is_err()
            || self.arm(reactor, fd, TimerKind::Read).is_err()
        {
            self.close(reactor, fd);
        }
    }

    /// Cancels the connection's timers, drops its registration and closes the
    /// descriptor. Closing a closed connection does nothing.
    pub fn close(&self, reactor: &mut Reactor<Connection>, fd: RawFd) {
        let timers = match reactor.payload_mut(fd) {
            Some((conn, _)) if conn.is_open() => {
                conn.fd = None;
                [conn.read_timer.take(), conn.write_timer.take()]
            }
            _ => return,
        };
        for timer in timers.into_iter().flatten() {
            reactor.cancel_timer(timer);
        }
        reactor.unregister_interest(fd, Interest::both());
        self.io.close(fd);

        gauge!("ms_server_connections_active").decrement(1.0);
        debug!(fd, "connection closed");
    }

    /// Closes every open connection.
    pub fn close_all(&self, reactor: &mut Reactor<Connection>) {
        for fd in 0..reactor.capacity() {
            let fd = fd as RawFd;
            if reactor.payload(fd).is_some_and(Connection::is_open) {
                self.close(reactor, fd);
            }
        }
    }
}

impl FileHandler<Connection> for ConnectionManager {
    fn on_readable(self: Rc<Self>, reactor: &mut Reactor<Connection>, fd: RawFd, _: Interest) {
        self.on_read(reactor, fd);
    }

    fn on_writable(self: Rc<Self>, reactor: &mut Reactor<Connection>, fd: RawFd, _: Interest) {
        self.on_write(reactor, fd);
    }
}

impl TimerHandler<Connection> for ConnectionManager {
    fn on_timeout(self: Rc<Self>, reactor: &mut Reactor<Connection>, timer: TimerId, data: usize) {
        let fd = data as RawFd;
        let kind = match reactor.payload_mut(fd) {
            Some((conn, _)) if conn.read_timer == Some(timer) => {
                conn.read_timer = None;
                TimerKind::Read
            }
            Some((conn, _)) if conn.write_timer == Some(timer) => {
                conn.write_timer = None;
                TimerKind::Write
            }
            _ => return,
        };

        let label = match kind {
            TimerKind::Read => "read",
            TimerKind::Write => "write",
        };
        counter!("ms_server_connection_timeouts_total", "kind" => label).increment(1);

        if let Some(conn) = reactor.payload(fd) {
            match kind {
                TimerKind::Read => self.service.on_read_timeout(conn),
                TimerKind::Write => self.service.on_write_timeout(conn),
            }
        }
        self.close(reactor, fd);
    }
}

/// Accept handler bound to the listening descriptor.
struct Acceptor {
    manager: Rc<ConnectionManager>,
}

impl FileHandler<Connection> for Acceptor {
    fn on_readable(self: Rc<Self>, reactor: &mut Reactor<Connection>, _: RawFd, _: Interest) {
        self.manager.accept_ready(reactor);
    }
}
