//! Socket operations used by the connection manager.
//!
//! The manager only ever holds raw descriptors (they index reactor slots), so
//! every operation here takes a `RawFd`. [`SystemSockets`] wraps the
//! descriptor in a non-owning `socket2::Socket` for the duration of one call.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::mem::ManuallyDrop;
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tracing::{debug, error, trace};

/// TCP keepalive parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Idle time before the first keepalive segment.
    pub idle: Duration,
    /// Time between keepalive segments.
    pub interval: Duration,
    /// Unanswered keepalive segments before the connection is dropped.
    pub retries: u32,
}

/// Options applied to every accepted connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketOptions {
    pub nodelay: bool,
    pub keepalive: Option<Keepalive>,
}

/// Descriptor-level socket operations.
pub trait SocketIo {
    /// Accepts one pending connection; `Ok(None)` when none is pending.
    fn accept(&self, listener: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>>;

    fn set_nonblocking(&self, fd: RawFd) -> io::Result<()>;

    fn apply_options(&self, fd: RawFd, options: &SocketOptions) -> io::Result<()>;

    /// Reads until the socket would block, reaches end of stream, or `buf` is full.
    ///
    /// Returns the total read; zero means end of stream or nothing available.
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes until `buf` is drained or the socket would block.
    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;

    fn close(&self, fd: RawFd);
}

/// [`SocketIo`] over real descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSockets;

impl SystemSockets {
    fn sock(fd: RawFd) -> ManuallyDrop<Socket> {
        // SAFETY: callers only pass descriptors they own and keep open for the
        // duration of the call; `ManuallyDrop` keeps this view from closing it.
        ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd) })
    }
}

impl SocketIo for SystemSockets {
    fn accept(&self, listener: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
        let sock = Self::sock(listener);
        loop {
            match sock.accept() {
                Ok((client, addr)) => {
                    let peer = addr
                        .as_socket()
                        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
                    return Ok(Some((client.into_raw_fd(), peer)));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => {
                    error!(listener, error = %e, "accept failed");
                    return Err(e);
                }
            }
        }
    }

    fn set_nonblocking(&self, fd: RawFd) -> io::Result<()> {
        Self::sock(fd).set_nonblocking(true).inspect_err(|e| {
            error!(fd, error = %e, "failed to set non-blocking mode");
        })
    }

    fn apply_options(&self, fd: RawFd, options: &SocketOptions) -> io::Result<()> {
        let sock = Self::sock(fd);
        if options.nodelay {
            sock.set_nodelay(true).inspect_err(|e| {
                error!(fd, error = %e, "setsockopt(TCP_NODELAY) failed");
            })?;
        }
        if let Some(ka) = options.keepalive {
            let params = TcpKeepalive::new()
                .with_time(ka.idle)
                .with_interval(ka.interval)
                .with_retries(ka.retries);
            sock.set_tcp_keepalive(&params).inspect_err(|e| {
                error!(fd, error = %e, "setsockopt(SO_KEEPALIVE) failed");
            })?;
        }
        Ok(())
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let sock = Self::sock(fd);
        let mut total = 0;
        while total < buf.len() {
            match (&*sock).read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(fd, error = %e, "read failed");
                    return Err(e);
                }
            }
        }
        trace!(fd, total, "read");
        Ok(total)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        let sock = Self::sock(fd);
        let mut total = 0;
        while total < buf.len() {
            match (&*sock).write(&buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(fd, error = %e, "write failed");
                    return Err(e);
                }
            }
        }
        trace!(fd, total, "wrote");
        Ok(total)
    }

    fn close(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        // SAFETY: the caller owns `fd` and gives it up here.
        drop(unsafe { Socket::from_raw_fd(fd) });
    }
}

/// Creates the shared listening socket: address and port reuse, bind, listen,
/// non-blocking.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into()).inspect_err(|e| {
        error!(%addr, error = %e, "bind failed");
    })?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    debug!(%addr, backlog, "listener bound");
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::os::fd::AsRawFd;
    use std::thread;

    fn accept_one(io: &SystemSockets, listener: &TcpListener) -> (RawFd, SocketAddr) {
        for _ in 0..200 {
            if let Some(pair) = io.accept(listener.as_raw_fd()).unwrap() {
                return pair;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("no connection accepted");
    }

    #[test]
    fn accept_is_none_when_nothing_pending() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert!(SystemSockets.accept(listener.as_raw_fd()).unwrap().is_none());
    }

    #[test]
    fn loopback_read_and_write() {
        let io = SystemSockets;
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let (fd, peer) = accept_one(&io, &listener);
        assert_eq!(peer, client.local_addr().unwrap());
        io.set_nonblocking(fd).unwrap();
        io.apply_options(
            fd,
            &SocketOptions {
                nodelay: true,
                keepalive: Some(Keepalive {
                    idle: Duration::from_secs(60),
                    interval: Duration::from_secs(5),
                    retries: 3,
                }),
            },
        )
        .unwrap();

        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 64];
        let mut n = 0;
        for _ in 0..200 {
            n += io.read(fd, &mut buf[n..]).unwrap();
            if n == 5 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(&buf[..n], b"hello");

        assert_eq!(io.write(fd, b"world").unwrap(), 5);
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"world");

        io.close(fd);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}
