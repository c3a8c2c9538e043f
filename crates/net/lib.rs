//! Network primitives: listening sockets, port probing and readiness futures

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::vec::Vec;
use bridge_runtime::Handle;
use bridge_syscall::{self as sys, Errno, SockAddrIn};
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    Socket(Errno),
    Bind { port: u16, errno: Errno },
    Listen(Errno),
    /// Every port in the probed range was taken.
    NoFreePort { min: u16, max: u16 },
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Socket(e) => write!(f, "socket() failed: {}", e),
            NetError::Bind { port, errno } => write!(f, "bind to port {} failed: {}", port, errno),
            NetError::Listen(e) => write!(f, "listen() failed: {}", e),
            NetError::NoFreePort { min, max } => {
                write!(f, "no free port in range {}-{}", min, max)
            }
        }
    }
}

/// Parse a dotted-decimal IPv4 address ("127.0.0.1"). `localhost` is
/// accepted as an alias for the loopback address.
pub fn parse_ipv4(s: &str) -> Option<[u8; 4]> {
    if s == "localhost" {
        return Some([127, 0, 0, 1]);
    }
    let mut parts = [0u8; 4];
    let mut count = 0;
    for part in s.split('.') {
        if count == 4 || part.is_empty() || part.len() > 3 {
            return None;
        }
        if !part.bytes().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let v: u16 = part.parse().ok()?;
        if v > 255 {
            return None;
        }
        parts[count] = v as u8;
        count += 1;
    }
    if count != 4 {
        return None;
    }
    Some(parts)
}

/// `a.b.c.d:port` rendering of a socket address.
pub struct DisplayAddr<'a>(pub &'a SockAddrIn);

impl fmt::Display for DisplayAddr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = self.0.ip();
        write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], self.0.port())
    }
}

/// Create a non-blocking socket bound to `ip:port` and listening.
pub fn bind_listener(ip: [u8; 4], port: u16, backlog: i32) -> Result<i32, NetError> {
    let sfd = sys::socket(sys::AF_INET, sys::SOCK_STREAM | sys::SOCK_NONBLOCK | sys::SOCK_CLOEXEC, 0)
        .map_err(NetError::Socket)?;

    // Enable SO_REUSEADDR
    let _ = sys::setsockopt_int(sfd, sys::SOL_SOCKET, sys::SO_REUSEADDR, 1);

    if let Err(errno) = sys::bind(sfd, &SockAddrIn::new(ip, port)) {
        let _ = sys::close(sfd);
        return Err(NetError::Bind { port, errno });
    }
    if let Err(e) = sys::listen(sfd, backlog) {
        let _ = sys::close(sfd);
        return Err(NetError::Listen(e));
    }
    log::debug!("fd={} listening on port {}", sfd, port);
    Ok(sfd)
}

/// Port the kernel actually bound `fd` to (useful after binding port 0).
pub fn local_port(fd: i32) -> Result<u16, Errno> {
    sys::getsockname(fd).map(|sa| sa.port())
}

/// Probe `min..=max` by binding and releasing until one port succeeds.
pub fn find_available_port(ip: [u8; 4], min: u16, max: u16) -> Result<u16, NetError> {
    if min > max {
        return Err(NetError::NoFreePort { min, max });
    }
    for port in min..=max {
        let sfd = sys::socket(sys::AF_INET, sys::SOCK_STREAM | sys::SOCK_CLOEXEC, 0)
            .map_err(NetError::Socket)?;
        let bound = sys::bind(sfd, &SockAddrIn::new(ip, port));
        let _ = sys::close(sfd);
        match bound {
            Ok(()) => return Ok(port),
            Err(errno @ (Errno::EADDRINUSE | Errno::EACCES)) => {
                log::trace!("port {} unavailable: {}", port, errno);
            }
            Err(errno) => return Err(NetError::Bind { port, errno }),
        }
    }
    Err(NetError::NoFreePort { min, max })
}

/// Start a non-blocking connect to `ip:port`; await [`ConnectFuture`] for the
/// result.
pub fn connect_nonblocking(ip: [u8; 4], port: u16) -> Result<i32, Errno> {
    let fd = sys::socket(sys::AF_INET, sys::SOCK_STREAM | sys::SOCK_NONBLOCK | sys::SOCK_CLOEXEC, 0)?;
    match sys::connect(fd, &SockAddrIn::new(ip, port)) {
        Ok(()) => Ok(fd),
        Err(e) if e.is_would_block() => Ok(fd),
        Err(e) => {
            let _ = sys::close(fd);
            Err(e)
        }
    }
}

// Futures
pub struct AcceptFuture {
    handle: Handle,
    fd: i32,
}

impl AcceptFuture {
    pub fn new(handle: &Handle, fd: i32) -> Self {
        Self {
            handle: handle.clone(),
            fd,
        }
    }
}

impl core::future::Future for AcceptFuture {
    /// Accepted fd (already non-blocking) and the peer address.
    type Output = Result<(i32, SockAddrIn), Errno>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut peer = SockAddrIn::zeroed();
        match sys::accept4(self.fd, &mut peer, sys::SOCK_NONBLOCK | sys::SOCK_CLOEXEC) {
            Ok(cfd) => Poll::Ready(Ok((cfd, peer))),
            Err(e) if e.is_would_block() => {
                self.handle
                    .register_fd_waker(self.fd, sys::POLLIN, cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

pub struct ConnectFuture {
    handle: Handle,
    fd: i32,
}

impl ConnectFuture {
    pub fn new(handle: &Handle, fd: i32) -> Self {
        Self {
            handle: handle.clone(),
            fd,
        }
    }
}

impl core::future::Future for ConnectFuture {
    type Output = Result<(), Errno>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A connected socket has a peer; ENOTCONN means still in progress.
        match sys::getpeername(self.fd) {
            Ok(_) => Poll::Ready(Ok(())),
            Err(Errno::ENOTCONN) => {
                let mut probe = [sys::PollFd {
                    fd: self.fd,
                    events: sys::POLLOUT,
                    revents: 0,
                }];
                if let Ok(1) = sys::ppoll(&mut probe, Some(0)) {
                    if probe[0].revents & (sys::POLLERR | sys::POLLHUP) != 0 {
                        return Poll::Ready(Err(Errno::ECONNREFUSED));
                    }
                }
                self.handle
                    .register_fd_waker(self.fd, sys::POLLOUT, cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

pub struct RecvFuture {
    handle: Handle,
    fd: i32,
    cap: usize,
}

impl RecvFuture {
    pub fn new(handle: &Handle, fd: i32, cap: usize) -> Self {
        Self {
            handle: handle.clone(),
            fd,
            cap,
        }
    }
}

impl core::future::Future for RecvFuture {
    /// Bytes read; an empty buffer means the peer closed its side.
    type Output = Result<Vec<u8>, Errno>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut buf = alloc::vec![0u8; self.cap];
        match sys::recv(self.fd, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Poll::Ready(Ok(buf))
            }
            Err(e) if e.is_would_block() => {
                self.handle
                    .register_fd_waker(self.fd, sys::POLLIN, cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

pub struct SendFuture<'a> {
    handle: Handle,
    fd: i32,
    buf: &'a [u8],
}

impl<'a> SendFuture<'a> {
    pub fn new(handle: &Handle, fd: i32, buf: &'a [u8]) -> Self {
        Self {
            handle: handle.clone(),
            fd,
            buf,
        }
    }
}

impl core::future::Future for SendFuture<'_> {
    /// Bytes written by a single send.
    type Output = Result<usize, Errno>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match sys::send(self.fd, self.buf) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(e) if e.is_would_block() => {
                self.handle
                    .register_fd_waker(self.fd, sys::POLLOUT, cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

/// Send the whole buffer, handling partial writes.
pub async fn send_all(handle: &Handle, fd: i32, data: &[u8]) -> Result<(), Errno> {
    let mut off = 0usize;
    while off < data.len() {
        let wrote = SendFuture::new(handle, fd, &data[off..]).await?;
        if wrote == 0 {
            // avoid spinning on a socket that accepts nothing
            return Err(Errno::EPIPE);
        }
        off += wrote;
    }
    Ok(())
}
