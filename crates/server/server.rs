//! Listener, connection registry and per-connection driver tasks

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use core::task::{Context, Poll, Waker};

use bridge_net::{AcceptFuture, DisplayAddr, NetError, send_all};
use bridge_runtime::{Handle, LISTEN_BACKLOG, READ_CHUNK};
use bridge_syscall::{self as sys, Errno, SockAddrIn};
use bridge_websocket::{
    CloseCode, Connection, ConnectionId, HandshakeConfig, MessageHandler, State, Transport,
    TransportError,
};
use log::{debug, info, warn};

use crate::config::ServerConfig;
use crate::transport::SocketTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    InvalidHost(String),
    InvalidPort(String),
    InvalidToken,
    Net(NetError),
}

impl From<NetError> for ServerError {
    fn from(e: NetError) -> Self {
        ServerError::Net(e)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::InvalidHost(h) => write!(f, "invalid listen address '{}'", h),
            ServerError::InvalidPort(p) => write!(f, "invalid port '{}'", p),
            ServerError::InvalidToken => write!(f, "auth token must be 10 to 500 bytes"),
            ServerError::Net(e) => write!(f, "{}", e),
        }
    }
}

/// Hands out a [`MessageHandler`] for every accepted connection.
pub trait Dispatcher: Send + 'static {
    type Handler: MessageHandler + Send + 'static;

    fn on_connection(&mut self, id: ConnectionId, peer: &SockAddrIn) -> Self::Handler;
}

type SharedConn<H> = Arc<Peer<H>>;

/// Work handed to a connection from outside its driver.
enum Command {
    Text(String),
    Close(CloseCode, &'static str),
}

#[derive(Default)]
struct Mailbox {
    commands: Vec<Command>,
    waker: Option<Waker>,
}

/// A registered connection plus the mailbox its driver drains. The
/// connection lock is held while handler callbacks run, so anything that
/// may be called from a handler goes through [`Peer::post`].
struct Peer<H: MessageHandler> {
    conn: spin::Mutex<Connection<SocketTransport, H>>,
    mailbox: spin::Mutex<Mailbox>,
    accepted_at: u64,
}

impl<H: MessageHandler> Peer<H> {
    /// Apply `cmd` now if the connection is free, otherwise leave it for
    /// the driver. Returns false only when a text could not be sent.
    fn post(&self, cmd: Command) -> bool {
        if let Some(mut conn) = self.conn.try_lock() {
            return apply(&mut conn, cmd);
        }
        let mut mailbox = self.mailbox.lock();
        mailbox.commands.push(cmd);
        if let Some(w) = mailbox.waker.take() {
            w.wake();
        }
        true
    }

    fn take_mail(&self) -> Vec<Command> {
        core::mem::take(&mut self.mailbox.lock().commands)
    }

    fn has_mail(&self, waker: &Waker) -> bool {
        let mut mailbox = self.mailbox.lock();
        if !mailbox.commands.is_empty() {
            return true;
        }
        if !mailbox.waker.as_ref().is_some_and(|old| old.will_wake(waker)) {
            mailbox.waker = Some(waker.clone());
        }
        false
    }
}

fn apply<H: MessageHandler>(conn: &mut Connection<SocketTransport, H>, cmd: Command) -> bool {
    match cmd {
        Command::Text(text) => conn.state() == State::Connected && conn.send_text(&text).is_ok(),
        Command::Close(code, reason) => {
            conn.close(code, reason);
            true
        }
    }
}

struct Inner<D: Dispatcher> {
    handle: Handle,
    listen_fd: AtomicI32,
    port: u16,
    stopped: AtomicBool,
    next_id: AtomicU64,
    handshake: Arc<HandshakeConfig>,
    dispatcher: spin::Mutex<D>,
    connections: spin::Mutex<Vec<(ConnectionId, SharedConn<D::Handler>)>>,
}

/// A listening WebSocket endpoint. Cheap to clone; all clones share the
/// same registry.
pub struct Server<D: Dispatcher> {
    inner: Arc<Inner<D>>,
}

impl<D: Dispatcher> Clone for Server<D> {
    fn clone(&self) -> Self {
        Server {
            inner: self.inner.clone(),
        }
    }
}

/// Probe `min..=max` on `host` for a port nobody is bound to.
pub fn find_available_port(host: &str, min: u16, max: u16) -> Result<u16, ServerError> {
    let ip = bridge_net::parse_ipv4(host).ok_or_else(|| ServerError::InvalidHost(host.into()))?;
    Ok(bridge_net::find_available_port(ip, min, max)?)
}

fn bind_in_range(ip: [u8; 4], min: u16, max: u16) -> Result<i32, NetError> {
    if min > max {
        return Err(NetError::NoFreePort { min, max });
    }
    for port in min..=max {
        match bridge_net::bind_listener(ip, port, LISTEN_BACKLOG) {
            Ok(fd) => return Ok(fd),
            Err(NetError::Bind {
                errno: Errno::EADDRINUSE | Errno::EACCES,
                ..
            }) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(NetError::NoFreePort { min, max })
}

impl<D: Dispatcher> Server<D> {
    /// Bind, listen and start accepting on the runtime behind `handle`.
    pub fn listen(handle: &Handle, config: ServerConfig, dispatcher: D) -> Result<Self, ServerError> {
        let ip = bridge_net::parse_ipv4(&config.host)
            .ok_or_else(|| ServerError::InvalidHost(config.host.clone()))?;
        let fd = if config.port == 0 {
            let (min, max) = config.port_range;
            bind_in_range(ip, min, max)?
        } else {
            bridge_net::bind_listener(ip, config.port, LISTEN_BACKLOG)?
        };
        let port = match bridge_net::local_port(fd) {
            Ok(port) => port,
            Err(errno) => {
                let _ = sys::close(fd);
                return Err(NetError::Socket(errno).into());
            }
        };
        info!("listening on {}", DisplayAddr(&SockAddrIn::new(ip, port)));

        let inner = Arc::new(Inner {
            handle: handle.clone(),
            listen_fd: AtomicI32::new(fd),
            port,
            stopped: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            handshake: Arc::new(config.handshake_config()),
            dispatcher: spin::Mutex::new(dispatcher),
            connections: spin::Mutex::new(Vec::new()),
        });

        handle.spawn(accept_loop(inner.clone(), fd));
        if config.ping_interval_ms > 0 {
            handle.spawn(reap_loop(
                inner.clone(),
                config.ping_interval_ms,
                config.pong_timeout_ms,
            ));
        }
        Ok(Server { inner })
    }

    pub fn local_port(&self) -> u16 {
        self.inner.port
    }

    /// Connections accepted and not yet torn down.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Send `text` to every open connection; returns how many took it.
    /// Safe to call from a [`MessageHandler`]: a connection busy in a
    /// callback gets the message queued behind it.
    pub fn broadcast_text(&self, text: &str) -> usize {
        self.inner
            .snapshot()
            .iter()
            .filter(|peer| peer.post(Command::Text(text.to_string())))
            .count()
    }

    /// Close every connection with 1001, then the listening socket. The
    /// closing handshakes finish as the runtime keeps running.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for peer in self.inner.snapshot() {
            peer.post(Command::Close(CloseCode::GOING_AWAY, "server shutting down"));
        }
        let fd = self.inner.listen_fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            let _ = sys::close(fd);
            self.inner.handle.wake_fd(fd);
        }
        info!("server on port {} stopped", self.inner.port);
    }
}

impl<D: Dispatcher> Inner<D> {
    fn snapshot(&self) -> Vec<SharedConn<D::Handler>> {
        self.connections.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    fn register(self: &Arc<Self>, fd: i32, peer: SockAddrIn) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = sys::setsockopt_int(fd, sys::IPPROTO_TCP, sys::TCP_NODELAY, 1);
        let handler = self.dispatcher.lock().on_connection(id, &peer);
        let conn = Arc::new(Peer {
            conn: spin::Mutex::new(Connection::new(
                id,
                SocketTransport::new(fd),
                handler,
                self.handshake.clone(),
            )),
            mailbox: spin::Mutex::new(Mailbox::default()),
            accepted_at: self.handle.now_ms(),
        });
        self.connections.lock().push((id, conn.clone()));
        info!("connection {} from {}", id, DisplayAddr(&peer));
        self.handle.spawn(drive(self.clone(), id, conn, fd));
    }

    fn unregister(&self, id: ConnectionId) {
        self.connections.lock().retain(|(cid, _)| *cid != id);
    }
}

async fn accept_loop<D: Dispatcher>(inner: Arc<Inner<D>>, fd: i32) {
    loop {
        match AcceptFuture::new(&inner.handle, fd).await {
            Ok((cfd, peer)) => {
                if inner.stopped.load(Ordering::Acquire) {
                    let _ = sys::close(cfd);
                    break;
                }
                inner.register(cfd, peer);
            }
            Err(_) if inner.stopped.load(Ordering::Acquire) => break,
            Err(e @ (Errno::EBADF | Errno::EINVAL)) => {
                warn!("listener fd {} unusable: {}", fd, e);
                break;
            }
            Err(e) => warn!("accept failed: {}", e),
        }
    }
    debug!("accept loop on fd {} finished", fd);
}

async fn reap_loop<D: Dispatcher>(inner: Arc<Inner<D>>, interval_ms: u64, timeout_ms: u64) {
    loop {
        inner.handle.sleep(interval_ms).await;
        if inner.stopped.load(Ordering::Acquire) {
            break;
        }
        let now = inner.handle.now_ms();
        for peer in inner.snapshot() {
            let mut conn = peer.conn.lock();
            match conn.state() {
                State::Connecting if now.saturating_sub(peer.accepted_at) >= timeout_ms => {
                    warn!("connection {}: no handshake within {} ms", conn.id(), timeout_ms);
                    conn.close(CloseCode::GOING_AWAY, "handshake timeout");
                }
                State::Connected if conn.is_alive(timeout_ms) => {
                    let _ = conn.send_ping(b"");
                }
                State::Connected => {
                    warn!("connection {}: no pong within {} ms", conn.id(), timeout_ms);
                    conn.close(CloseCode::GOING_AWAY, "pong timeout");
                }
                _ => {}
            }
        }
    }
}

enum Event {
    Data(Vec<u8>),
    Eof,
    Failed(Errno),
    Flush,
    Mail,
    Closed,
}

/// Resolves when the socket has input, the transport has output queued or
/// the mailbox has commands.
struct NextEvent<'a, H: MessageHandler> {
    handle: &'a Handle,
    peer: &'a SharedConn<H>,
    fd: i32,
}

impl<H: MessageHandler> Future for NextEvent<'_, H> {
    type Output = Event;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Event> {
        let mut conn = self.peer.conn.lock();
        let transport = conn.transport_mut();
        if !transport.is_open() {
            return Poll::Ready(Event::Closed);
        }
        if transport.has_pending_writes() {
            return Poll::Ready(Event::Flush);
        }
        if self.peer.has_mail(cx.waker()) {
            return Poll::Ready(Event::Mail);
        }
        transport.set_waker(cx.waker());
        if !transport.is_reading() {
            return Poll::Pending;
        }

        let mut buf = alloc::vec![0u8; READ_CHUNK];
        match sys::recv(self.fd, &mut buf) {
            Ok(0) => Poll::Ready(Event::Eof),
            Ok(n) => {
                buf.truncate(n);
                Poll::Ready(Event::Data(buf))
            }
            Err(e) if e.is_would_block() => {
                self.handle
                    .register_fd_waker(self.fd, sys::POLLIN, cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Event::Failed(e)),
        }
    }
}

/// Send everything queued on the transport, then let the connection run
/// its post-write step (which may queue more).
async fn flush<H: MessageHandler>(handle: &Handle, peer: &SharedConn<H>, fd: i32) {
    loop {
        let out = peer.conn.lock().transport_mut().take_outbox();
        if out.is_empty() {
            return;
        }
        if let Err(e) = send_all(handle, fd, &out).await {
            peer.conn.lock().on_transport_error(TransportError::Io(e.0));
            return;
        }
        let mut conn = peer.conn.lock();
        if !conn.transport().has_pending_writes() {
            conn.on_write_complete();
        }
    }
}

async fn drive<D: Dispatcher>(
    inner: Arc<Inner<D>>,
    id: ConnectionId,
    peer: SharedConn<D::Handler>,
    fd: i32,
) {
    let handle = inner.handle.clone();
    loop {
        flush(&handle, &peer, fd).await;
        let event = NextEvent {
            handle: &handle,
            peer: &peer,
            fd,
        }
        .await;
        match event {
            Event::Data(bytes) => peer.conn.lock().on_data(&bytes),
            Event::Eof => peer.conn.lock().on_eof(),
            Event::Failed(e) => peer.conn.lock().on_transport_error(TransportError::Io(e.0)),
            Event::Flush | Event::Mail => {}
            Event::Closed => break,
        }
        // posted while a callback held the lock, possibly by this connection
        let mail = peer.take_mail();
        if !mail.is_empty() {
            let mut conn = peer.conn.lock();
            for cmd in mail {
                apply(&mut conn, cmd);
            }
        }
    }
    inner.unregister(id);
    handle.wake_fd(fd);
    let _ = sys::close(fd);
    debug!("connection {}: released fd {}", id, fd);
}
