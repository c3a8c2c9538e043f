//! Per-connection state machine
//!
//! A [`Connection`] owns the inbound byte buffer and walks
//! `Connecting -> Connected -> Closing -> Closed`, never backwards. The
//! socket side is hidden behind [`Transport`]; whoever drives the socket
//! feeds bytes to [`Connection::on_data`] and reports drained writes through
//! [`Connection::on_write_complete`]. Decoded messages go to a
//! [`MessageHandler`].

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bridge_syscall as sys;
use bridge_utils::parsing::find_header_end;
use log::{debug, info, warn};

use crate::frame::{self, CloseCode, Frame, FrameError, Opcode};
use crate::handshake::{self, HandshakeConfig, HandshakeError, HandshakeRequest, MAX_REQUEST_HEAD};

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Returned by a [`MessageHandler`] that could not use a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The peer broke the application protocol; close with 1002.
    Protocol(String),
    /// Message type the handler cannot take; close with 1003.
    Unsupported(String),
    /// Logged and dropped, the connection stays up.
    Ignored(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            HandlerError::Unsupported(msg) => write!(f, "unsupported message: {}", msg),
            HandlerError::Ignored(msg) => write!(f, "ignored: {}", msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    Closed,
    /// Raw errno from the socket layer.
    Io(i32),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Io(errno) => write!(f, "transport I/O error (errno {})", errno),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    Handshake(HandshakeError),
    Protocol(FrameError),
    Fragmented,
    Handler(HandlerError),
    Transport(TransportError),
    NotOpen,
}

impl ConnectionError {
    /// Status sent in the CLOSE frame that ends the connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            ConnectionError::Protocol(_) => CloseCode::PROTOCOL_ERROR,
            ConnectionError::Fragmented => CloseCode::UNSUPPORTED,
            ConnectionError::Handler(HandlerError::Unsupported(_)) => CloseCode::UNSUPPORTED,
            ConnectionError::Handler(_) => CloseCode::PROTOCOL_ERROR,
            ConnectionError::Transport(_) => CloseCode::ABNORMAL,
            ConnectionError::Handshake(_) | ConnectionError::NotOpen => CloseCode::INTERNAL_ERROR,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Handshake(e) => write!(f, "handshake rejected: {}", e),
            ConnectionError::Protocol(e) => write!(f, "protocol violation: {}", e),
            ConnectionError::Fragmented => write!(f, "fragmented messages are not supported"),
            ConnectionError::Handler(e) => write!(f, "handler: {}", e),
            ConnectionError::Transport(e) => write!(f, "{}", e),
            ConnectionError::NotOpen => write!(f, "connection is not open"),
        }
    }
}

/// Byte pipe under a connection.
pub trait Transport {
    fn start_read(&mut self);
    fn stop_read(&mut self);
    /// Queue `data` for sending. Completion is reported separately through
    /// [`Connection::on_write_complete`].
    fn write(&mut self, data: Vec<u8>) -> Result<(), TransportError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

/// Consumer of decoded messages.
pub trait MessageHandler {
    /// A complete TEXT or BINARY message. `Ok(Some(reply))` is sent back as
    /// a TEXT frame.
    fn on_message(
        &mut self,
        id: ConnectionId,
        kind: MessageKind,
        payload: &[u8],
    ) -> Result<Option<String>, HandlerError>;

    /// Called once, when the connection starts closing for any reason.
    fn on_close(&mut self, _id: ConnectionId, _code: CloseCode, _reason: &str) {}

    fn on_error(&mut self, _id: ConnectionId, _error: &ConnectionError) {}
}

pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// `CLOCK_MONOTONIC` in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        sys::monotonic_ms()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterWrite {
    EnterConnected,
    CloseTransport,
}

pub struct Connection<T: Transport, H: MessageHandler> {
    id: ConnectionId,
    state: State,
    buffer: Vec<u8>,
    handshake_complete: bool,
    close_sent: bool,
    close_notified: bool,
    pending: Option<AfterWrite>,
    last_ping_at: u64,
    last_pong_at: u64,
    request: Option<HandshakeRequest>,
    config: Arc<HandshakeConfig>,
    clock: Box<dyn Clock + Send>,
    transport: T,
    handler: H,
}

impl<T: Transport, H: MessageHandler> Connection<T, H> {
    pub fn new(id: ConnectionId, transport: T, handler: H, config: Arc<HandshakeConfig>) -> Self {
        Self::with_clock(id, transport, handler, config, Box::new(MonotonicClock))
    }

    pub fn with_clock(
        id: ConnectionId,
        mut transport: T,
        handler: H,
        config: Arc<HandshakeConfig>,
        clock: Box<dyn Clock + Send>,
    ) -> Self {
        transport.start_read();
        let now = clock.now_ms();
        Connection {
            id,
            state: State::Connecting,
            buffer: Vec::new(),
            handshake_complete: false,
            close_sent: false,
            close_notified: false,
            pending: None,
            last_ping_at: now,
            last_pong_at: now,
            request: None,
            config,
            clock,
            transport,
            handler,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn last_ping_at(&self) -> u64 {
        self.last_ping_at
    }

    pub fn last_pong_at(&self) -> u64 {
        self.last_pong_at
    }

    /// The accepted upgrade request, once the handshake has run.
    pub fn request(&self) -> Option<&HandshakeRequest> {
        self.request.as_ref()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Feed bytes read from the transport.
    pub fn on_data(&mut self, data: &[u8]) {
        if self.state == State::Closed {
            return;
        }
        self.buffer.extend_from_slice(data);
        match self.state {
            State::Connecting => self.process_handshake(),
            _ => self.process_frames(),
        }
    }

    /// Every byte handed to [`Transport::write`] so far has been sent.
    pub fn on_write_complete(&mut self) {
        match self.pending.take() {
            Some(AfterWrite::EnterConnected) => {
                self.advance(State::Connected);
                self.handshake_complete = true;
                let now = self.clock.now_ms();
                self.last_ping_at = now;
                self.last_pong_at = now;
                info!("connection {}: open", self.id);
                // frames pipelined behind the request head
                self.process_frames();
            }
            Some(AfterWrite::CloseTransport) => self.shutdown(),
            None => {}
        }
    }

    /// The peer closed its side of the stream.
    pub fn on_eof(&mut self) {
        if self.state == State::Closed {
            return;
        }
        debug!("connection {}: peer hung up", self.id);
        self.notify_close(CloseCode::ABNORMAL, "");
        self.shutdown();
    }

    pub fn on_transport_error(&mut self, err: TransportError) {
        if self.state == State::Closed {
            return;
        }
        warn!("connection {}: {}", self.id, err);
        self.handler.on_error(self.id, &ConnectionError::Transport(err));
        self.notify_close(CloseCode::ABNORMAL, "");
        self.shutdown();
    }

    pub fn send_text(&mut self, text: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.write_checked(frame::text_frame(text))
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.write_checked(frame::binary_frame(data))
    }

    pub fn send_ping(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.write_checked(frame::ping_frame(data))?;
        self.last_ping_at = self.clock.now_ms();
        Ok(())
    }

    /// Start the closing handshake. Safe to call more than once.
    pub fn close(&mut self, code: CloseCode, reason: &str) {
        match self.state {
            State::Closing | State::Closed => {}
            State::Connecting => {
                self.notify_close(code, reason);
                self.shutdown();
            }
            State::Connected => {
                debug!("connection {}: closing with {}", self.id, code);
                self.close_sent = true;
                self.advance(State::Closing);
                self.notify_close(code, reason);
                if self.write(frame::close_frame(code, reason)) {
                    self.pending = Some(AfterWrite::CloseTransport);
                }
            }
        }
    }

    /// Connected and a PONG arrived within the last `timeout_ms`.
    pub fn is_alive(&self, timeout_ms: u64) -> bool {
        self.state == State::Connected
            && self.clock.now_ms().saturating_sub(self.last_pong_at) < timeout_ms
    }

    fn process_handshake(&mut self) {
        // response in flight: keep pipelined bytes for later
        if self.pending.is_some() {
            return;
        }
        let Some(end) = find_header_end(&self.buffer) else {
            if self.buffer.len() > MAX_REQUEST_HEAD {
                self.reject(HandshakeError::too_large());
            }
            return;
        };

        let head: Vec<u8> = self.buffer.drain(..end).collect();
        let outcome = handshake::process_handshake(&head, &self.config);
        match outcome.result {
            Ok(request) => {
                debug!("connection {}: upgrade accepted for {}", self.id, request.path);
                self.request = Some(request);
                if self.write(outcome.response) {
                    self.pending = Some(AfterWrite::EnterConnected);
                }
            }
            Err(err) => self.reject(err),
        }
    }

    fn reject(&mut self, err: HandshakeError) {
        warn!("connection {}: handshake rejected: {}", self.id, err);
        let response = handshake::http_error_response(&err);
        self.handler.on_error(self.id, &ConnectionError::Handshake(err));
        self.buffer = Vec::new();
        self.transport.stop_read();
        if self.write(response) {
            self.pending = Some(AfterWrite::CloseTransport);
        }
    }

    fn process_frames(&mut self) {
        while matches!(self.state, State::Connected | State::Closing) && !self.buffer.is_empty() {
            match frame::parse(&self.buffer) {
                Ok((frame, used)) => {
                    self.buffer.drain(..used);
                    self.handle_frame(frame);
                }
                Err(FrameError::Incomplete) => break,
                Err(err) => {
                    self.buffer.clear();
                    self.fail(ConnectionError::Protocol(err));
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame.opcode {
            Opcode::Continuation => self.fail(ConnectionError::Fragmented),
            Opcode::Text | Opcode::Binary if !frame.fin => self.fail(ConnectionError::Fragmented),
            Opcode::Text | Opcode::Binary => self.dispatch(frame),
            Opcode::Close => self.on_close_frame(&frame),
            Opcode::Ping => {
                if self.state == State::Connected {
                    self.write(frame::pong_frame(&frame.payload));
                }
            }
            Opcode::Pong => self.last_pong_at = self.clock.now_ms(),
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        // draining after our own CLOSE
        if self.state != State::Connected {
            return;
        }
        let kind = match frame.opcode {
            Opcode::Text => MessageKind::Text,
            _ => MessageKind::Binary,
        };
        match self.handler.on_message(self.id, kind, &frame.payload) {
            Ok(Some(reply)) => {
                if let Err(err) = self.send_text(&reply) {
                    debug!("connection {}: reply dropped: {}", self.id, err);
                }
            }
            Ok(None) => {}
            Err(HandlerError::Ignored(msg)) => {
                warn!("connection {}: message ignored: {}", self.id, msg)
            }
            Err(err) => self.fail(ConnectionError::Handler(err)),
        }
    }

    fn on_close_frame(&mut self, frame: &Frame) {
        let (code, reason) = frame.close_status().unwrap_or((CloseCode::NORMAL, ""));
        debug!("connection {}: peer sent close {}", self.id, code);
        if self.close_sent {
            // answer to our own CLOSE
            if self.pending.is_none() {
                self.shutdown();
            }
            return;
        }
        self.close_sent = true;
        self.advance(State::Closing);
        self.notify_close(code, reason);
        if self.write(frame::close_frame(code, "")) {
            self.pending = Some(AfterWrite::CloseTransport);
        }
    }

    fn fail(&mut self, err: ConnectionError) {
        warn!("connection {}: {}", self.id, err);
        self.handler.on_error(self.id, &err);
        let reason = err.to_string();
        self.close(err.close_code(), &reason);
    }

    fn notify_close(&mut self, code: CloseCode, reason: &str) {
        if self.close_notified {
            return;
        }
        self.close_notified = true;
        self.handler.on_close(self.id, code, reason);
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.state == State::Connected {
            Ok(())
        } else {
            Err(ConnectionError::NotOpen)
        }
    }

    /// Write and report failure to the caller; the connection is already
    /// closed when this returns an error.
    fn write_checked(&mut self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        match self.transport.write(bytes) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.on_transport_error(err);
                Err(ConnectionError::Transport(err))
            }
        }
    }

    fn write(&mut self, bytes: Vec<u8>) -> bool {
        self.write_checked(bytes).is_ok()
    }

    fn shutdown(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.pending = None;
        self.buffer = Vec::new();
        self.transport.stop_read();
        self.transport.close();
        self.advance(State::Closed);
        debug!("connection {}: closed", self.id);
    }

    fn advance(&mut self, next: State) {
        debug_assert!(next >= self.state, "{:?} -> {:?}", self.state, next);
        if next > self.state {
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    const UPGRADE: &[u8] = b"GET /bridge HTTP/1.1\r\n\
Host: 127.0.0.1\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

    struct MockTransport {
        written: Vec<Vec<u8>>,
        open: bool,
        reading: bool,
        fail_writes: bool,
    }

    impl MockTransport {
        fn new() -> Self {
            MockTransport {
                written: Vec::new(),
                open: true,
                reading: false,
                fail_writes: false,
            }
        }

        fn take(&mut self) -> Vec<Vec<u8>> {
            core::mem::take(&mut self.written)
        }
    }

    impl Transport for MockTransport {
        fn start_read(&mut self) {
            self.reading = true;
        }

        fn stop_read(&mut self) {
            self.reading = false;
        }

        fn write(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
            if !self.open {
                return Err(TransportError::Closed);
            }
            if self.fail_writes {
                return Err(TransportError::Io(32));
            }
            self.written.push(data);
            Ok(())
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    /// Answers "ping" with "pong", records everything else.
    #[derive(Default)]
    struct Recorder {
        messages: Vec<(MessageKind, Vec<u8>)>,
        closes: Vec<(CloseCode, String)>,
        errors: Vec<ConnectionError>,
    }

    impl MessageHandler for Recorder {
        fn on_message(
            &mut self,
            _id: ConnectionId,
            kind: MessageKind,
            payload: &[u8],
        ) -> Result<Option<String>, HandlerError> {
            self.messages.push((kind, payload.to_vec()));
            match payload {
                b"ping" => Ok(Some("pong".to_string())),
                b"bad" => Err(HandlerError::Protocol("bad".to_string())),
                b"weird" => Err(HandlerError::Unsupported("weird".to_string())),
                b"skip" => Err(HandlerError::Ignored("skip".to_string())),
                _ => Ok(None),
            }
        }

        fn on_close(&mut self, _id: ConnectionId, code: CloseCode, reason: &str) {
            self.closes.push((code, reason.to_string()));
        }

        fn on_error(&mut self, _id: ConnectionId, error: &ConnectionError) {
            self.errors.push(error.clone());
        }
    }

    #[derive(Clone, Default)]
    struct ManualClock(Arc<AtomicU64>);

    impl ManualClock {
        fn set(&self, ms: u64) {
            self.0.store(ms, Ordering::Relaxed);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    type TestConn = Connection<MockTransport, Recorder>;

    fn connecting(clock: &ManualClock) -> TestConn {
        Connection::with_clock(
            7,
            MockTransport::new(),
            Recorder::default(),
            Arc::new(HandshakeConfig::default()),
            Box::new(clock.clone()),
        )
    }

    fn upgraded(clock: &ManualClock) -> TestConn {
        let mut conn = connecting(clock);
        conn.on_data(UPGRADE);
        conn.on_write_complete();
        assert_eq!(conn.state(), State::Connected);
        conn.transport_mut().take();
        conn
    }

    fn client(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        frame::encode(opcode, payload, true, true)
    }

    fn decode(bytes: &[u8]) -> Frame {
        let (frame, used) = frame::parse(bytes).unwrap();
        assert_eq!(used, bytes.len());
        frame
    }

    #[test]
    fn handshake_across_reads() {
        let clock = ManualClock::default();
        let mut conn = connecting(&clock);
        assert!(conn.transport().reading);

        conn.on_data(&UPGRADE[..20]);
        assert!(conn.transport().written.is_empty());
        conn.on_data(&UPGRADE[20..]);

        let written = conn.transport_mut().take();
        assert_eq!(written.len(), 1);
        let text = core::str::from_utf8(&written[0]).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        // still waiting for the 101 to drain
        assert_eq!(conn.state(), State::Connecting);
        assert!(!conn.is_handshake_complete());

        conn.on_write_complete();
        assert_eq!(conn.state(), State::Connected);
        assert!(conn.is_handshake_complete());
        assert_eq!(conn.request().unwrap().path, "/bridge");
    }

    #[test]
    fn frames_pipelined_behind_the_request_are_processed() {
        let clock = ManualClock::default();
        let mut conn = connecting(&clock);
        let mut bytes = UPGRADE.to_vec();
        bytes.extend_from_slice(&client(Opcode::Text, b"ping"));
        conn.on_data(&bytes);
        assert!(conn.handler().messages.is_empty());

        conn.on_write_complete();
        assert_eq!(conn.handler().messages, [(MessageKind::Text, b"ping".to_vec())]);
        let written = conn.transport_mut().take();
        let reply = decode(written.last().unwrap());
        assert_eq!(reply.opcode, Opcode::Text);
        assert!(!reply.masked);
        assert_eq!(reply.payload, b"pong");
    }

    #[test]
    fn rejected_handshake_closes_after_response() {
        let clock = ManualClock::default();
        let mut conn = connecting(&clock);
        conn.on_data(b"GET /bridge HTTP/1.1\r\nHost: x\r\n\r\n");

        let written = conn.transport_mut().take();
        assert!(written[0].starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert!(!conn.transport().reading);
        assert!(matches!(conn.handler().errors[0], ConnectionError::Handshake(ref e) if e.status == 400));
        assert_eq!(conn.state(), State::Connecting);

        conn.on_write_complete();
        assert_eq!(conn.state(), State::Closed);
        assert!(!conn.transport().is_open());
    }

    #[test]
    fn oversized_request_head_gets_431() {
        let clock = ManualClock::default();
        let mut conn = connecting(&clock);
        conn.on_data(b"GET / HTTP/1.1\r\n");
        conn.on_data(&alloc::vec![b'a'; MAX_REQUEST_HEAD]);
        let written = conn.transport_mut().take();
        assert!(written[0].starts_with(b"HTTP/1.1 431 "));
        conn.on_write_complete();
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let clock = ManualClock::default();
        let mut conn = upgraded(&clock);
        let bytes = client(Opcode::Binary, &[1, 2, 3, 4, 5]);
        for b in &bytes {
            conn.on_data(core::slice::from_ref(b));
        }
        assert_eq!(conn.handler().messages, [(MessageKind::Binary, alloc::vec![1, 2, 3, 4, 5])]);
        assert_eq!(conn.buffered_len(), 0);
    }

    #[test]
    fn several_frames_in_one_read() {
        let clock = ManualClock::default();
        let mut conn = upgraded(&clock);
        let mut bytes = client(Opcode::Text, b"a");
        bytes.extend_from_slice(&client(Opcode::Text, b"b"));
        bytes.extend_from_slice(&client(Opcode::Text, b"c")[..3]);
        conn.on_data(&bytes);
        assert_eq!(conn.handler().messages.len(), 2);
        assert!(conn.buffered_len() > 0);
    }

    #[test]
    fn ping_is_answered_with_same_payload() {
        let clock = ManualClock::default();
        let mut conn = upgraded(&clock);
        conn.on_data(&client(Opcode::Ping, b"hb-1"));
        let written = conn.transport_mut().take();
        let pong = decode(&written[0]);
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"hb-1");
    }

    #[test]
    fn liveness_tracks_pongs() {
        let clock = ManualClock::default();
        clock.set(1_000);
        let mut conn = upgraded(&clock);
        assert!(conn.is_alive(30_000));

        clock.set(5_000);
        conn.send_ping(b"").unwrap();
        assert_eq!(conn.last_ping_at(), 5_000);

        clock.set(31_000);
        assert!(!conn.is_alive(30_000));

        conn.on_data(&client(Opcode::Pong, b""));
        assert_eq!(conn.last_pong_at(), 31_000);
        assert!(conn.is_alive(30_000));

        conn.close(CloseCode::NORMAL, "");
        assert!(!conn.is_alive(30_000));
    }

    #[test]
    fn peer_close_is_echoed() {
        let clock = ManualClock::default();
        let mut conn = upgraded(&clock);
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"done");
        conn.on_data(&client(Opcode::Close, &payload));

        assert_eq!(conn.state(), State::Closing);
        assert_eq!(conn.handler().closes, [(CloseCode::NORMAL, "done".to_string())]);
        let written = conn.transport_mut().take();
        let echo = decode(&written[0]);
        assert_eq!(echo.close_status(), Some((CloseCode::NORMAL, "")));

        conn.on_write_complete();
        assert_eq!(conn.state(), State::Closed);
        assert!(!conn.transport().is_open());
    }

    #[test]
    fn empty_close_reads_as_normal() {
        let clock = ManualClock::default();
        let mut conn = upgraded(&clock);
        conn.on_data(&client(Opcode::Close, b""));
        assert_eq!(conn.handler().closes[0].0, CloseCode::NORMAL);
    }

    #[test]
    fn fragments_are_refused_with_1003() {
        for bytes in [
            client(Opcode::Continuation, b"x"),
            frame::encode(Opcode::Text, b"part", false, true),
        ] {
            let clock = ManualClock::default();
            let mut conn = upgraded(&clock);
            conn.on_data(&bytes);
            assert_eq!(conn.state(), State::Closing);
            assert_eq!(conn.handler().errors, [ConnectionError::Fragmented]);
            let written = conn.transport_mut().take();
            assert_eq!(decode(&written[0]).close_status().unwrap().0, CloseCode::UNSUPPORTED);
            assert!(conn.handler().messages.is_empty());
        }
    }

    #[test]
    fn protocol_violation_closes_with_1002() {
        let clock = ManualClock::default();
        let mut conn = upgraded(&clock);
        let mut bytes = client(Opcode::Text, b"hi");
        bytes[0] |= 0x40;
        conn.on_data(&bytes);
        assert_eq!(conn.handler().errors, [ConnectionError::Protocol(FrameError::ReservedBits(0b100))]);
        let written = conn.transport_mut().take();
        assert_eq!(decode(&written[0]).close_status().unwrap().0, CloseCode::PROTOCOL_ERROR);
    }

    #[test]
    fn invalid_utf8_text_never_reaches_handler() {
        let clock = ManualClock::default();
        let mut conn = upgraded(&clock);
        conn.on_data(&client(Opcode::Text, &[0xFF, 0xFE]));
        assert!(conn.handler().messages.is_empty());
        assert_eq!(conn.state(), State::Closing);
    }

    #[test]
    fn handler_errors_map_to_close_codes() {
        let cases: [(&[u8], CloseCode); 2] = [
            (b"bad", CloseCode::PROTOCOL_ERROR),
            (b"weird", CloseCode::UNSUPPORTED),
        ];
        for (payload, code) in cases {
            let clock = ManualClock::default();
            let mut conn = upgraded(&clock);
            conn.on_data(&client(Opcode::Text, payload));
            let written = conn.transport_mut().take();
            assert_eq!(decode(&written[0]).close_status().unwrap().0, code);
        }

        let clock = ManualClock::default();
        let mut conn = upgraded(&clock);
        conn.on_data(&client(Opcode::Text, b"skip"));
        assert_eq!(conn.state(), State::Connected);
        assert!(conn.transport().written.is_empty());
    }

    #[test]
    fn local_close_is_idempotent() {
        let clock = ManualClock::default();
        let mut conn = upgraded(&clock);
        conn.close(CloseCode::GOING_AWAY, "shutdown");
        conn.close(CloseCode::NORMAL, "again");
        let written = conn.transport_mut().take();
        assert_eq!(written.len(), 1);
        assert_eq!(decode(&written[0]).close_status(), Some((CloseCode::GOING_AWAY, "shutdown")));
        assert_eq!(conn.handler().closes.len(), 1);

        // data after our CLOSE is dropped, the peer's CLOSE is not echoed
        conn.on_data(&client(Opcode::Text, b"late"));
        conn.on_data(&client(Opcode::Close, &1000u16.to_be_bytes()));
        assert!(conn.handler().messages.is_empty());
        assert!(conn.transport().written.is_empty());

        conn.on_write_complete();
        assert_eq!(conn.state(), State::Closed);
        conn.close(CloseCode::NORMAL, "");
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn sending_requires_connected() {
        let clock = ManualClock::default();
        let mut conn = connecting(&clock);
        assert_eq!(conn.send_text("x"), Err(ConnectionError::NotOpen));
        assert_eq!(conn.send_ping(b""), Err(ConnectionError::NotOpen));

        let mut conn = upgraded(&clock);
        conn.send_binary(&[9]).unwrap();
        conn.close(CloseCode::NORMAL, "");
        assert_eq!(conn.send_text("x"), Err(ConnectionError::NotOpen));
    }

    #[test]
    fn eof_reports_abnormal_closure() {
        let clock = ManualClock::default();
        let mut conn = upgraded(&clock);
        conn.on_eof();
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(conn.handler().closes, [(CloseCode::ABNORMAL, String::new())]);
        conn.on_data(&client(Opcode::Text, b"ignored"));
        assert!(conn.handler().messages.is_empty());
    }

    #[test]
    fn write_failure_closes_abnormally() {
        let clock = ManualClock::default();
        let mut conn = upgraded(&clock);
        conn.transport_mut().fail_writes = true;
        assert_eq!(conn.send_text("x"), Err(ConnectionError::Transport(TransportError::Io(32))));
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(conn.handler().closes[0].0, CloseCode::ABNORMAL);
    }

    #[derive(Debug, Clone)]
    enum Event {
        Data(Vec<u8>),
        WriteComplete,
        Close,
        Ping,
        Eof,
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            4 => proptest::collection::vec(any::<u8>(), 0..32).prop_map(Event::Data),
            2 => proptest::sample::select(alloc::vec![
                client(Opcode::Text, b"ping"),
                client(Opcode::Ping, b"x"),
                client(Opcode::Close, b""),
                client(Opcode::Continuation, b""),
            ])
            .prop_map(Event::Data),
            3 => Just(Event::WriteComplete),
            1 => Just(Event::Close),
            1 => Just(Event::Ping),
            1 => Just(Event::Eof),
        ]
    }

    proptest! {
        #[test]
        fn state_never_moves_backwards(events in proptest::collection::vec(event(), 0..40)) {
            let clock = ManualClock::default();
            let mut conn = connecting(&clock);
            conn.on_data(UPGRADE);
            let mut last = conn.state();
            for ev in events {
                match ev {
                    Event::Data(bytes) => conn.on_data(&bytes),
                    Event::WriteComplete => conn.on_write_complete(),
                    Event::Close => conn.close(CloseCode::NORMAL, ""),
                    Event::Ping => { let _ = conn.send_ping(b""); }
                    Event::Eof => conn.on_eof(),
                }
                prop_assert!(conn.state() >= last);
                last = conn.state();
                if last == State::Closed {
                    prop_assert!(!conn.transport().is_open());
                }
            }
        }
    }
}
