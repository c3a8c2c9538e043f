//! RFC 6455 server side: frame codec, opening handshake and the
//! per-connection state machine. Nothing here touches sockets directly;
//! bytes come in through [`Connection::on_data`] and leave through a
//! [`Transport`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod connection;
pub mod frame;
pub mod handshake;

pub use connection::{
    Clock, Connection, ConnectionError, ConnectionId, HandlerError, MessageHandler, MessageKind,
    MonotonicClock, State, Transport, TransportError,
};
pub use frame::{CloseCode, Frame, FrameError, Opcode};
pub use handshake::{HandshakeConfig, HandshakeError, HandshakeOutcome};
