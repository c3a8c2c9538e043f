//! WebSocket listener: accepts TCP connections, runs each through a
//! [`bridge_websocket::Connection`] and keeps them alive with pings.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod config;
mod server;
mod transport;

pub use config::{DEFAULT_HOST, DEFAULT_PORT_RANGE, ServerConfig};
pub use server::{Dispatcher, Server, ServerError, find_available_port};
pub use transport::SocketTransport;
