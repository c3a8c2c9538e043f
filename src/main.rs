//! edit-bridge: WebSocket endpoint automation agents connect to
//!
//! Usage: `edit-bridge [ip] [port] [token]`. Port 0 (the default) takes the
//! first free port from 10000 upwards; the chosen port is printed to stdout.

#![no_std]
#![no_main]

extern crate alloc;

mod allocator;
mod start;

use alloc::string::String;
use bridge_runtime::{LOG_FILE_PATH, Runtime, logger};
use bridge_server::{Dispatcher, Server, ServerConfig};
use bridge_syscall::{self as sys, SockAddrIn};
use bridge_websocket::{CloseCode, ConnectionId, HandlerError, MessageHandler, MessageKind};
use log::{LevelFilter, error, info};

#[global_allocator]
static GLOBAL: allocator::BridgeAllocator = allocator::BridgeAllocator::new();

const USAGE: &[u8] = b"usage: edit-bridge [ip] [port] [token]\n";

#[inline(always)]
fn out(s: &[u8]) {
    let _ = sys::write(1, s);
}

/// Answers keep-alive probes and echoes everything else back to the agent.
struct BridgeHandler;

impl MessageHandler for BridgeHandler {
    fn on_message(
        &mut self,
        id: ConnectionId,
        kind: MessageKind,
        payload: &[u8],
    ) -> Result<Option<String>, HandlerError> {
        if kind == MessageKind::Binary {
            return Err(HandlerError::Unsupported("binary messages".into()));
        }
        let text = core::str::from_utf8(payload)
            .map_err(|_| HandlerError::Protocol("text message is not UTF-8".into()))?;
        if text == "ping" {
            return Ok(Some(String::from("pong")));
        }
        info!("connection {}: {} byte message", id, text.len());
        Ok(Some(String::from(text)))
    }

    fn on_close(&mut self, id: ConnectionId, code: CloseCode, reason: &str) {
        info!("connection {} closed: {} '{}'", id, code, reason);
    }
}

struct Bridge;

impl Dispatcher for Bridge {
    type Handler = BridgeHandler;

    fn on_connection(&mut self, _id: ConnectionId, _peer: &SockAddrIn) -> BridgeHandler {
        BridgeHandler
    }
}

pub(crate) fn main(args: &[&str]) -> i32 {
    let log_fd = logger::open_log_file(LOG_FILE_PATH).unwrap_or(1);
    let _ = logger::init(log_fd, LevelFilter::Info);

    let config = match ServerConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            out(USAGE);
            return 2;
        }
    };

    let mut rt = Runtime::new();
    let server = match Server::listen(&rt.handle(), config, Bridge) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {}", e);
            out(b"edit-bridge: failed to start listener\n");
            return 1;
        }
    };

    out(b"port ");
    sys::write_usize(1, server.local_port() as usize);
    out(b"\n");

    rt.run_until(|| server.is_stopped());
    0
}
