//! Listener configuration

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use bridge_runtime::{DEFAULT_PING_INTERVAL_MS, DEFAULT_PONG_TIMEOUT_MS};
use bridge_websocket::HandshakeConfig;
use bridge_websocket::handshake::{DEFAULT_AUTH_HEADER, MAX_TOKEN_LEN, MIN_TOKEN_LEN};

use crate::server::ServerError;

pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Range probed when no fixed port is configured.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (10000, 65535);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    /// 0 binds the first free port in `port_range`.
    pub port: u16,
    pub port_range: (u16, u16),
    pub auth_token: Option<String>,
    pub auth_header: String,
    pub subprotocols: Vec<String>,
    /// 0 disables the ping/reap task.
    pub ping_interval_ms: u64,
    /// Also how long a peer may take to finish the opening handshake.
    pub pong_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: 0,
            port_range: DEFAULT_PORT_RANGE,
            auth_token: None,
            auth_header: DEFAULT_AUTH_HEADER.to_string(),
            subprotocols: Vec::new(),
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            pong_timeout_ms: DEFAULT_PONG_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port_range(mut self, min: u16, max: u16) -> Self {
        self.port_range = (min, max);
        self
    }

    pub fn auth_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_string());
        self
    }

    pub fn auth_header(mut self, name: &str) -> Self {
        self.auth_header = name.to_string();
        self
    }

    pub fn subprotocol(mut self, name: &str) -> Self {
        self.subprotocols.push(name.to_string());
        self
    }

    pub fn ping_interval_ms(mut self, ms: u64) -> Self {
        self.ping_interval_ms = ms;
        self
    }

    pub fn pong_timeout_ms(mut self, ms: u64) -> Self {
        self.pong_timeout_ms = ms;
        self
    }

    /// Positional command line: `[ip] [port] [token]`, program name
    /// already stripped. Missing arguments keep their defaults.
    pub fn from_args(args: &[&str]) -> Result<Self, ServerError> {
        let mut config = ServerConfig::default();
        if let Some(ip) = args.first() {
            if bridge_net::parse_ipv4(ip).is_none() {
                return Err(ServerError::InvalidHost(ip.to_string()));
            }
            config.host = ip.to_string();
        }
        if let Some(port) = args.get(1) {
            config.port = port
                .parse()
                .map_err(|_| ServerError::InvalidPort(port.to_string()))?;
        }
        if let Some(token) = args.get(2) {
            if !(MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&token.len()) {
                return Err(ServerError::InvalidToken);
            }
            config.auth_token = Some(token.to_string());
        }
        Ok(config)
    }

    pub(crate) fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            auth_token: self.auth_token.clone(),
            auth_header: self.auth_header.clone(),
            subprotocols: self.subprotocols.clone(),
        }
    }
}
