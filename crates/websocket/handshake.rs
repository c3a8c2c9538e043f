//! Opening handshake (RFC 6455 section 4.2)

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use bridge_utils::crypto::accept_key;
use bridge_utils::parsing::{HeadError, has_token, http_version_at_least_1_1, parse_request_head};

/// Upper bound on a buffered request head.
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;

pub const DEFAULT_AUTH_HEADER: &str = "x-bridge-authorization";
pub const MIN_TOKEN_LEN: usize = 10;
pub const MAX_TOKEN_LEN: usize = 500;

const WS_VERSION: &str = "13";
const WS_KEY_LEN: usize = 24;

const BAD_VERSION: HandshakeError = HandshakeError::new(400, "Unsupported Sec-WebSocket-Version");

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Expected token; `None` disables the authorization check.
    pub auth_token: Option<String>,
    pub auth_header: String,
    /// Supported subprotocols in preference order.
    pub subprotocols: Vec<String>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig {
            auth_token: None,
            auth_header: DEFAULT_AUTH_HEADER.to_string(),
            subprotocols: Vec::new(),
        }
    }
}

impl HandshakeConfig {
    pub fn with_token(token: &str) -> Self {
        HandshakeConfig {
            auth_token: Some(token.to_string()),
            ..Default::default()
        }
    }
}

/// A rejected upgrade: HTTP status plus the plain-text body sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeError {
    pub status: u16,
    pub message: &'static str,
}

impl HandshakeError {
    const fn new(status: u16, message: &'static str) -> Self {
        HandshakeError { status, message }
    }

    pub fn too_large() -> Self {
        HandshakeError::new(431, "Request header too large")
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status, reason_phrase(self.status), self.message)
    }
}

/// Headers of an accepted upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub path: String,
    pub key: String,
    /// Negotiated subprotocol, if any.
    pub subprotocol: Option<String>,
    /// All headers, names lower-cased, in request order.
    pub headers: Vec<(String, String)>,
}

impl HandshakeRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Bytes to write back: a 101 on success, an HTTP error otherwise.
    pub response: Vec<u8>,
    pub result: Result<HandshakeRequest, HandshakeError>,
}

impl HandshakeOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        _ => "Error",
    }
}

/// Validate one complete request head (terminator included or not) and
/// build the matching response.
pub fn process_handshake(request: &[u8], config: &HandshakeConfig) -> HandshakeOutcome {
    match validate(request, config) {
        Ok(req) => {
            let response = switching_protocols_response(&req.key, req.subprotocol.as_deref());
            HandshakeOutcome {
                response,
                result: Ok(req),
            }
        }
        Err(err) => HandshakeOutcome {
            response: http_error_response(&err),
            result: Err(err),
        },
    }
}

fn validate(request: &[u8], config: &HandshakeConfig) -> Result<HandshakeRequest, HandshakeError> {
    if request.len() > MAX_REQUEST_HEAD {
        return Err(HandshakeError::too_large());
    }

    let head = parse_request_head(request).map_err(|e| match e {
        HeadError::BadHeaderLine => HandshakeError::new(400, "Malformed header line"),
        _ => HandshakeError::new(404, "Invalid request line"),
    })?;
    if head.method != "GET" {
        return Err(HandshakeError::new(404, "Method must be GET"));
    }
    if !http_version_at_least_1_1(head.version) {
        return Err(HandshakeError::new(404, "HTTP/1.1 or later required"));
    }

    if !head
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    {
        return Err(HandshakeError::new(400, "Missing or invalid Upgrade header"));
    }
    if !head.header("connection").is_some_and(|v| has_token(v, "upgrade")) {
        return Err(HandshakeError::new(400, "Missing or invalid Connection header"));
    }
    let key = head
        .header("sec-websocket-key")
        .filter(|k| k.len() == WS_KEY_LEN)
        .ok_or(HandshakeError::new(400, "Missing or invalid Sec-WebSocket-Key"))?;
    if head.header("sec-websocket-version") != Some(WS_VERSION) {
        return Err(BAD_VERSION);
    }

    if let Some(expected) = config.auth_token.as_deref() {
        let presented = head
            .header(&config.auth_header)
            .ok_or(HandshakeError::new(401, "Missing authorization"))?;
        if !(MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&presented.len()) {
            return Err(HandshakeError::new(400, "Invalid authorization token length"));
        }
        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            return Err(HandshakeError::new(401, "Invalid authorization token"));
        }
    }

    let subprotocol = head
        .header("sec-websocket-protocol")
        .and_then(|offered| negotiate_subprotocol(offered, &config.subprotocols));

    Ok(HandshakeRequest {
        path: head.path.to_string(),
        key: key.to_string(),
        subprotocol,
        headers: head
            .headers
            .iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v.to_string()))
            .collect(),
    })
}

fn negotiate_subprotocol(offered: &str, supported: &[String]) -> Option<String> {
    offered
        .split(',')
        .map(str::trim)
        .find(|p| supported.iter().any(|s| s == p))
        .map(ToString::to_string)
}

/// Compares without short-circuiting on the first differing byte. The
/// length check still returns early.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn switching_protocols_response(client_key: &str, subprotocol: Option<&str>) -> Vec<u8> {
    let mut resp = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accept_key(client_key)
    );
    if let Some(proto) = subprotocol {
        resp.push_str("Sec-WebSocket-Protocol: ");
        resp.push_str(proto);
        resp.push_str("\r\n");
    }
    resp.push_str("\r\n");
    resp.into_bytes()
}

pub fn http_error_response(err: &HandshakeError) -> Vec<u8> {
    let mut resp = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n",
        err.status,
        reason_phrase(err.status),
        err.message.len()
    );
    if *err == BAD_VERSION {
        resp.push_str("Sec-WebSocket-Version: ");
        resp.push_str(WS_VERSION);
        resp.push_str("\r\n");
    }
    resp.push_str("\r\n");
    resp.push_str(err.message);
    resp.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request(extra: &str) -> String {
        format!(
            "GET /chat HTTP/1.1\r\n\
             Host: 127.0.0.1:9001\r\n\
             Upgrade: websocket\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             {}\r\n",
            RFC_KEY, extra
        )
    }

    fn status_of(raw: &str, config: &HandshakeConfig) -> u16 {
        process_handshake(raw.as_bytes(), config).result.unwrap_err().status
    }

    fn response_text(outcome: &HandshakeOutcome) -> &str {
        core::str::from_utf8(&outcome.response).unwrap()
    }

    #[test]
    fn accepts_rfc_example() {
        let outcome = process_handshake(request("").as_bytes(), &HandshakeConfig::default());
        assert!(outcome.is_success());
        let text = response_text(&outcome);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(!text.contains("Sec-WebSocket-Protocol"));
        assert!(text.ends_with("\r\n\r\n"));

        let req = outcome.result.unwrap();
        assert_eq!(req.path, "/chat");
        assert_eq!(req.key, RFC_KEY);
        assert_eq!(req.header("HOST"), Some("127.0.0.1:9001"));
    }

    #[test]
    fn request_line_failures_are_404() {
        let cfg = HandshakeConfig::default();
        let post = request("").replacen("GET", "POST", 1);
        assert_eq!(status_of(&post, &cfg), 404);
        let old = request("").replacen("HTTP/1.1", "HTTP/1.0", 1);
        assert_eq!(status_of(&old, &cfg), 404);
        assert_eq!(status_of("garbage\r\n\r\n", &cfg), 404);
        assert!(process_handshake(request("").replacen("HTTP/1.1", "HTTP/2.0", 1).as_bytes(), &cfg).is_success());
    }

    #[test]
    fn header_failures_are_400() {
        let cfg = HandshakeConfig::default();
        let cases = [
            request("").replace("Upgrade: websocket\r\n", ""),
            request("").replace("Upgrade: websocket", "Upgrade: h2c"),
            request("").replace("keep-alive, Upgrade", "keep-alive"),
            request("").replace(RFC_KEY, "short"),
            request("").replace(&format!("Sec-WebSocket-Key: {}\r\n", RFC_KEY), ""),
        ];
        for raw in &cases {
            assert_eq!(status_of(raw, &cfg), 400, "{}", raw);
        }
    }

    #[test]
    fn bad_version_advertises_13() {
        let raw = request("").replace("Version: 13", "Version: 8");
        let outcome = process_handshake(raw.as_bytes(), &HandshakeConfig::default());
        assert_eq!(outcome.result.as_ref().unwrap_err().status, 400);
        let text = response_text(&outcome);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
    }

    #[test]
    fn header_matching_is_case_insensitive() {
        let raw = request("")
            .replace("Upgrade: websocket", "UPGRADE: WebSocket")
            .replace("Connection:", "connection:")
            .replace("Sec-WebSocket-Key", "sec-websocket-key");
        assert!(process_handshake(raw.as_bytes(), &HandshakeConfig::default()).is_success());
    }

    #[test]
    fn authorization_checks() {
        let cfg = HandshakeConfig::with_token("secret-token-123");
        assert_eq!(status_of(&request(""), &cfg), 401);
        assert_eq!(status_of(&request("X-Bridge-Authorization: short\r\n"), &cfg), 400);
        let long = "x".repeat(501);
        assert_eq!(
            status_of(&request(&format!("X-Bridge-Authorization: {}\r\n", long)), &cfg),
            400
        );
        assert_eq!(
            status_of(&request("X-Bridge-Authorization: secret-token-124\r\n"), &cfg),
            401
        );
        let ok = request("X-Bridge-Authorization: secret-token-123\r\n");
        assert!(process_handshake(ok.as_bytes(), &cfg).is_success());
    }

    #[test]
    fn custom_auth_header() {
        let cfg = HandshakeConfig {
            auth_header: "authorization".to_string(),
            ..HandshakeConfig::with_token("0123456789")
        };
        let ok = request("Authorization: 0123456789\r\n");
        assert!(process_handshake(ok.as_bytes(), &cfg).is_success());
    }

    #[test]
    fn negotiates_first_supported_subprotocol() {
        let cfg = HandshakeConfig {
            subprotocols: alloc::vec!["bridge.v2".to_string(), "bridge.v1".to_string()],
            ..Default::default()
        };
        let raw = request("Sec-WebSocket-Protocol: chat, bridge.v1, bridge.v2\r\n");
        let outcome = process_handshake(raw.as_bytes(), &cfg);
        assert!(response_text(&outcome).contains("Sec-WebSocket-Protocol: bridge.v1\r\n"));
        assert_eq!(outcome.result.unwrap().subprotocol.as_deref(), Some("bridge.v1"));

        let none = request("Sec-WebSocket-Protocol: chat\r\n");
        let outcome = process_handshake(none.as_bytes(), &cfg);
        assert!(outcome.is_success());
        assert!(!response_text(&outcome).contains("Sec-WebSocket-Protocol"));
    }

    #[test]
    fn oversized_head_is_431() {
        let filler = format!("X-Filler: {}\r\n", "a".repeat(MAX_REQUEST_HEAD));
        assert_eq!(status_of(&request(&filler), &HandshakeConfig::default()), 431);
    }

    #[test]
    fn error_response_is_complete_http() {
        let err = HandshakeError::new(401, "Missing authorization");
        let text = String::from_utf8(http_error_response(&err)).unwrap();
        assert_eq!(
            text,
            "HTTP/1.1 401 Unauthorized\r\nContent-Type: text/plain\r\nContent-Length: 21\r\nConnection: close\r\n\r\nMissing authorization"
        );
        assert_eq!(err.to_string(), "401 Unauthorized: Missing authorization");
    }

    #[test]
    fn constant_time_compare() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
