//! Parsing utilities for HTTP request heads

use alloc::vec::Vec;
use core::fmt;

/// Offset just past the first `\r\n\r\n`, if the head is complete.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadError {
    NotUtf8,
    EmptyRequest,
    BadRequestLine,
    BadHeaderLine,
}

impl fmt::Display for HeadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeadError::NotUtf8 => write!(f, "request head is not valid UTF-8"),
            HeadError::EmptyRequest => write!(f, "empty request"),
            HeadError::BadRequestLine => write!(f, "malformed request line"),
            HeadError::BadHeaderLine => write!(f, "malformed header line"),
        }
    }
}

/// Request line and headers borrowed from the raw request bytes.
#[derive(Debug)]
pub struct RequestHead<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub version: &'a str,
    pub headers: Vec<(&'a str, &'a str)>,
}

impl<'a> RequestHead<'a> {
    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }
}

/// Split a request head (everything before the blank line) into its parts.
pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead<'_>, HeadError> {
    let text = core::str::from_utf8(raw).map_err(|_| HeadError::NotUtf8)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().filter(|l| !l.is_empty()).ok_or(HeadError::EmptyRequest)?;
    let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
    let (Some(method), Some(path), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HeadError::BadRequestLine);
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or(HeadError::BadHeaderLine)?;
        if name.is_empty() || name.contains([' ', '\t']) {
            return Err(HeadError::BadHeaderLine);
        }
        headers.push((name, value.trim_matches([' ', '\t'])));
    }

    Ok(RequestHead {
        method,
        path,
        version,
        headers,
    })
}

/// True for `HTTP/1.1` and later (`HTTP/1.2`, `HTTP/2.0`, ...).
pub fn http_version_at_least_1_1(version: &str) -> bool {
    let Some(num) = version.strip_prefix("HTTP/") else {
        return false;
    };
    let (major, minor) = num.split_once('.').unwrap_or((num, "0"));
    match (major.parse::<u32>(), minor.parse::<u32>()) {
        (Ok(major), Ok(minor)) => major > 1 || (major == 1 && minor >= 1),
        _ => false,
    }
}

/// Comma-separated header value contains `token` (case-insensitive).
pub fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}
