//! Frame codec (RFC 6455 section 5)

use alloc::vec::Vec;
use core::fmt;

use bridge_syscall as sys;
use bridge_utils::bytes::{
    apply_mask, bytes_to_uint16, bytes_to_uint64, is_valid_utf8, uint16_to_bytes, uint64_to_bytes,
};

/// Largest payload accepted from a peer.
pub const MAX_PAYLOAD_LEN: u64 = 100 * 1024 * 1024;

/// Control frames carry at most this many payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Close status code. Kept as a raw `u16` so application codes
/// (3000-4999) survive a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const UNSUPPORTED: CloseCode = CloseCode(1003);
    pub const ABNORMAL: CloseCode = CloseCode(1006);
    pub const INTERNAL_ERROR: CloseCode = CloseCode(1011);

    /// Codes a peer is allowed to put in a CLOSE frame. 1005 and 1006 are
    /// local-only markers and never travel on the wire.
    pub fn is_valid_on_wire(self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }

    fn name(self) -> &'static str {
        match self.0 {
            1000 => "normal",
            1001 => "going away",
            1002 => "protocol error",
            1003 => "unsupported data",
            1005 => "no status",
            1006 => "abnormal closure",
            1007 => "invalid payload",
            1008 => "policy violation",
            1009 => "message too big",
            1011 => "internal error",
            3000..=4999 => "application",
            _ => "unknown",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// One decoded frame. `payload` is always unmasked; `mask` records the key
/// the peer used, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload_length: u64,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Status code and reason of a CLOSE frame. An empty payload reads as
    /// a normal closure.
    pub fn close_status(&self) -> Option<(CloseCode, &str)> {
        if self.opcode != Opcode::Close {
            return None;
        }
        match bytes_to_uint16(&self.payload) {
            None => Some((CloseCode::NORMAL, "")),
            Some(code) => {
                let reason = core::str::from_utf8(&self.payload[2..]).unwrap_or("");
                Some((CloseCode(code), reason))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes buffered yet; not a protocol violation.
    Incomplete,
    ReservedBits(u8),
    UnknownOpcode(u8),
    FragmentedControl,
    ControlTooLong,
    LengthMsbSet,
    TooLarge(u64),
    InvalidUtf8,
    TruncatedClose,
    InvalidCloseCode(u16),
}

impl FrameError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FrameError::Incomplete)
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Incomplete => write!(f, "incomplete frame"),
            FrameError::ReservedBits(bits) => write!(f, "reserved bits set: {:#05b}", bits),
            FrameError::UnknownOpcode(op) => write!(f, "unknown opcode {:#x}", op),
            FrameError::FragmentedControl => write!(f, "fragmented control frame"),
            FrameError::ControlTooLong => {
                write!(f, "control frame payload exceeds {} bytes", MAX_CONTROL_PAYLOAD)
            }
            FrameError::LengthMsbSet => write!(f, "64-bit payload length has its high bit set"),
            FrameError::TooLarge(len) => {
                write!(f, "payload of {} bytes exceeds {} byte limit", len, MAX_PAYLOAD_LEN)
            }
            FrameError::InvalidUtf8 => write!(f, "text payload is not valid UTF-8"),
            FrameError::TruncatedClose => write!(f, "close payload of one byte"),
            FrameError::InvalidCloseCode(code) => write!(f, "invalid close code {}", code),
        }
    }
}

/// Decode one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied. Oversized and
/// malformed headers are rejected as soon as the offending field is
/// readable, without waiting for the payload.
pub fn parse(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
    let &[b0, b1, ..] = buf else {
        return Err(FrameError::Incomplete);
    };

    let rsv = (b0 >> 4) & 0x07;
    if rsv != 0 {
        return Err(FrameError::ReservedBits(rsv));
    }
    let raw_opcode = b0 & 0x0F;
    let opcode = Opcode::from_u8(raw_opcode).ok_or(FrameError::UnknownOpcode(raw_opcode))?;
    let fin = b0 & 0x80 != 0;
    let masked = b1 & 0x80 != 0;
    let len7 = b1 & 0x7F;

    if opcode.is_control() {
        if !fin {
            return Err(FrameError::FragmentedControl);
        }
        if len7 as usize > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlTooLong);
        }
    }

    let mut pos = 2;
    let payload_length = match len7 {
        126 => {
            let len = bytes_to_uint16(&buf[2..]).ok_or(FrameError::Incomplete)?;
            pos = 4;
            len as u64
        }
        127 => {
            let len = bytes_to_uint64(&buf[2..]).ok_or(FrameError::Incomplete)?;
            if len >> 63 != 0 {
                return Err(FrameError::LengthMsbSet);
            }
            pos = 10;
            len
        }
        n => n as u64,
    };
    if payload_length > MAX_PAYLOAD_LEN {
        return Err(FrameError::TooLarge(payload_length));
    }

    let mask = if masked {
        let key: [u8; 4] = buf
            .get(pos..pos + 4)
            .and_then(|k| k.try_into().ok())
            .ok_or(FrameError::Incomplete)?;
        pos += 4;
        Some(key)
    } else {
        None
    };

    let end = pos + payload_length as usize;
    let mut payload = buf.get(pos..end).ok_or(FrameError::Incomplete)?.to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    match opcode {
        // a non-final TEXT frame may end mid code point
        Opcode::Text if fin && !is_valid_utf8(&payload) => return Err(FrameError::InvalidUtf8),
        Opcode::Close => validate_close_payload(&payload)?,
        _ => {}
    }

    Ok((
        Frame {
            fin,
            opcode,
            masked,
            payload_length,
            mask,
            payload,
        },
        end,
    ))
}

fn validate_close_payload(payload: &[u8]) -> Result<(), FrameError> {
    match payload {
        [] => Ok(()),
        [_] => Err(FrameError::TruncatedClose),
        [hi, lo, reason @ ..] => {
            let code = u16::from_be_bytes([*hi, *lo]);
            if !CloseCode(code).is_valid_on_wire() {
                return Err(FrameError::InvalidCloseCode(code));
            }
            if !is_valid_utf8(reason) {
                return Err(FrameError::InvalidUtf8);
            }
            Ok(())
        }
    }
}

/// Serialize a frame, choosing the shortest length encoding. With
/// `masked`, a fresh key is drawn from the kernel.
pub fn encode(opcode: Opcode, payload: &[u8], fin: bool, masked: bool) -> Vec<u8> {
    let mask = if masked { Some(random_mask()) } else { None };
    encode_with_mask(opcode, payload, fin, mask)
}

/// Serialize a frame with an explicit masking key.
pub fn encode_with_mask(opcode: Opcode, payload: &[u8], fin: bool, mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(if fin { 0x80 } else { 0 } | opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    let len = payload.len();
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&uint16_to_bytes(len as u16));
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&uint64_to_bytes(len as u64));
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

fn random_mask() -> [u8; 4] {
    let mut key = [0u8; 4];
    if sys::getrandom(&mut key).is_err() {
        key = (sys::monotonic_ms() as u32).to_le_bytes();
    }
    key
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn control_payload(data: &[u8]) -> &[u8] {
    &data[..data.len().min(MAX_CONTROL_PAYLOAD)]
}

pub fn text_frame(text: &str) -> Vec<u8> {
    encode(Opcode::Text, text.as_bytes(), true, false)
}

pub fn binary_frame(data: &[u8]) -> Vec<u8> {
    encode(Opcode::Binary, data, true, false)
}

/// CLOSE frame with `code` and as much of `reason` as fits in a control
/// payload, cut on a character boundary.
pub fn close_frame(code: CloseCode, reason: &str) -> Vec<u8> {
    let reason = truncate_utf8(reason, MAX_CONTROL_PAYLOAD - 2);
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&uint16_to_bytes(code.0));
    payload.extend_from_slice(reason.as_bytes());
    encode(Opcode::Close, &payload, true, false)
}

pub fn ping_frame(data: &[u8]) -> Vec<u8> {
    encode(Opcode::Ping, control_payload(data), true, false)
}

pub fn pong_frame(data: &[u8]) -> Vec<u8> {
    encode(Opcode::Pong, control_payload(data), true, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decodes_rfc_hello_frames() {
        let (frame, used) = parse(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]).unwrap();
        assert_eq!(used, 7);
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(!frame.masked);
        assert_eq!(frame.payload, b"Hello");

        let masked = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let (frame, used) = parse(&masked).unwrap();
        assert_eq!(used, 11);
        assert_eq!(frame.mask, Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn encodes_rfc_hello_frames() {
        assert_eq!(text_frame("Hello"), [0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]);
        let masked = encode_with_mask(Opcode::Text, b"Hello", true, Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(masked, [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }

    #[test]
    fn length_encoding_boundaries() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            for masked in [false, true] {
                let bytes = encode(Opcode::Binary, &payload, true, masked);
                let header = match len {
                    0..=125 => 2,
                    126..=65535 => 4,
                    _ => 10,
                } + if masked { 4 } else { 0 };
                assert_eq!(bytes.len(), header + len, "len={} masked={}", len, masked);

                let (frame, used) = parse(&bytes).unwrap();
                assert_eq!(used, bytes.len());
                assert_eq!(frame.payload_length, len as u64);
                assert_eq!(frame.masked, masked);
                assert_eq!(frame.payload, payload);
            }
        }
    }

    #[test]
    fn every_strict_prefix_is_incomplete() {
        for len in [5usize, 300, 70_000] {
            let bytes = encode(Opcode::Binary, &alloc::vec![7u8; len], true, true);
            for cut in [0, 1, 2, 3, 5, 9, 13, bytes.len() - 1].into_iter().filter(|&c| c < bytes.len()) {
                assert_eq!(parse(&bytes[..cut]).unwrap_err(), FrameError::Incomplete, "cut={}", cut);
            }
        }
    }

    #[test]
    fn reports_consumed_bytes_with_trailing_data() {
        let mut bytes = text_frame("one");
        bytes.extend_from_slice(&text_frame("two"));
        let (first, used) = parse(&bytes).unwrap();
        assert_eq!(first.payload, b"one");
        let (second, rest) = parse(&bytes[used..]).unwrap();
        assert_eq!(second.payload, b"two");
        assert_eq!(used + rest, bytes.len());
    }

    #[test]
    fn rejects_header_violations() {
        assert_eq!(parse(&[0xC1, 0x00]).unwrap_err(), FrameError::ReservedBits(0b100));
        assert_eq!(parse(&[0x91, 0x00]).unwrap_err(), FrameError::ReservedBits(0b001));
        assert_eq!(parse(&[0x83, 0x00]).unwrap_err(), FrameError::UnknownOpcode(0x3));
        assert_eq!(parse(&[0x8B, 0x00]).unwrap_err(), FrameError::UnknownOpcode(0xB));
        assert_eq!(parse(&[0x09, 0x00]).unwrap_err(), FrameError::FragmentedControl);
        assert_eq!(parse(&[0x89, 0x7E]).unwrap_err(), FrameError::ControlTooLong);
        assert_eq!(
            parse(&[0x82, 0x7F, 0x80, 0, 0, 0, 0, 0, 0, 0]).unwrap_err(),
            FrameError::LengthMsbSet
        );
    }

    #[test]
    fn rejects_oversized_payload_before_it_arrives() {
        let too_big = MAX_PAYLOAD_LEN + 1;
        let mut header = alloc::vec![0x82, 0xFF];
        header.extend_from_slice(&too_big.to_be_bytes());
        assert_eq!(parse(&header).unwrap_err(), FrameError::TooLarge(too_big));

        let mut at_limit = alloc::vec![0x82, 0x7F];
        at_limit.extend_from_slice(&MAX_PAYLOAD_LEN.to_be_bytes());
        assert_eq!(parse(&at_limit).unwrap_err(), FrameError::Incomplete);
    }

    #[test]
    fn rejects_invalid_text() {
        let bytes = encode(Opcode::Text, &[0xC3, 0x28], true, true);
        assert_eq!(parse(&bytes).unwrap_err(), FrameError::InvalidUtf8);
        let first_fragment = encode(Opcode::Text, &[0xC3], false, true);
        assert!(parse(&first_fragment).is_ok());
    }

    #[test]
    fn validates_close_payloads() {
        let empty = encode(Opcode::Close, &[], true, true);
        let (frame, _) = parse(&empty).unwrap();
        assert_eq!(frame.close_status(), Some((CloseCode::NORMAL, "")));

        let one = encode(Opcode::Close, &[0x03], true, true);
        assert_eq!(parse(&one).unwrap_err(), FrameError::TruncatedClose);

        for code in [999u16, 1004, 1005, 1006, 1016, 2999, 5000] {
            let bytes = encode(Opcode::Close, &code.to_be_bytes(), true, true);
            assert_eq!(parse(&bytes).unwrap_err(), FrameError::InvalidCloseCode(code));
        }

        let mut bad_reason = 1000u16.to_be_bytes().to_vec();
        bad_reason.push(0xFF);
        let bytes = encode(Opcode::Close, &bad_reason, true, true);
        assert_eq!(parse(&bytes).unwrap_err(), FrameError::InvalidUtf8);

        let mut app = 4000u16.to_be_bytes().to_vec();
        app.extend_from_slice(b"bye");
        let (frame, _) = parse(&encode(Opcode::Close, &app, true, true)).unwrap();
        assert_eq!(frame.close_status(), Some((CloseCode(4000), "bye")));
    }

    #[test]
    fn close_frame_truncates_reason_on_char_boundary() {
        let reason: String = core::iter::repeat('é').take(100).collect();
        let bytes = close_frame(CloseCode::GOING_AWAY, &reason);
        let (frame, _) = parse(&bytes).unwrap();
        assert!(frame.payload.len() <= MAX_CONTROL_PAYLOAD);
        let (code, text) = frame.close_status().unwrap();
        assert_eq!(code, CloseCode::GOING_AWAY);
        assert_eq!(text.len(), 122);
        assert!(text.chars().all(|c| c == 'é'));
    }

    #[test]
    fn control_frames_are_capped() {
        let bytes = ping_frame(&[1u8; 300]);
        let (frame, _) = parse(&bytes).unwrap();
        assert_eq!(frame.opcode, Opcode::Ping);
        assert_eq!(frame.payload.len(), MAX_CONTROL_PAYLOAD);
        let (frame, _) = parse(&pong_frame(b"abc")).unwrap();
        assert_eq!(frame.opcode, Opcode::Pong);
        assert_eq!(frame.payload, b"abc");
    }

    #[test]
    fn close_code_display() {
        assert_eq!(CloseCode::PROTOCOL_ERROR.to_string(), "1002 (protocol error)");
        assert_eq!(CloseCode(4001).to_string(), "4001 (application)");
        // codes only a peer sends still get a name
        assert_eq!(CloseCode(1009).to_string(), "1009 (message too big)");
        assert_eq!(CloseCode(1005).to_string(), "1005 (no status)");
    }

    proptest! {
        #[test]
        fn parse_never_overreads(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            if let Ok((frame, used)) = parse(&data) {
                prop_assert!(used <= data.len());
                prop_assert_eq!(frame.payload.len() as u64, frame.payload_length);
            }
        }

        #[test]
        fn masked_text_decodes_to_original(text in ".{0,300}", key in any::<[u8; 4]>()) {
            let bytes = encode_with_mask(Opcode::Text, text.as_bytes(), true, Some(key));
            let (frame, used) = parse(&bytes).unwrap();
            prop_assert_eq!(used, bytes.len());
            prop_assert_eq!(frame.payload, text.as_bytes());
        }
    }
}
