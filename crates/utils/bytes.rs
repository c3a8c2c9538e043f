//! Big-endian integer conversion, frame masking and UTF-8 validation

pub fn uint16_to_bytes(v: u16) -> [u8; 2] {
    v.to_be_bytes()
}

/// Read a big-endian u16 from the front of `b`.
pub fn bytes_to_uint16(b: &[u8]) -> Option<u16> {
    let head: [u8; 2] = b.get(..2)?.try_into().ok()?;
    Some(u16::from_be_bytes(head))
}

pub fn uint64_to_bytes(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

/// Read a big-endian u64 from the front of `b`.
pub fn bytes_to_uint64(b: &[u8]) -> Option<u64> {
    let head: [u8; 8] = b.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(head))
}

/// XOR `data[i]` with `mask[i % 4]` in place. Applying it twice restores
/// the input, so the same call masks and unmasks.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[i & 3];
    }
}

/// Strict UTF-8 check: rejects stray continuation bytes, invalid lead bytes,
/// truncated sequences, overlong forms, surrogates and code points past
/// U+10FFFF.
pub fn is_valid_utf8(bytes: &[u8]) -> bool {
    let mut i = 0;
    while i < bytes.len() {
        let b0 = bytes[i];
        if b0 < 0x80 {
            i += 1;
            continue;
        }
        // (sequence length, allowed range for the second byte)
        let (len, lo, hi) = match b0 {
            0xC2..=0xDF => (2, 0x80, 0xBF),
            0xE0 => (3, 0xA0, 0xBF),
            0xE1..=0xEC | 0xEE..=0xEF => (3, 0x80, 0xBF),
            0xED => (3, 0x80, 0x9F),
            0xF0 => (4, 0x90, 0xBF),
            0xF1..=0xF3 => (4, 0x80, 0xBF),
            0xF4 => (4, 0x80, 0x8F),
            _ => return false,
        };
        if i + len > bytes.len() {
            return false;
        }
        let b1 = bytes[i + 1];
        if b1 < lo || b1 > hi {
            return false;
        }
        for &b in &bytes[i + 2..i + len] {
            if b & 0xC0 != 0x80 {
                return false;
            }
        }
        i += len;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn big_endian_conversions() {
        assert_eq!(uint16_to_bytes(0x1234), [0x12, 0x34]);
        assert_eq!(bytes_to_uint16(&[0x03, 0xE8, 0xFF]), Some(1000));
        assert_eq!(bytes_to_uint16(&[0x03]), None);
        assert_eq!(uint64_to_bytes(65536), [0, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(bytes_to_uint64(&[0, 0, 0, 0, 0, 1, 0, 0]), Some(65536));
        assert_eq!(bytes_to_uint64(&[0; 7]), None);
    }

    #[test]
    fn mask_matches_rfc_example() {
        // RFC 6455 5.7: masked "Hello"
        let mut data = [0x7f, 0x9f, 0x4d, 0x51, 0x58];
        apply_mask(&mut data, [0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(&data, b"Hello");
    }

    #[test]
    fn utf8_accepts_valid_text() {
        assert!(is_valid_utf8(b""));
        assert!(is_valid_utf8(b"plain ascii"));
        assert!(is_valid_utf8("héllo wörld".as_bytes()));
        assert!(is_valid_utf8("日本語".as_bytes()));
        assert!(is_valid_utf8("🦀".as_bytes()));
        assert!(is_valid_utf8(&[0xF4, 0x8F, 0xBF, 0xBF])); // U+10FFFF
    }

    #[test]
    fn utf8_rejects_malformed_sequences() {
        assert!(!is_valid_utf8(&[0x80])); // lone continuation
        assert!(!is_valid_utf8(&[0xC3])); // truncated
        assert!(!is_valid_utf8(&[0xE6, 0x97])); // truncated 3-byte
        assert!(!is_valid_utf8(&[0xC3, 0x28])); // bad continuation
        assert!(!is_valid_utf8(&[0xC0, 0xAF])); // overlong '/'
        assert!(!is_valid_utf8(&[0xE0, 0x80, 0xAF])); // overlong 3-byte
        assert!(!is_valid_utf8(&[0xED, 0xA0, 0x80])); // surrogate
        assert!(!is_valid_utf8(&[0xF4, 0x90, 0x80, 0x80])); // > U+10FFFF
        assert!(!is_valid_utf8(&[0xFF]));
        assert!(!is_valid_utf8(&[0xCE, 0xBA, 0xE1, 0xBD, 0xB9, 0xCF, 0x83, 0xCE, 0xBC, 0xCE, 0xB5, 0xED, 0xA0, 0x80]));
    }

    proptest! {
        #[test]
        fn mask_is_an_involution(data in proptest::collection::vec(any::<u8>(), 0..512), mask in any::<[u8; 4]>()) {
            let mut buf = data.clone();
            apply_mask(&mut buf, mask);
            apply_mask(&mut buf, mask);
            prop_assert_eq!(buf, data);
        }

        #[test]
        fn utf8_agrees_with_core(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(is_valid_utf8(&data), core::str::from_utf8(&data).is_ok());
        }

        #[test]
        fn utf8_accepts_any_string(s in ".*") {
            prop_assert!(is_valid_utf8(s.as_bytes()));
        }
    }
}
