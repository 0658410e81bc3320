//! UTF-16LE helpers for archive file names.
use utf16string::{LE, WStr, WString};

/// Encode a string as UTF-16LE bytes.
pub fn encode_utf16le(data: &str) -> Vec<u8> {
    WString::<LE>::from(data).into_bytes()
}

/// Decode UTF-16LE bytes.
///
/// Unpaired surrogates are replaced with U+FFFD; the second value is `false`
/// when that happened.
pub fn decode_utf16le(data: &[u8]) -> (String, bool) {
    match WStr::<LE>::from_utf16le(data) {
        Ok(s) => (s.to_utf8(), true),
        Err(_) => {
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            (String::from_utf16_lossy(&units), false)
        }
    }
}

#[test]
fn test_utf16le_round_trip() {
    let encoded = encode_utf16le("system/初期化.tjs");
    assert_eq!(encoded.len(), "system/初期化.tjs".encode_utf16().count() * 2);
    assert_eq!(&encoded[..4], &[b's', 0, b'y', 0]);
    assert_eq!(
        decode_utf16le(&encoded),
        ("system/初期化.tjs".to_string(), true)
    );
}

#[test]
fn test_decode_utf16le_lossy() {
    // lone high surrogate
    let (s, exact) = decode_utf16le(&[b'a', 0, 0x00, 0xD8, b'b', 0]);
    assert!(!exact);
    assert_eq!(s, "a\u{FFFD}b");
}
