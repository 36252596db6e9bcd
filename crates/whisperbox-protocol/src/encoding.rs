//! Canonical byte ↔ hex encoding used for keys, ciphertext and random ids:
//! lowercase, two digits per byte, no separators, no `0x` prefix.

use crate::error::ProtocolError;

pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decode canonical hex. Uppercase digits and prefixes are rejected so that
/// decode(encode(b)) == b and encode(decode(s)) == s both hold.
pub fn from_hex(s: &str) -> Result<Vec<u8>, ProtocolError> {
    if s.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(ProtocolError::InvalidHex("uppercase digits are not canonical".into()));
    }
    hex::decode(s).map_err(|e| ProtocolError::InvalidHex(e.to_string()))
}

pub fn from_hex_array<const N: usize>(s: &str) -> Result<[u8; N], ProtocolError> {
    let bytes = from_hex(s)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidHex(format!("expected {N} bytes, got {len}")))
}

/// True if `s` is the canonical encoding of exactly `byte_len` bytes.
pub fn is_canonical_hex(s: &str, byte_len: usize) -> bool {
    s.len() == byte_len * 2 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
