//! Canonical UUID text encoding, matching the byte layout and the
//! from-the-end parsing order of the original metadata engine.

use crate::error::{DeviceError, DeviceResult};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

/// A 16-byte UUID value, stored in the same byte order it is read out of
/// a blob property (no endianness conversion beyond the textual parse).
pub type Uuid = [u8; 16];

/// Parse a standard 36-character hyphenated UUID string
/// (`xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`) into 16 bytes.
///
/// Pairs are read back-to-front: the last two hex digits of the string
/// become `out[0]`, working towards the front, mirroring the original
/// encoder's traversal order rather than the conventional left-to-right
/// one.
pub fn trans_str2uuid(s: &str) -> DeviceResult<Uuid> {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return Err(DeviceError::Invalid);
    }
    let hex_digit = |b: u8| -> DeviceResult<u8> {
        match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            _ => Err(DeviceError::Invalid),
        }
    };

    // Collect hex digits only, rejecting hyphens in the wrong places.
    let mut hex = Vec::with_capacity(32);
    for (i, &b) in bytes.iter().enumerate() {
        let is_hyphen_pos = matches!(i, 8 | 13 | 18 | 23);
        if is_hyphen_pos {
            if b != b'-' {
                return Err(DeviceError::Invalid);
            }
        } else {
            hex.push(hex_digit(b)?);
        }
    }
    if hex.len() != 32 {
        return Err(DeviceError::Invalid);
    }

    let mut out = [0u8; 16];
    // Walk pairs from the end of the hex stream towards the front.
    for i in 0..16 {
        let pair_start = hex.len() - 2 * (i + 1);
        out[i] = (hex[pair_start] << 4) | hex[pair_start + 1];
    }
    Ok(out)
}

/// Render 16 bytes as a standard 36-character hyphenated UUID string,
/// inverse of [`trans_str2uuid`].
pub fn trans_uuid2str(uuid: &Uuid) -> String {
    let mut hex = [0u8; 32];
    for i in 0..16 {
        let pair_start = hex.len() - 2 * (i + 1);
        let b = uuid[i];
        hex[pair_start] = hex_char(b >> 4);
        hex[pair_start + 1] = hex_char(b & 0xf);
    }
    let mut s = String::with_capacity(36);
    for (i, &c) in hex.iter().enumerate() {
        if matches!(i, 8 | 13 | 18 | 23) {
            s.push('-');
        }
        let _ = write!(s, "{}", c as char);
    }
    s
}

fn hex_char(nibble: u8) -> u8 {
    match nibble {
        0..=9 => b'0' + nibble,
        _ => b'a' + nibble - 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let text = "0123abcd-4567-89ef-0123-456789abcdef";
        let uuid = trans_str2uuid(text).unwrap();
        assert_eq!(trans_uuid2str(&uuid), text);
    }

    #[test]
    fn rejects_bad_length() {
        assert_eq!(trans_str2uuid("too-short").unwrap_err(), DeviceError::Invalid);
    }

    #[test]
    fn rejects_misplaced_hyphens() {
        let bad = "0123abcd45678-9ef0-123-456789abcdef0";
        assert_eq!(trans_str2uuid(bad).unwrap_err(), DeviceError::Invalid);
    }
}
