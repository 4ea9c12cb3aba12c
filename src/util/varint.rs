//! Variable-length integer encoding used by pack attribute values.
//!
//! Seven payload bits per byte, high bit set on every byte but the last.

use crate::error::{MergeError, Result};

/// Append the encoding of `value` to `out`.
pub fn write_u64(out: &mut Vec<u8>, value: u64) {
    let mut val = value;
    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if val == 0 {
            break;
        }
    }
}

/// Decode a u64 value, returning it with the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(MergeError::corrupted("varint overflow"));
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }

    Err(MergeError::corrupted("incomplete varint"))
}
