//! Cursor-style parser helpers shared by the framing codecs.
//!
//! Length prefixes on this wire are big-endian; the word-sized fields inside
//! frame bodies (addresses, sessions, totals) are little-endian.

use crate::WireError;

pub fn take(i: &[u8], n: usize) -> Result<(&[u8], &[u8]), WireError> {
    if i.len() < n {
        return Err(WireError::Truncated);
    }

    let (raw, rest) = i.split_at(n);

    Ok((rest, raw))
}

pub fn new_u8(i: &[u8]) -> Result<(&[u8], u8), WireError> {
    let Some((first, rest)) = i.split_first() else {
        return Err(WireError::Truncated);
    };

    Ok((rest, *first))
}

pub fn new_be_u16(i: &[u8]) -> Result<(&[u8], u16), WireError> {
    let (rest, raw) = take(i, 2)?;

    let value = u16::from_be_bytes([raw[0], raw[1]]);

    Ok((rest, value))
}

pub fn new_le_u16(i: &[u8]) -> Result<(&[u8], u16), WireError> {
    let (rest, raw) = take(i, 2)?;

    let value = u16::from_le_bytes([raw[0], raw[1]]);

    Ok((rest, value))
}

pub fn new_le_u32(i: &[u8]) -> Result<(&[u8], u32), WireError> {
    let (rest, raw) = take(i, 4)?;

    let value = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);

    Ok((rest, value))
}

pub fn put_le_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_be_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}
