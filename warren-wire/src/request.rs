//! Request framing for service-to-service calls across a socket.
//!
//! Every frame starts with a big-endian `u16` length prefix covering the
//! rest of the frame. The first body byte is a tag:
//!
//! | tag    | meaning                                   |
//! |--------|-------------------------------------------|
//! | `0`    | complete request, numeric address         |
//! | `1`    | multi-part header, numeric address        |
//! | `2`    | multi-part chunk, more chunks follow      |
//! | `3`    | final multi-part chunk                    |
//! | `0x80` | complete request, named address           |
//! | `0x81` | multi-part header, named address          |
//!
//! Payloads above 32 KiB are split per [`crate::multipart`]; a payload of
//! exactly 32 KiB still fits one frame.

use crate::{
    multipart::{part_count, MULTI_PART},
    parse::{new_le_u32, new_u8, put_be_u16, put_le_u32, take},
    WireError,
};

const TAG_ADDR: u8 = 0;
const TAG_ADDR_MULTI: u8 = 1;
const TAG_PART: u8 = 2;
const TAG_PART_LAST: u8 = 3;
const TAG_NAME: u8 = 0x80;
const TAG_NAME_MULTI: u8 = 0x81;

/// Destination of a request: a raw service handle or a registered name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Address(u32),
    Name(String),
}

/// One decoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFrame {
    /// A complete request in a single frame.
    Complete {
        target: Target,
        session: u32,
        payload: Vec<u8>,
    },
    /// Announces `total` bytes of payload arriving as chunks.
    MultiHeader {
        target: Target,
        session: u32,
        total: u32,
    },
    /// One chunk of a multi-part payload.
    MultiPart {
        session: u32,
        payload: Vec<u8>,
        last: bool,
    },
}

fn frame_with_capacity(body_len: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + body_len);
    put_be_u16(&mut frame, body_len as u16);
    frame
}

fn push_chunks(frames: &mut Vec<Vec<u8>>, session: u32, payload: &[u8]) {
    let mut rest = payload;
    for _ in 0..part_count(payload.len()) {
        let (chunk, tag) = if rest.len() > MULTI_PART {
            (&rest[..MULTI_PART], TAG_PART)
        } else {
            (rest, TAG_PART_LAST)
        };
        let mut frame = frame_with_capacity(chunk.len() + 5);
        frame.push(tag);
        put_le_u32(&mut frame, session);
        frame.extend_from_slice(chunk);
        frames.push(frame);
        rest = &rest[chunk.len()..];
    }
}

/// Pack a request into one or more length-prefixed frames.
///
/// Sessions must be strictly positive; names must be 1..=255 bytes.
pub fn pack_request(
    target: &Target,
    session: u32,
    payload: &[u8],
) -> Result<Vec<Vec<u8>>, WireError> {
    if session == 0 || session > i32::MAX as u32 {
        return Err(WireError::InvalidSession(session as i64));
    }
    if payload.len() > u32::MAX as usize {
        return Err(WireError::TooLarge(payload.len()));
    }

    let multi = payload.len() > MULTI_PART;
    let mut frames = Vec::with_capacity(if multi { 1 + part_count(payload.len()) } else { 1 });

    match target {
        Target::Address(addr) => {
            if multi {
                let mut frame = frame_with_capacity(13);
                frame.push(TAG_ADDR_MULTI);
                put_le_u32(&mut frame, *addr);
                put_le_u32(&mut frame, session);
                put_le_u32(&mut frame, payload.len() as u32);
                frames.push(frame);
            } else {
                let mut frame = frame_with_capacity(payload.len() + 9);
                frame.push(TAG_ADDR);
                put_le_u32(&mut frame, *addr);
                put_le_u32(&mut frame, session);
                frame.extend_from_slice(payload);
                frames.push(frame);
            }
        }
        Target::Name(name) => {
            if name.is_empty() || name.len() > 255 {
                return Err(WireError::NameLength(name.len()));
            }
            if multi {
                let mut frame = frame_with_capacity(10 + name.len());
                frame.push(TAG_NAME_MULTI);
                frame.push(name.len() as u8);
                frame.extend_from_slice(name.as_bytes());
                put_le_u32(&mut frame, session);
                put_le_u32(&mut frame, payload.len() as u32);
                frames.push(frame);
            } else {
                let mut frame = frame_with_capacity(payload.len() + 6 + name.len());
                frame.push(TAG_NAME);
                frame.push(name.len() as u8);
                frame.extend_from_slice(name.as_bytes());
                put_le_u32(&mut frame, session);
                frame.extend_from_slice(payload);
                frames.push(frame);
            }
        }
    }

    if multi {
        push_chunks(&mut frames, session, payload);
    }

    Ok(frames)
}

fn take_name(i: &[u8]) -> Result<(&[u8], String), WireError> {
    let (i, len) = new_u8(i)?;
    if len == 0 {
        return Err(WireError::NameLength(0));
    }
    let (i, raw) = take(i, len as usize)?;
    Ok((i, String::from_utf8_lossy(raw).into_owned()))
}

/// Decode one request frame body (the length prefix already stripped).
pub fn unpack_request(body: &[u8]) -> Result<RequestFrame, WireError> {
    let (rest, tag) = new_u8(body)?;

    match tag {
        TAG_ADDR => {
            let (rest, addr) = new_le_u32(rest)?;
            let (rest, session) = new_le_u32(rest)?;
            Ok(RequestFrame::Complete {
                target: Target::Address(addr),
                session,
                payload: rest.to_vec(),
            })
        }
        TAG_ADDR_MULTI => {
            if body.len() != 13 {
                return Err(WireError::InvalidSize(body.len()));
            }
            let (rest, addr) = new_le_u32(rest)?;
            let (rest, session) = new_le_u32(rest)?;
            let (_, total) = new_le_u32(rest)?;
            Ok(RequestFrame::MultiHeader {
                target: Target::Address(addr),
                session,
                total,
            })
        }
        TAG_PART | TAG_PART_LAST => {
            let (rest, session) = new_le_u32(rest)?;
            Ok(RequestFrame::MultiPart {
                session,
                payload: rest.to_vec(),
                last: tag == TAG_PART_LAST,
            })
        }
        TAG_NAME => {
            let (rest, name) = take_name(rest)?;
            let (rest, session) = new_le_u32(rest)?;
            Ok(RequestFrame::Complete {
                target: Target::Name(name),
                session,
                payload: rest.to_vec(),
            })
        }
        TAG_NAME_MULTI => {
            let (rest, name) = take_name(rest)?;
            let (rest, session) = new_le_u32(rest)?;
            let (_, total) = new_le_u32(rest)?;
            Ok(RequestFrame::MultiHeader {
                target: Target::Name(name),
                session,
                total,
            })
        }
        other => Err(WireError::InvalidTag(other)),
    }
}
