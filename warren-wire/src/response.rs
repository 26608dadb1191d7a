//! Response framing: the reply leg of a request/response exchange.
//!
//! Frame body layout after the big-endian `u16` length prefix:
//!
//! ```text
//! u32 session      (little-endian)
//! u8  status       0 error, 1 ok, 2 multi begin, 3 multi chunk, 4 multi end
//! ..  payload      status 0/1/4: message bytes
//!                  status 2:     u32 total size
//!                  status 3:     chunk bytes
//! ```
//!
//! Error payloads are truncated to 32 KiB rather than split.

use crate::{
    multipart::{part_count, MULTI_PART},
    parse::{new_le_u32, new_u8, put_be_u16, put_le_u32},
    WireError,
};

const STATUS_ERROR: u8 = 0;
const STATUS_OK: u8 = 1;
const STATUS_MULTI_BEGIN: u8 = 2;
const STATUS_MULTI_PART: u8 = 3;
const STATUS_MULTI_END: u8 = 4;

/// One decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    /// A complete reply; `ok == false` carries an error message.
    Complete {
        session: u32,
        ok: bool,
        payload: Vec<u8>,
    },
    /// Announces `total` bytes of reply arriving as chunks.
    MultiHeader { session: u32, total: u32 },
    /// One chunk of a multi-part reply.
    MultiPart {
        session: u32,
        payload: Vec<u8>,
        last: bool,
    },
}

fn frame(session: u32, status: u8, body_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 5 + body_len);
    put_be_u16(&mut out, (5 + body_len) as u16);
    put_le_u32(&mut out, session);
    out.push(status);
    out
}

/// Pack a reply into one or more length-prefixed frames.
pub fn pack_response(
    session: u32,
    payload: Result<&[u8], &[u8]>,
) -> Result<Vec<Vec<u8>>, WireError> {
    if session == 0 || session > i32::MAX as u32 {
        return Err(WireError::InvalidSession(session as i64));
    }

    match payload {
        Err(msg) => {
            // truncate the error msg if too long
            let msg = &msg[..msg.len().min(MULTI_PART)];
            let mut out = frame(session, STATUS_ERROR, msg.len());
            out.extend_from_slice(msg);
            Ok(vec![out])
        }
        Ok(msg) if msg.len() <= MULTI_PART => {
            let mut out = frame(session, STATUS_OK, msg.len());
            out.extend_from_slice(msg);
            Ok(vec![out])
        }
        Ok(msg) => {
            if msg.len() > u32::MAX as usize {
                return Err(WireError::TooLarge(msg.len()));
            }
            let mut frames = Vec::with_capacity(1 + part_count(msg.len()));
            let mut head = frame(session, STATUS_MULTI_BEGIN, 4);
            put_le_u32(&mut head, msg.len() as u32);
            frames.push(head);

            let mut rest = msg;
            while !rest.is_empty() {
                let (chunk, status) = if rest.len() > MULTI_PART {
                    (&rest[..MULTI_PART], STATUS_MULTI_PART)
                } else {
                    (rest, STATUS_MULTI_END)
                };
                let mut out = frame(session, status, chunk.len());
                out.extend_from_slice(chunk);
                frames.push(out);
                rest = &rest[chunk.len()..];
            }
            Ok(frames)
        }
    }
}

/// Decode one response frame body (the length prefix already stripped).
pub fn unpack_response(body: &[u8]) -> Result<ResponseFrame, WireError> {
    let (rest, session) = new_le_u32(body)?;
    let (rest, status) = new_u8(rest)?;

    match status {
        STATUS_ERROR | STATUS_OK => Ok(ResponseFrame::Complete {
            session,
            ok: status == STATUS_OK,
            payload: rest.to_vec(),
        }),
        STATUS_MULTI_BEGIN => {
            let (_, total) = new_le_u32(rest)?;
            Ok(ResponseFrame::MultiHeader { session, total })
        }
        STATUS_MULTI_PART | STATUS_MULTI_END => Ok(ResponseFrame::MultiPart {
            session,
            payload: rest.to_vec(),
            last: status == STATUS_MULTI_END,
        }),
        other => Err(WireError::InvalidTag(other)),
    }
}
