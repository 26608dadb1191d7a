//! Multi-part payload policy shared by the request and response framings.
//!
//! Payloads above [`MULTI_PART`] bytes travel as an announcing header frame
//! followed by chunks of at most `MULTI_PART` bytes each. The receiver
//! accumulates chunks per session and checks the final length against the
//! announced total.

use std::collections::HashMap;

use crate::WireError;

/// Largest payload carried in a single frame; also the chunk size.
pub const MULTI_PART: usize = 0x8000;

/// Number of chunks a payload of `len` bytes splits into.
pub fn part_count(len: usize) -> usize {
    (len - 1) / MULTI_PART + 1
}

/// Per-session accumulator for in-flight multi-part payloads.
///
/// One instance per peer connection; sessions are unique per sender so a
/// single map suffices.
#[derive(Debug, Default)]
pub struct MultipartBuffer {
    pending: HashMap<u32, Pending>,
}

#[derive(Debug)]
struct Pending {
    expected: u32,
    data: Vec<u8>,
}

impl MultipartBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announcing header: `total` bytes will follow for `session`.
    ///
    /// A second header for the same session discards the first; the source
    /// of a fresh header has necessarily abandoned the old transfer.
    pub fn begin(&mut self, session: u32, total: u32) {
        self.pending.insert(
            session,
            Pending {
                expected: total,
                data: Vec::with_capacity(total as usize),
            },
        );
    }

    /// Append one chunk. On the terminating chunk the reassembled payload is
    /// returned after the advertised-length integrity check.
    pub fn append(
        &mut self,
        session: u32,
        chunk: &[u8],
        last: bool,
    ) -> Result<Option<Vec<u8>>, WireError> {
        let Some(pending) = self.pending.get_mut(&session) else {
            return Err(WireError::UnknownSession(session));
        };

        pending.data.extend_from_slice(chunk);

        if !last {
            return Ok(None);
        }

        let done = self.pending.remove(&session).expect("checked above");
        let got = done.data.len() as u32;
        if got != done.expected {
            return Err(WireError::LengthMismatch {
                expected: done.expected,
                got,
            });
        }

        Ok(Some(done.data))
    }

    /// Drop any in-flight transfer for `session`.
    pub fn abort(&mut self, session: u32) {
        self.pending.remove(&session);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_in_order() {
        let mut buf = MultipartBuffer::new();
        buf.begin(7, 5);

        assert_eq!(buf.append(7, b"he", false), Ok(None));
        assert_eq!(buf.append(7, b"llo", true), Ok(Some(b"hello".to_vec())));
        assert!(buf.is_empty());
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut buf = MultipartBuffer::new();
        buf.begin(1, 10);
        assert_eq!(
            buf.append(1, b"short", true),
            Err(WireError::LengthMismatch {
                expected: 10,
                got: 5
            })
        );
    }

    #[test]
    fn chunk_without_header_rejected() {
        let mut buf = MultipartBuffer::new();
        assert_eq!(buf.append(9, b"x", true), Err(WireError::UnknownSession(9)));
    }

    #[test]
    fn part_counts() {
        assert_eq!(part_count(1), 1);
        assert_eq!(part_count(MULTI_PART), 1);
        assert_eq!(part_count(MULTI_PART + 1), 2);
        assert_eq!(part_count(48000), 2);
    }
}
