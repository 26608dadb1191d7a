//! Length-prefixed frame assembly for TCP streams.
//!
//! The common service-to-service framing: a 2-byte big-endian length
//! prefix followed by that many bytes. Socket reads arrive in arbitrary
//! chunks; the [`Assembler`] holds at most one in-progress frame per
//! connection (keyed through a 4096-bucket hash on the socket id) plus a
//! queue of frames completed beyond the first. One chunk yielding exactly
//! one frame reports [`Filtered::Data`]; several report [`Filtered::More`]
//! and are drained with [`Assembler::pop`].

use std::collections::VecDeque;

use crate::socket::{SocketEventKind, SocketMessage};

const HASH_SIZE: usize = 4096;
const QUEUE_SIZE: usize = 1024;

const POOL_CHUNK_MIN: usize = 16;
const POOL_CHUNK_MAX: usize = 4096;

/// One complete frame.
#[derive(Debug, PartialEq, Eq)]
pub struct NetPacket {
    pub id: i32,
    pub buffer: Vec<u8>,
}

/// What one socket message amounted to.
#[derive(Debug, PartialEq, Eq)]
pub enum Filtered {
    /// Exactly one complete frame.
    Data(NetPacket),
    /// Several frames completed; drain them with [`Assembler::pop`].
    More,
    /// Bytes absorbed into an in-progress frame.
    Pending,
    /// A new connection was accepted (id is the accepted socket).
    Open { id: i32, address: String },
    Close { id: i32 },
    Error { id: i32, message: String },
    /// Write queue for `id` has `kbytes` KiB pending.
    Warning { id: i32, kbytes: i32 },
    /// Nothing for the caller (e.g. connect acknowledgements).
    None,
}

/// Recycles frame backing storage for the lifetime of the owning service.
/// Retention grows geometrically (16, 32, ... capped at 4096 buffers) so a
/// busy gate stops paying per-frame allocation without hoarding memory on
/// quiet connections.
#[derive(Debug, Default)]
struct BufferPool {
    free: Vec<Vec<u8>>,
    limit: usize,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            free: Vec::new(),
            limit: POOL_CHUNK_MIN,
        }
    }

    fn take(&mut self, size: usize) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buffer) => {
                buffer.clear();
                buffer.reserve(size);
                buffer
            }
            None => Vec::with_capacity(size),
        }
    }

    fn put(&mut self, mut buffer: Vec<u8>) {
        buffer.clear();
        if self.free.len() == self.limit {
            if self.limit >= POOL_CHUNK_MAX {
                return;
            }
            self.limit *= 2;
        }
        self.free.push(buffer);
    }
}

#[derive(Debug)]
struct Uncomplete {
    id: i32,
    /// Bytes copied so far, or -1 when only the first length byte has
    /// been seen.
    read: i32,
    /// High byte of the length, valid while `read == -1`.
    header: u8,
    buffer: Vec<u8>,
}

fn hash_id(id: i32) -> usize {
    let a = id >> 24;
    let b = id >> 12;
    (a.wrapping_add(b).wrapping_add(id) as u32 as usize) % HASH_SIZE
}

fn read_size(buffer: &[u8]) -> usize {
    (buffer[0] as usize) << 8 | buffer[1] as usize
}

/// Per-gate frame assembler: uncomplete-frame table plus completed queue.
#[derive(Debug)]
pub struct Assembler {
    hash: Vec<Vec<Uncomplete>>,
    queue: VecDeque<NetPacket>,
    pool: BufferPool,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            hash: (0..HASH_SIZE).map(|_| Vec::new()).collect(),
            queue: VecDeque::with_capacity(QUEUE_SIZE),
            pool: BufferPool::new(),
        }
    }

    /// Feed one socket message through the assembler.
    pub fn filter(&mut self, message: SocketMessage) -> Filtered {
        match message.kind {
            SocketEventKind::Data => self.filter_data(message.id, &message.buffer),
            SocketEventKind::Connect => Filtered::None,
            SocketEventKind::Close => {
                self.close_uncomplete(message.id);
                Filtered::Close { id: message.id }
            }
            SocketEventKind::Accept => Filtered::Open {
                // ud carries the accepted connection's id
                id: message.ud,
                address: String::from_utf8_lossy(&message.buffer).into_owned(),
            },
            SocketEventKind::Error => {
                self.close_uncomplete(message.id);
                Filtered::Error {
                    id: message.id,
                    message: String::from_utf8_lossy(&message.buffer).into_owned(),
                }
            }
            SocketEventKind::Warning => Filtered::Warning {
                id: message.id,
                kbytes: message.ud,
            },
            _ => Filtered::None,
        }
    }

    /// Next completed frame after a [`Filtered::More`].
    pub fn pop(&mut self) -> Option<NetPacket> {
        self.queue.pop_front()
    }

    /// Hand a frame's backing storage back for reuse.
    pub fn recycle(&mut self, buffer: Vec<u8>) {
        self.pool.put(buffer);
    }

    /// Drop everything: in-progress frames and the completed queue.
    pub fn clear(&mut self) {
        for bucket in &mut self.hash {
            for uc in bucket.drain(..) {
                self.pool.put(uc.buffer);
            }
        }
        while let Some(packet) = self.queue.pop_front() {
            self.pool.put(packet.buffer);
        }
    }

    fn take_uncomplete(&mut self, id: i32) -> Option<Uncomplete> {
        let bucket = &mut self.hash[hash_id(id)];
        let at = bucket.iter().position(|uc| uc.id == id)?;
        Some(bucket.swap_remove(at))
    }

    fn park(&mut self, uc: Uncomplete) {
        self.hash[hash_id(uc.id)].push(uc);
    }

    fn new_frame(&mut self, size: usize) -> Vec<u8> {
        let mut buffer = self.pool.take(size);
        buffer.resize(size, 0);
        buffer
    }

    fn close_uncomplete(&mut self, id: i32) {
        if let Some(uc) = self.take_uncomplete(id) {
            self.pool.put(uc.buffer);
        }
    }

    fn filter_data(&mut self, id: i32, mut data: &[u8]) -> Filtered {
        if let Some(mut uc) = self.take_uncomplete(id) {
            if uc.read < 0 {
                // second half of the length prefix
                let size = (uc.header as usize) << 8 | data[0] as usize;
                data = &data[1..];
                uc.buffer = self.new_frame(size);
                uc.read = 0;
            }
            let need = uc.buffer.len() - uc.read as usize;
            if data.len() < need {
                let read = uc.read as usize;
                uc.buffer[read..read + data.len()].copy_from_slice(data);
                uc.read += data.len() as i32;
                self.park(uc);
                return Filtered::Pending;
            }
            let read = uc.read as usize;
            uc.buffer[read..].copy_from_slice(&data[..need]);
            data = &data[need..];
            let packet = NetPacket {
                id,
                buffer: uc.buffer,
            };
            if data.is_empty() {
                return Filtered::Data(packet);
            }
            self.queue.push_back(packet);
            self.push_more(id, data);
            Filtered::More
        } else {
            if data.len() == 1 {
                self.park(Uncomplete {
                    id,
                    read: -1,
                    header: data[0],
                    buffer: Vec::new(),
                });
                return Filtered::Pending;
            }
            let size = read_size(data);
            data = &data[2..];

            if data.len() < size {
                let mut buffer = self.new_frame(size);
                buffer[..data.len()].copy_from_slice(data);
                self.park(Uncomplete {
                    id,
                    read: data.len() as i32,
                    header: 0,
                    buffer,
                });
                return Filtered::Pending;
            }
            if data.len() == size {
                let mut buffer = self.pool.take(size);
                buffer.extend_from_slice(data);
                return Filtered::Data(NetPacket { id, buffer });
            }
            // several frames in one read
            let mut buffer = self.pool.take(size);
            buffer.extend_from_slice(&data[..size]);
            self.queue.push_back(NetPacket { id, buffer });
            self.push_more(id, &data[size..]);
            Filtered::More
        }
    }

    fn push_more(&mut self, id: i32, mut data: &[u8]) {
        loop {
            if data.len() == 1 {
                self.park(Uncomplete {
                    id,
                    read: -1,
                    header: data[0],
                    buffer: Vec::new(),
                });
                return;
            }
            let size = read_size(data);
            data = &data[2..];

            if data.len() < size {
                let mut buffer = self.new_frame(size);
                buffer[..data.len()].copy_from_slice(data);
                self.park(Uncomplete {
                    id,
                    read: data.len() as i32,
                    header: 0,
                    buffer,
                });
                return;
            }
            let mut buffer = self.pool.take(size);
            buffer.extend_from_slice(&data[..size]);
            self.queue.push_back(NetPacket { id, buffer });
            data = &data[size..];
            if data.is_empty() {
                return;
            }
        }
    }
}

/// Prefix `data` with its 2-byte big-endian length. Frames of 64 KiB and
/// above do not fit the prefix and are rejected.
pub fn pack(data: &[u8]) -> crate::Result<Vec<u8>> {
    if data.len() >= 0x10000 {
        return Err(crate::Error::MessageTooLarge(data.len()));
    }
    let mut out = Vec::with_capacity(2 + data.len());
    out.push((data.len() >> 8) as u8);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn data_message(id: i32, bytes: &[u8]) -> SocketMessage {
        SocketMessage {
            kind: SocketEventKind::Data,
            id,
            ud: bytes.len() as i32,
            buffer: bytes.to_vec().into_boxed_slice(),
        }
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut asm = Assembler::new();
        let chunk = [0x00, 0x02, 0xAA, 0xBB, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o'];
        assert_eq!(asm.filter(data_message(1, &chunk)), Filtered::More);
        assert_eq!(
            asm.pop(),
            Some(NetPacket {
                id: 1,
                buffer: vec![0xAA, 0xBB],
            })
        );
        assert_eq!(
            asm.pop(),
            Some(NetPacket {
                id: 1,
                buffer: b"hello".to_vec(),
            })
        );
        assert_eq!(asm.pop(), None);
    }

    #[test]
    fn byte_at_a_time_is_identical() {
        let mut asm = Assembler::new();
        let stream = [0x00, 0x02, 0xAA, 0xBB, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o'];
        let mut frames = Vec::new();
        for byte in stream {
            match asm.filter(data_message(1, &[byte])) {
                Filtered::Data(packet) => frames.push(packet.buffer),
                Filtered::Pending => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(frames, vec![vec![0xAA, 0xBB], b"hello".to_vec()]);
    }

    #[test]
    fn single_complete_frame_is_data() {
        let mut asm = Assembler::new();
        let framed = pack(b"ping").unwrap();
        let Filtered::Data(packet) = asm.filter(data_message(7, &framed)) else {
            panic!("expected Data");
        };
        assert_eq!(packet.buffer, b"ping");
    }

    #[test]
    fn split_across_chunk_boundary() {
        let mut asm = Assembler::new();
        let framed = pack(b"split-me-somewhere").unwrap();
        let (a, b) = framed.split_at(7);
        assert_eq!(asm.filter(data_message(2, a)), Filtered::Pending);
        let Filtered::Data(packet) = asm.filter(data_message(2, b)) else {
            panic!("expected Data");
        };
        assert_eq!(packet.buffer, b"split-me-somewhere");
    }

    #[test]
    fn trailing_partial_frame_is_parked() {
        let mut asm = Assembler::new();
        let mut chunk = pack(b"one").unwrap();
        chunk.extend_from_slice(&[0x00]); // half a length prefix
        assert_eq!(asm.filter(data_message(3, &chunk)), Filtered::More);
        assert_eq!(asm.pop().unwrap().buffer, b"one");
        assert_eq!(asm.pop(), None);

        // rest of the prefix and the body arrive later
        assert_eq!(asm.filter(data_message(3, &[0x02])), Filtered::Pending);
        let Filtered::Data(packet) = asm.filter(data_message(3, &[9, 8])) else {
            panic!("expected Data");
        };
        assert_eq!(packet.buffer, vec![9, 8]);
    }

    #[test]
    fn connections_do_not_interfere() {
        let mut asm = Assembler::new();
        let framed = pack(b"abcd").unwrap();
        assert_eq!(asm.filter(data_message(10, &framed[..3])), Filtered::Pending);
        assert_eq!(asm.filter(data_message(11, &framed[..3])), Filtered::Pending);
        let Filtered::Data(p10) = asm.filter(data_message(10, &framed[3..])) else {
            panic!("expected Data");
        };
        let Filtered::Data(p11) = asm.filter(data_message(11, &framed[3..])) else {
            panic!("expected Data");
        };
        assert_eq!(p10.buffer, b"abcd");
        assert_eq!(p11.buffer, b"abcd");
    }

    #[test]
    fn close_discards_in_progress_frame() {
        let mut asm = Assembler::new();
        let framed = pack(b"interrupted").unwrap();
        assert_eq!(asm.filter(data_message(4, &framed[..5])), Filtered::Pending);
        assert_eq!(
            asm.filter(SocketMessage {
                kind: SocketEventKind::Close,
                id: 4,
                ud: 0,
                buffer: Box::default(),
            }),
            Filtered::Close { id: 4 }
        );
        // a fresh stream on the reused id starts clean
        let Filtered::Data(packet) = asm.filter(data_message(4, &pack(b"new").unwrap())) else {
            panic!("expected Data");
        };
        assert_eq!(packet.buffer, b"new");
    }

    #[test]
    fn zero_length_frame() {
        let mut asm = Assembler::new();
        let Filtered::Data(packet) = asm.filter(data_message(5, &[0x00, 0x00])) else {
            panic!("expected Data");
        };
        assert!(packet.buffer.is_empty());
    }

    #[test]
    fn pack_rejects_oversized() {
        assert!(pack(&vec![0u8; 0xFFFF]).is_ok());
        assert!(pack(&vec![0u8; 0x10000]).is_err());
    }

    #[test]
    fn pack_layout() {
        assert_eq!(pack(b"hi").unwrap(), vec![0x00, 0x02, b'h', b'i']);
    }

    #[test]
    fn pool_recycles_buffers() {
        let mut asm = Assembler::new();
        for _ in 0..8 {
            let framed = pack(b"recycled").unwrap();
            let Filtered::Data(packet) = asm.filter(data_message(6, &framed)) else {
                panic!("expected Data");
            };
            asm.recycle(packet.buffer);
        }
        assert!(!asm.pool.free.is_empty());
    }
}
