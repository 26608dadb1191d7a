//! Service-facing socket layer.
//!
//! Wraps the reactor ([`server`]) for the rest of the runtime: the socket
//! thread pumps [`Node::socket_poll`], which converts reactor events into
//! `Socket`-kind messages delivered to the owning service's mailbox. The
//! `Node::socket_*` methods are what services call; they add the
//! write-queue backpressure warning on top of the raw [`SocketApi`].

pub mod addr;
pub mod server;

use num_enum::{FromPrimitive, IntoPrimitive};

use crate::{
    message::{Message, MessageKind, Payload},
    node::Node,
    report,
};

pub use addr::UdpAddress;
pub use server::{ReactorEvent, SocketApi, SocketServer};

/// Info strings (peer addresses, error text) are capped at this length.
const MAX_INFO: usize = 128;

/// A service's write queue tripping this many bytes raises a warning.
const WARNING_SIZE: i64 = 1024 * 1024;

/// What a `Socket`-kind message reports.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SocketEventKind {
    Data = 1,
    /// Also covers `start`/`transfer`/`binding` acknowledgements.
    Connect = 2,
    Close = 3,
    /// `ud` holds the accepted connection's id.
    Accept = 4,
    Error = 5,
    Udp = 6,
    /// `ud` holds the queued byte count in KiB.
    Warning = 7,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Payload of a `Socket`-kind message.
#[derive(Debug)]
pub struct SocketMessage {
    pub kind: SocketEventKind,
    /// Socket id the event concerns.
    pub id: i32,
    /// Byte count for data, new id for accept, KiB for warnings.
    pub ud: i32,
    /// Data bytes, or an info string for connect/accept/error events. For
    /// UDP data the packed peer address follows the datagram bytes (`ud`
    /// bytes in, see [`SocketMessage::udp_address`]).
    pub buffer: Box<[u8]>,
}

impl SocketMessage {
    /// The packed peer address carried by a UDP data message.
    pub fn udp_address(&self) -> Option<UdpAddress> {
        if self.kind != SocketEventKind::Udp {
            return None;
        }
        UdpAddress::decode(self.buffer.get(self.ud as usize..)?)
    }
}

fn info_bytes(info: String) -> Box<[u8]> {
    let mut bytes = info.into_bytes();
    bytes.truncate(MAX_INFO);
    bytes.into_boxed_slice()
}

fn deliver(node: &Node, opaque: u32, message: SocketMessage) {
    let pushed = node.push_to(
        opaque,
        Message {
            source: 0,
            session: 0,
            kind: MessageKind::Socket,
            payload: Payload::Socket(Box::new(message)),
        },
    );
    if pushed.is_err() {
        // owner already gone; the event dies here
        log::debug!(target: "warren::socket", "socket event for dead service :{opaque:08x}");
    }
}

/// Outcome of one socket-thread iteration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Reactor asked to exit; the socket thread returns.
    Exit,
    /// Event batch exhausted.
    Idle,
    /// More events pending; keep pumping without waking sleepers yet.
    Busy,
}

impl Node {
    /// Pump the reactor once and forward the resulting event, if any, to
    /// the owning service. Socket thread only.
    pub fn socket_poll(&self, server: &mut SocketServer) -> PollStatus {
        let mut more = true;
        let Some(event) = server.poll_once(&mut more) else {
            return PollStatus::Busy;
        };
        match event {
            ReactorEvent::Exit => return PollStatus::Exit,
            ReactorEvent::Data { id, opaque, data } => deliver(
                self,
                opaque,
                SocketMessage {
                    kind: SocketEventKind::Data,
                    id,
                    ud: data.len() as i32,
                    buffer: data,
                },
            ),
            ReactorEvent::Udp {
                id,
                opaque,
                data,
                address,
            } => {
                // datagram bytes then packed peer address, as one buffer
                let n = data.len();
                let mut buffer = Vec::with_capacity(n + address.len());
                buffer.extend_from_slice(&data);
                buffer.extend_from_slice(address.as_bytes());
                deliver(
                    self,
                    opaque,
                    SocketMessage {
                        kind: SocketEventKind::Udp,
                        id,
                        ud: n as i32,
                        buffer: buffer.into_boxed_slice(),
                    },
                );
            }
            ReactorEvent::Connect { id, opaque, info } => deliver(
                self,
                opaque,
                SocketMessage {
                    kind: SocketEventKind::Connect,
                    id,
                    ud: 0,
                    buffer: info_bytes(info),
                },
            ),
            ReactorEvent::Close { id, opaque } => deliver(
                self,
                opaque,
                SocketMessage {
                    kind: SocketEventKind::Close,
                    id,
                    ud: 0,
                    buffer: Box::default(),
                },
            ),
            ReactorEvent::Accept {
                id,
                opaque,
                new_id,
                info,
            } => deliver(
                self,
                opaque,
                SocketMessage {
                    kind: SocketEventKind::Accept,
                    id,
                    ud: new_id,
                    buffer: info_bytes(info),
                },
            ),
            ReactorEvent::Error { id, opaque, info } => {
                if opaque == 0 {
                    report::error(self, 0, format!("socket {id} error: {info}"));
                } else {
                    deliver(
                        self,
                        opaque,
                        SocketMessage {
                            kind: SocketEventKind::Error,
                            id,
                            ud: 0,
                            buffer: info_bytes(info),
                        },
                    );
                }
            }
        }
        if more {
            PollStatus::Busy
        } else {
            PollStatus::Idle
        }
    }

    fn check_warning(&self, owner: u32, id: i32, queued: i64) -> crate::Result<()> {
        if queued < 0 {
            return Err(crate::Error::DestinationNotFound(owner));
        }
        if queued > WARNING_SIZE {
            deliver(
                self,
                owner,
                SocketMessage {
                    kind: SocketEventKind::Warning,
                    id,
                    ud: (queued / 1024) as i32,
                    buffer: Box::default(),
                },
            );
        }
        Ok(())
    }

    /// Queue `data` for delivery on socket `id` at high priority. A queue
    /// above 1 MiB raises a `Warning` socket message to `owner`.
    pub fn socket_send(&self, owner: u32, id: i32, data: Vec<u8>) -> crate::Result<()> {
        let queued = self.socket().send(id, data);
        self.check_warning(owner, id, queued)
    }

    /// Queue `data` at low priority.
    pub fn socket_send_lowpriority(&self, owner: u32, id: i32, data: Vec<u8>) {
        self.socket().send_lowpriority(id, data);
    }

    /// Listen on `host:port`; the returned socket stays paused until
    /// [`Node::socket_start`].
    pub fn socket_listen(&self, owner: u32, host: &str, port: u16, backlog: i32) -> crate::Result<i32> {
        self.socket().listen(owner, host, port, backlog)
    }

    /// Open a TCP connection; completion arrives as a socket message.
    pub fn socket_connect(&self, owner: u32, host: &str, port: u16) -> crate::Result<i32> {
        self.socket().connect(owner, host, port)
    }

    /// Attach an externally owned fd.
    pub fn socket_bind(&self, owner: u32, fd: std::os::fd::RawFd) -> crate::Result<i32> {
        self.socket().bind(owner, fd)
    }

    /// Graceful close; pending writes drain first.
    pub fn socket_close(&self, owner: u32, id: i32) {
        self.socket().close(owner, id);
    }

    /// Hard close after one best-effort drain.
    pub fn socket_shutdown(&self, owner: u32, id: i32) {
        self.socket().shutdown(owner, id);
    }

    /// Arm a paused socket or take over a connected one.
    pub fn socket_start(&self, owner: u32, id: i32) {
        self.socket().start(owner, id);
    }

    /// Set TCP_NODELAY.
    pub fn socket_nodelay(&self, id: i32) {
        self.socket().nodelay(id);
    }

    /// Create a UDP socket, optionally bound.
    pub fn socket_udp(&self, owner: u32, host: &str, port: u16) -> crate::Result<i32> {
        self.socket().udp(owner, host, port)
    }

    /// Set the default peer of a UDP socket.
    pub fn socket_udp_connect(&self, id: i32, host: &str, port: u16) -> crate::Result<()> {
        self.socket().udp_connect(id, host, port)
    }

    /// Send a datagram to an explicit packed peer address.
    pub fn socket_udp_send(
        &self,
        owner: u32,
        id: i32,
        address: &UdpAddress,
        data: Vec<u8>,
    ) -> crate::Result<()> {
        let queued = self.socket().udp_send(id, address, data);
        self.check_warning(owner, id, queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_message_exposes_trailing_address() {
        let datagram = b"ping";
        let peer: std::net::SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let packed = UdpAddress::encode(peer);
        let mut buffer = datagram.to_vec();
        buffer.extend_from_slice(packed.as_bytes());

        let message = SocketMessage {
            kind: SocketEventKind::Udp,
            id: 3,
            ud: datagram.len() as i32,
            buffer: buffer.into_boxed_slice(),
        };
        assert_eq!(message.udp_address().unwrap().to_socket_addr(), peer);

        let not_udp = SocketMessage {
            kind: SocketEventKind::Data,
            id: 3,
            ud: 0,
            buffer: Box::default(),
        };
        assert!(not_udp.udp_address().is_none());
    }
}
