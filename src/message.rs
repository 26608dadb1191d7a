//! Messages exchanged between services.

use num_enum::{FromPrimitive, IntoPrimitive};

use crate::{handle::Handle, harbor::RemoteMessage, socket::SocketMessage};

/// Messages above this size are rejected at send time. The limit keeps the
/// byte count representable alongside an 8-bit kind tag in the on-wire
/// size:kind packing.
pub const MAX_MESSAGE_SIZE: u64 = (1 << 56) - 1;

/// The protocol tag carried by every message. Tags outside the documented
/// set are preserved and delivered as [`MessageKind::Unknown`]; the
/// receiving service decides what to do with them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    /// Plain text, also the kind used by the error sink.
    Text = 0,
    /// Reply leg of a request/response exchange; timer expirations too.
    Response = 1,
    Multicast = 2,
    Client = 3,
    System = 4,
    /// Envelope destined for the inter-node forwarder.
    Harbor = 5,
    /// Socket events from the network reactor.
    Socket = 6,
    /// Delivery failure reported back to a sender.
    Error = 7,
    #[num_enum(catch_all)]
    Unknown(u8),
}

bitflags::bitflags! {
    /// Modifiers accepted by the send entry points.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct SendFlags: u32 {
        /// Draw a fresh session from the sender; the caller must pass
        /// session 0.
        const ALLOC_SESSION = 1;
    }
}

/// Message payload. Ownership always lives with the message; forwarding a
/// payload means moving the `Message` onward, and dropping it frees it.
#[derive(Debug, Default)]
pub enum Payload {
    #[default]
    Empty,
    Bytes(Box<[u8]>),
    /// A socket event from the reactor.
    Socket(Box<SocketMessage>),
    /// An envelope addressed to another node, consumed by the harbor
    /// forwarder service.
    Remote(Box<RemoteMessage>),
}

impl Payload {
    /// Byte length of an in-line payload; structured payloads report 0.
    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(b) => b.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(b) => b,
            _ => &[],
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Bytes(v.into_boxed_slice())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Bytes(s.into_bytes().into_boxed_slice())
    }
}

/// One queued message.
#[derive(Debug, Default)]
pub struct Message {
    /// Sending service, 0 for runtime-internal sources.
    pub source: Handle,
    /// Request correlation id; 0 when unused.
    pub session: i32,
    pub kind: MessageKind,
    pub payload: Payload,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}
