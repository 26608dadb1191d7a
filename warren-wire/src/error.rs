/// Errors produced while packing or unpacking wire frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The input ended before the frame was complete.
    #[error("truncated frame")]
    Truncated,

    /// A tag byte outside the documented set.
    #[error("invalid frame tag {0:#04x}")]
    InvalidTag(u8),

    /// A frame whose declared size disagrees with its layout.
    #[error("invalid frame size {0}")]
    InvalidSize(usize),

    /// Named addresses carry a 1..=255 byte name.
    #[error("invalid name length {0}")]
    NameLength(usize),

    /// Sessions on the wire are strictly positive.
    #[error("invalid session {0}")]
    InvalidSession(i64),

    /// Payload too large for the framing in use.
    #[error("payload of {0} bytes exceeds the framing limit")]
    TooLarge(usize),

    /// Serializer containers may nest at most 32 levels deep.
    #[error("container nesting too deep")]
    TooDeep,

    /// A multi-part stream completed with the wrong number of bytes.
    #[error("multi-part length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: u32, got: u32 },

    /// A multi-part chunk arrived for a session with no announced header.
    #[error("multi-part chunk for unknown session {0}")]
    UnknownSession(u32),
}
