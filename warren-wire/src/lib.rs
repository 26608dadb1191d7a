//! Wire framing and value serialization for the `warren` actor runtime.
//!
//! Three codecs live here, all operating on plain byte slices with no I/O:
//!
//! - [`request`] / [`response`] — the framing used when services call each
//!   other across a socket, including the 32 KiB multi-part split.
//! - [`seri`] — a self-describing serializer for structured payloads.
//! - [`multipart`] — the shared chunking policy and reassembly buffer.
//!
//! Every frame on the stream is preceded by a big-endian `u16` length
//! prefix (see the runtime's netpack layer); the codecs here produce and
//! consume frame bodies, and the `pack_*` helpers emit the prefix too so a
//! frame can be handed straight to a socket.

#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

mod error;
pub(crate) mod parse;

pub mod multipart;
pub mod request;
pub mod response;
pub mod seri;

pub use error::WireError;

/// Split the big-endian `u16` length prefix off a full frame, returning the
/// body it delimits. Fails if the prefix disagrees with the frame length.
pub fn frame_body(frame: &[u8]) -> Result<&[u8], WireError> {
    let (body, len) = parse::new_be_u16(frame)?;
    if body.len() != len as usize {
        return Err(WireError::InvalidSize(body.len()));
    }
    Ok(body)
}
