//! Length-prefixed, type-tagged message framing.
//!
//! Every message on a channel is framed with:
//! - A 4-byte magic number ("IPCL") for stream sanity checking
//! - A 4-byte little-endian length of the whole frame, header included
//! - A payload carrying the message type name and its body
//!
//! [`FrameDecoder`] reassembles frames from arbitrarily split reads, so the
//! I/O layer can hand over whatever a non-blocking socket returned.

pub mod codec;
pub mod decoder;
pub mod error;
pub mod message;

pub use codec::{
    decode_frame, encode_message, encode_to_bytes, FrameConfig, DEFAULT_MAX_FRAME_SIZE,
    HEADER_SIZE, MAGIC,
};
pub use decoder::FrameDecoder;
pub use error::{FrameError, Result};
pub use message::{Message, MessageType, MAX_TYPE_NAME_LEN};
