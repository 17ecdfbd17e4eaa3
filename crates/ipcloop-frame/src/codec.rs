use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::message::Message;

/// Frame header: magic (4) + total length (4) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "IPCL".
pub const MAGIC: [u8; 4] = *b"IPCL";

/// Default maximum total frame size: 16 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a message into the wire format, appending to `dst`.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────┬──────────────────────────┐
/// │ Magic (4B)   │ Length (4B)  │ Payload                  │
/// │ "IPCL"       │ LE, includes │ (Length - 8 bytes)       │
/// │              │ the header   │                          │
/// └──────────────┴──────────────┴──────────────────────────┘
/// ```
///
/// The length field is written as a placeholder and patched once the payload
/// is in place. On error `dst` is left as it was.
pub fn encode_message(msg: &Message, dst: &mut BytesMut, max_frame_size: usize) -> Result<()> {
    let total = HEADER_SIZE + msg.payload_len();
    let limit = max_frame_size.min(u32::MAX as usize);
    if total > limit {
        return Err(FrameError::FrameTooLarge {
            size: total,
            max: limit,
        });
    }

    let start = dst.len();
    dst.reserve(total);
    dst.put_slice(&MAGIC);
    dst.put_u32_le(0);
    msg.write_payload(dst);

    let written = dst.len() - start;
    debug_assert_eq!(written, total);
    dst[start + 4..start + HEADER_SIZE].copy_from_slice(&(written as u32).to_le_bytes());
    Ok(())
}

/// Encode a message into a standalone frame buffer.
pub fn encode_to_bytes(msg: &Message, max_frame_size: usize) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + msg.payload_len());
    encode_message(msg, &mut buf, max_frame_size)?;
    Ok(buf.freeze())
}

/// Split one complete frame off the front of `src`.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success the frame is consumed and its payload (without header) returned.
pub fn decode_frame(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..4] != MAGIC {
        let mut found = [0u8; 4];
        found.copy_from_slice(&src[0..4]);
        return Err(FrameError::InvalidMagic { found });
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&src[4..HEADER_SIZE]);
    let total = u32::from_le_bytes(len_bytes) as usize;

    if total < HEADER_SIZE {
        return Err(FrameError::InvalidLength { len: total });
    }
    if total > max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: total,
            max: max_frame_size,
        });
    }

    if src.len() < total {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(total - HEADER_SIZE).freeze()))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum total frame size in bytes, header included. Default: 16 MiB.
    pub max_frame_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
