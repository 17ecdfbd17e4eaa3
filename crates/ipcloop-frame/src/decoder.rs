use bytes::BytesMut;
use tracing::trace;

use crate::codec::{decode_frame, FrameConfig};
use crate::error::Result;
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Incremental frame reassembly over an arbitrarily chunked byte stream.
///
/// Bytes are fed in whatever pieces the socket delivers; every complete frame
/// is split off and decoded in arrival order. Whatever remains buffered is
/// always a strict prefix of the next frame.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    config: FrameConfig,
}

impl FrameDecoder {
    /// Create a decoder with default configuration.
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    /// Create a decoder with explicit configuration.
    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Append `data` and return every message completed by it.
    ///
    /// On a protocol violation the accumulated bytes are discarded and the
    /// error is returned instead. Use [`FrameDecoder::feed_into`] to keep the
    /// messages that were completed before the bad frame.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        self.feed_into(data, &mut messages)?;
        Ok(messages)
    }

    /// Append `data` and push every message completed by it onto `out`.
    ///
    /// Returns how many messages were pushed. Messages preceding a protocol
    /// violation are pushed before the error is returned; the violating bytes
    /// and everything buffered after them are discarded, so the caller is
    /// expected to drop the connection.
    pub fn feed_into(&mut self, data: &[u8], out: &mut Vec<Message>) -> Result<usize> {
        self.buf.extend_from_slice(data);

        let before = out.len();
        loop {
            let decoded = decode_frame(&mut self.buf, self.config.max_frame_size)
                .and_then(|payload| payload.map(Message::read_payload).transpose());
            match decoded {
                Ok(Some(msg)) => {
                    trace!(type_name = msg.type_name(), "decoded frame");
                    out.push(msg);
                }
                Ok(None) => return Ok(out.len() - before),
                Err(err) => {
                    self.reset();
                    return Err(err);
                }
            }
        }
    }

    /// Drop any partially received frame.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes held for the frame currently being received.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Update maximum frame size for subsequent decoding.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.config.max_frame_size = max_frame_size;
    }

    /// Current decoder configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
