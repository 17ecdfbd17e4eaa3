/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header does not start with the protocol magic.
    #[error("invalid frame magic {found:02x?} (expected \"IPCL\")")]
    InvalidMagic { found: [u8; 4] },

    /// The length field is smaller than the frame header itself.
    #[error("invalid frame length {len} (header alone is 8 bytes)")]
    InvalidLength { len: usize },

    /// The frame exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The frame payload is not a well-formed typed message.
    #[error("malformed message payload: {0}")]
    MalformedPayload(&'static str),

    /// A message was decoded as a type other than the one it carries.
    #[error("message type mismatch (expected {expected}, found {found})")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    /// The message body could not be (de)serialized.
    #[error("message body error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameError {
    /// Whether this error means the byte stream itself can no longer be trusted.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidMagic { .. }
                | FrameError::InvalidLength { .. }
                | FrameError::FrameTooLarge { .. }
                | FrameError::MalformedPayload(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
