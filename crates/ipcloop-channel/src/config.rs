use std::time::Duration;

use ipcloop_frame::{FrameConfig, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};

use crate::error::{ChannelError, Result};

/// Per-channel behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Largest accepted frame, header included, in either direction.
    pub max_frame_size: usize,
    /// Size of the scratch buffer used for each non-blocking read.
    pub read_buffer_size: usize,
}

impl ChannelConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_frame_size < HEADER_SIZE {
            return Err(ChannelError::Config(
                "max_frame_size must hold at least a frame header",
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(ChannelError::Config("read_buffer_size must be non-zero"));
        }
        Ok(())
    }

    pub(crate) fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_frame_size: self.max_frame_size,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: 16 * 1024,
        }
    }
}

/// Event loop thread behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLoopConfig {
    /// Upper bound on one OS wait; the loop re-checks its request queues at
    /// least this often even without a wake-up.
    pub poll_timeout: Duration,
    /// Name given to the loop thread.
    pub thread_name: String,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            thread_name: "ipcloop-event-loop".to_string(),
        }
    }
}
