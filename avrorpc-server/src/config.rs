//! Listener configuration.

use avrorpc_protocol::{
    DEFAULT_FRAME_SIZE, DEFAULT_READ_BUFFER_SIZE, MAX_MESSAGE_SIZE, MAX_READ_BUFFER_SIZE,
    MIN_READ_BUFFER_SIZE,
};

/// Listener configuration.
#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    /// Frame size used when splitting outgoing replies.
    pub frame_size: usize,
    /// Read buffer size for the session loop.
    pub read_buffer_size: usize,
    /// Maximum reassembled request size.
    pub max_message_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl ListenerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_size(mut self, size: usize) -> Self {
        self.frame_size = size.max(1);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size.max(1);
        self
    }
}
