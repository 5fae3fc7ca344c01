//! Configuration for the channel fabric.

use serde::{Deserialize, Serialize};

/// Limits applied by a [`ChannelFabric`](crate::ChannelFabric) to every
/// endpoint it creates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest frame payload accepted by `try_write`, in bytes.
    pub max_message_bytes: usize,

    /// Most handles a single frame may carry.
    pub max_message_handles: usize,

    /// Frames an endpoint may hold unread before writers see `WouldBlock`.
    pub max_pending_frames: usize,

    /// Upper bound on simultaneously live channel pairs.
    /// None means unlimited.
    pub max_channels: Option<usize>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 65_536,
            max_message_handles: 64,
            max_pending_frames: 256,
            max_channels: None,
        }
    }
}

impl ChannelConfig {
    /// Create a new configuration with specified parameters.
    pub fn new(
        max_message_bytes: usize,
        max_message_handles: usize,
        max_pending_frames: usize,
        max_channels: Option<usize>,
    ) -> Self {
        Self {
            max_message_bytes,
            max_message_handles,
            max_pending_frames,
            max_channels,
        }
    }

    /// Set the per-endpoint pending frame limit.
    pub fn with_max_pending_frames(mut self, frames: usize) -> Self {
        self.max_pending_frames = frames;
        self
    }

    /// Set the frame size limit.
    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    /// Set the per-frame handle limit.
    pub fn with_max_message_handles(mut self, handles: usize) -> Self {
        self.max_message_handles = handles;
        self
    }

    /// Bound the number of live channel pairs.
    pub fn with_max_channels(mut self, channels: usize) -> Self {
        self.max_channels = Some(channels);
        self
    }

    /// Tiny queues so back-pressure shows up after a couple of frames.
    pub fn constrained() -> Self {
        Self {
            max_message_bytes: 4096,
            max_message_handles: 8,
            max_pending_frames: 2,
            max_channels: Some(16),
        }
    }

    /// Deep queues for bulk transfer.
    pub fn high_throughput() -> Self {
        Self {
            max_message_bytes: 1 << 20,
            max_message_handles: 64,
            max_pending_frames: 4096,
            max_channels: None,
        }
    }
}
