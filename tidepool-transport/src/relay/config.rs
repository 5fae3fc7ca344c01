//! Configuration structures for transport behavior.

use serde::{Deserialize, Serialize};

/// Limits and fairness settings for a [`Transport`](super::Transport).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest message accepted by `enqueue`, in bytes.
    pub max_message_bytes: usize,

    /// Most handles a single message may carry.
    pub max_message_handles: usize,

    /// Frames delivered per readable wakeup before yielding to the dispatcher.
    /// None means drain until the channel would block.
    pub max_reads_per_wakeup: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 65_536,
            max_message_handles: 64,
            max_reads_per_wakeup: None,
        }
    }
}

impl TransportConfig {
    /// Set the message size limit.
    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    /// Set the per-message handle limit.
    pub fn with_max_message_handles(mut self, handles: usize) -> Self {
        self.max_message_handles = handles;
        self
    }

    /// Yield to the dispatcher after `reads` frames per wakeup.
    pub fn with_max_reads_per_wakeup(mut self, reads: usize) -> Self {
        self.max_reads_per_wakeup = Some(reads);
        self
    }

    /// Share the dispatcher fairly between many busy transports.
    pub fn fair() -> Self {
        Self {
            max_reads_per_wakeup: Some(16),
            ..Self::default()
        }
    }
}
