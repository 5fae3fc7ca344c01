//! Counters collected by a transport.

/// Traffic and lifecycle counters for one [`Transport`](super::Transport).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMetrics {
    /// Frames written to the channel
    pub messages_sent: u64,

    /// Payload bytes written to the channel
    pub bytes_sent: u64,

    /// Frames read from the channel
    pub messages_received: u64,

    /// Payload bytes read from the channel
    pub bytes_received: u64,

    /// Frames accepted by `enqueue`
    pub messages_queued: u64,

    /// Frames discarded because the transport closed before writing them
    pub messages_dropped: u64,

    /// Writes refused with `WouldBlock`
    pub would_block_count: u64,

    /// Largest outbound queue depth observed
    pub peak_queue_depth: usize,

    /// Times a channel was bound
    pub binds: u64,

    /// Times a bound channel was closed
    pub closes: u64,
}

impl TransportMetrics {
    /// Record a frame written.
    pub fn record_message_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record a frame read.
    pub fn record_message_received(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Record a frame entering the queue at the given depth.
    pub fn record_message_queued(&mut self, depth: usize) {
        self.messages_queued += 1;
        self.peak_queue_depth = self.peak_queue_depth.max(depth);
    }

    /// Record frames discarded on close.
    pub fn record_messages_dropped(&mut self, count: usize) {
        self.messages_dropped += count as u64;
    }

    /// Record a refused write.
    pub fn record_would_block(&mut self) {
        self.would_block_count += 1;
    }
}
