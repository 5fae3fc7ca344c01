//! Outbound message queue.

use std::collections::VecDeque;

use tidepool_core::Frame;

/// Ordered, unbounded queue of frames waiting to be written.
///
/// Frames are never split or merged: each entry is written as one frame.
/// A frame the channel refused with `WouldBlock` goes back to the head with
/// [`requeue`](Self::requeue) so ordering is preserved.
#[derive(Debug, Default)]
pub struct MessageQueue {
    frames: VecDeque<Frame>,
    queued_bytes: usize,
    peak_depth: usize,
}

impl MessageQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame at the tail.
    pub fn push(&mut self, frame: Frame) {
        self.queued_bytes += frame.len();
        self.frames.push_back(frame);
        self.peak_depth = self.peak_depth.max(self.frames.len());
    }

    /// Put a frame back at the head after a refused write.
    pub fn requeue(&mut self, frame: Frame) {
        self.queued_bytes += frame.len();
        self.frames.push_front(frame);
    }

    /// Take the frame at the head.
    pub fn pop(&mut self) -> Option<Frame> {
        let frame = self.frames.pop_front()?;
        self.queued_bytes -= frame.len();
        Some(frame)
    }

    /// Remove every queued frame, returning them in order.
    pub fn take_all(&mut self) -> VecDeque<Frame> {
        self.queued_bytes = 0;
        std::mem::take(&mut self.frames)
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total payload bytes queued.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Largest depth ever reached.
    pub fn peak_depth(&self) -> usize {
        self.peak_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_with_requeue() {
        let mut queue = MessageQueue::new();
        queue.push(Frame::from_bytes("a"));
        queue.push(Frame::from_bytes("bb"));
        assert_eq!(queue.queued_bytes(), 3);

        let head = queue.pop().expect("head");
        assert_eq!(head.bytes, b"a");
        queue.requeue(head);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|f| f.bytes).collect();
        assert_eq!(order, vec![b"a".to_vec(), b"bb".to_vec()]);
        assert_eq!(queue.queued_bytes(), 0);
        assert_eq!(queue.peak_depth(), 2);
    }

    #[test]
    fn test_take_all_empties_queue() {
        let mut queue = MessageQueue::new();
        queue.push(Frame::from_bytes("x"));
        queue.push(Frame::from_bytes("y"));

        let taken = queue.take_all();
        assert_eq!(taken.len(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.queued_bytes(), 0);
    }
}
