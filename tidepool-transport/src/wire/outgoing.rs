//! Gather-style outgoing messages.

use tidepool_core::{Frame, Handle, HandleError, HandleSpace};

use super::encoder::adopt_all;
use super::{EncodeError, EncodedMessage, HEADER_SIZE};

/// A message assembled from byte segments and owned handles.
///
/// Segments are kept apart until [`into_frame`](Self::into_frame), which
/// flattens them so the message occupies exactly one queue entry.
#[derive(Debug, Default)]
pub struct OutgoingMessage {
    segments: Vec<Vec<u8>>,
    handles: Vec<Handle>,
}

impl OutgoingMessage {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of an encoded message's handles, splitting the header
    /// and body into separate segments.
    ///
    /// # Errors
    ///
    /// Fails if a handle is not open in `space`; the rest are closed.
    pub fn from_encoded(message: EncodedMessage, space: &HandleSpace) -> Result<Self, HandleError> {
        let handles = adopt_all(space, message.handles)?;
        let mut header = message.bytes;
        let body = if header.len() > HEADER_SIZE {
            header.split_off(HEADER_SIZE)
        } else {
            Vec::new()
        };
        let mut outgoing = Self {
            segments: Vec::with_capacity(2),
            handles,
        };
        outgoing.push_segment(header);
        outgoing.push_segment(body);
        Ok(outgoing)
    }

    /// Append a byte segment. Empty segments are skipped.
    pub fn push_segment(&mut self, segment: impl Into<Vec<u8>>) {
        let segment = segment.into();
        if !segment.is_empty() {
            self.segments.push(segment);
        }
    }

    /// Append a handle.
    pub fn push_handle(&mut self, handle: Handle) {
        self.handles.push(handle);
    }

    /// Total bytes across segments.
    pub fn byte_len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    /// Number of non-empty segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Number of handles.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Check the flattened size against `max` bytes.
    pub fn ensure_within(&self, max: usize) -> Result<(), EncodeError> {
        let size = self.byte_len();
        if size > max {
            return Err(EncodeError::MessageTooLarge { size, max });
        }
        Ok(())
    }

    /// Flatten into a single frame.
    pub fn into_frame(self) -> Frame {
        let mut bytes = Vec::with_capacity(self.byte_len());
        for segment in self.segments {
            bytes.extend_from_slice(&segment);
        }
        Frame::new(bytes, self.handles)
    }
}
