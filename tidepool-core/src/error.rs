//! Error types for handles and channels.

use thiserror::Error;

use crate::handle::RawHandle;

/// Errors reported by a [`HandleSpace`](crate::HandleSpace).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    /// The raw value does not name an open handle in this space.
    #[error("bad handle: {0}")]
    BadHandle(RawHandle),

    /// The handle space was dropped while handles were still outstanding.
    #[error("handle space is gone")]
    SpaceGone,
}

/// Errors reported by channel operations.
///
/// `WouldBlock` and `PeerClosed` are part of normal operation; everything
/// else is fatal to whoever owns the endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The operation cannot complete now; retry after the next readiness callback.
    #[error("operation would block")]
    WouldBlock,

    /// The opposite endpoint has been closed.
    #[error("peer closed")]
    PeerClosed,

    /// This endpoint has already been closed.
    #[error("channel endpoint is closed")]
    Closed,

    /// The fabric cannot allocate another channel pair.
    #[error("resource exhausted: {live} live channel pairs (limit {limit})")]
    ResourceExhausted {
        /// Pairs currently alive.
        live: usize,
        /// Configured upper bound.
        limit: usize,
    },

    /// A frame exceeded the configured byte limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Frame payload size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// A frame carried more handles than allowed.
    #[error("too many handles in frame: {count} (max {max})")]
    TooManyHandles {
        /// Handles attached to the frame.
        count: usize,
        /// Configured limit.
        max: usize,
    },

    /// Any other I/O fault.
    #[error("I/O error: {0}")]
    Io(String),
}

impl ChannelError {
    /// Returns true for errors that end the life of an endpoint's owner.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChannelError::WouldBlock | ChannelError::PeerClosed)
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
