//! Error types for transport operations.

use thiserror::Error;

/// Errors returned synchronously by [`Transport`](crate::Transport) operations.
///
/// I/O failures never surface here; they close the transport and are reported
/// once through its close handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// `set_channel` was called while a channel is already bound.
    #[error("transport already has a bound channel")]
    AlreadyBound,

    /// The transport is closing or closed and accepts no more messages.
    #[error("transport is closed")]
    Closed,

    /// A message exceeded the configured byte limit.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Message payload size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// A message carried more handles than allowed.
    #[error("too many handles in message: {count} (max {max})")]
    TooManyHandles {
        /// Handles attached to the message.
        count: usize,
        /// Configured limit.
        max: usize,
    },

    /// The dispatcher the transport was created with has been dropped.
    #[error("dispatcher is gone")]
    DispatcherGone,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
