//! # Tidepool Transport Layer
//!
//! Message transport over [`tidepool_core`] channels.
//!
//! This crate provides:
//! - **Transport**: one channel endpoint plus an outbound queue, driven by the
//!   dispatcher with ordered delivery and back-pressure
//! - **Binding sets**: collections of (implementation, transport) pairs that
//!   remove themselves when their transport closes
//! - **Inbox**: async adapter over a transport's inbound frames
//! - **Wire format**: 8-byte aligned encoding with a handle table and
//!   leak-free validating decode

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use tidepool_core::{
    ChannelConfig, ChannelError, ChannelFabric, ChannelHandle, Dispatcher, Frame, Handle,
    HandleInfo, HandleSpace, RawHandle, Signals,
};

// =============================================================================
// Modules
// =============================================================================

/// Binding sets with automatic removal on close.
pub mod binding;

/// Error types for transport operations.
pub mod error;

/// Async receive adapter.
pub mod inbox;

/// Outbound message queue.
pub mod queue;

/// Dispatcher-driven channel transport.
pub mod relay;

/// Aligned wire format with handle tables.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Binding exports
pub use binding::{AddError, BindingId, BindingSet, MessageReceiver};

// Error exports
pub use error::{TransportError, TransportResult};

// Inbox exports
pub use inbox::Inbox;

// Queue exports
pub use queue::MessageQueue;

// Relay exports
pub use relay::{CloseReason, Phase, Transport, TransportConfig, TransportMetrics};

// Wire format exports
pub use wire::{
    CodingConfig, DecodeError, DecodeResult, DecodedHandles, EncodeError, EncodedMessage,
    HEADER_SIZE, HandleAttributes, MAGIC_NUMBER, MessageHeader, OutgoingMessage, Wire,
    WireDecoder, WireEncoder, decode_frame, decode_message, encode_message,
};
