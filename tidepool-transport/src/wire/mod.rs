//! Wire codec for handle-bearing messages.
//!
//! Layout rules:
//!
//! - Every object (the inline root and each out-of-line body) starts on an
//!   8-byte boundary. Padding up to the boundary must be zero.
//! - Integers are little-endian.
//! - A handle is a 4-byte presence marker ([`HANDLE_PRESENT`] or
//!   [`HANDLE_ABSENT`]); present handles are taken from the handle table in
//!   the order their markers appear.
//! - Strings and vectors use a 16-byte header, `[count: u64][presence: u64]`,
//!   followed by an out-of-line body.
//! - Messages start with a 16-byte [`MessageHeader`].
//!
//! Decoding never leaks: on any failure every handle of the message, claimed
//! or not, is closed exactly once through the [`CodingConfig`].

use thiserror::Error;
use tidepool_core::{Frame, HandleInfo, HandleKind, HandleSpace, RawHandle, Rights};

mod decoder;
mod encoder;
mod header;
mod outgoing;
mod types;

pub use decoder::{DecodedHandles, WireDecoder};
pub use encoder::{EncodedMessage, WireEncoder};
pub use header::{HEADER_SIZE, MAGIC_NUMBER, MessageHeader, decode_message, encode_message};
pub use outgoing::OutgoingMessage;
pub use types::Wire;

/// Alignment of every object in a message.
pub const ALIGNMENT: usize = 8;

/// Marker of a present handle or out-of-line object (32-bit form).
pub const HANDLE_PRESENT: u32 = u32::MAX;

/// Marker of an absent handle.
pub const HANDLE_ABSENT: u32 = 0;

/// Marker of a present out-of-line body in a 16-byte header.
pub const ALLOC_PRESENT: u64 = u64::MAX;

/// Round `offset` up to the next multiple of [`ALIGNMENT`].
pub const fn align(offset: usize) -> Option<usize> {
    match offset.checked_add(ALIGNMENT - 1) {
        Some(padded) => Some(padded & !(ALIGNMENT - 1)),
        None => None,
    }
}

/// Offset of a value inside the message buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position(usize);

impl Position {
    /// Byte offset from the start of the buffer.
    pub fn offset(self) -> usize {
        self.0
    }

    /// A position `bytes` further into the buffer.
    pub fn add(self, bytes: usize) -> Position {
        Position(self.0 + bytes)
    }
}

/// Constraints a decoded handle must satisfy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct HandleAttributes {
    /// Required object kind. [`HandleKind::None`] accepts any kind.
    pub kind: HandleKind,
    /// Required rights. The decoded handle is reduced to exactly these.
    /// [`Rights::NONE`] skips the check.
    pub rights: Rights,
}

impl HandleAttributes {
    /// Accept any handle unchanged.
    pub const ANY: HandleAttributes = HandleAttributes {
        kind: HandleKind::None,
        rights: Rights::NONE,
    };

    /// Require `kind` and `rights`.
    pub const fn new(kind: HandleKind, rights: Rights) -> Self {
        Self { kind, rights }
    }
}

/// Handle hooks supplied by the owner of the handle table.
pub trait CodingConfig {
    /// Close a handle the decoder will not hand out.
    fn close_handle(&self, handle: RawHandle);

    /// Validate a claimed handle against `attributes`, possibly reducing its rights.
    fn process_handle(
        &self,
        handle: &mut HandleInfo,
        attributes: HandleAttributes,
    ) -> Result<(), DecodeError>;
}

impl CodingConfig for HandleSpace {
    fn close_handle(&self, handle: RawHandle) {
        if let Err(error) = self.close(handle) {
            tracing::warn!("decoder closed handle {}: {}", handle, error);
        }
    }

    fn process_handle(
        &self,
        handle: &mut HandleInfo,
        attributes: HandleAttributes,
    ) -> Result<(), DecodeError> {
        if attributes.kind != HandleKind::None && handle.kind != attributes.kind {
            return Err(DecodeError::WrongHandleKind {
                expected: attributes.kind,
                actual: handle.kind,
            });
        }
        if attributes.rights != Rights::NONE {
            if !handle.rights.contains(attributes.rights) {
                return Err(DecodeError::MissingRights {
                    required: attributes.rights,
                    present: handle.rights,
                });
            }
            handle.rights = attributes.rights;
        }
        Ok(())
    }
}

/// Decode-time validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// An allocation or read ran past the end of the buffer.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes in the buffer.
        available: usize,
    },

    /// Non-zero byte in alignment padding.
    #[error("non-zero padding at offset {offset}")]
    InvalidPadding {
        /// Offset of the first offending byte.
        offset: usize,
    },

    /// A presence marker was neither present nor absent.
    #[error("invalid presence indicator {value:#x} at offset {offset}")]
    InvalidPresenceIndicator {
        /// Offset of the marker.
        offset: usize,
        /// Marker value.
        value: u64,
    },

    /// The handle table slot was already consumed or never valid.
    #[error("invalid handle in input at table index {index}")]
    InvalidHandleInInput {
        /// Handle table index.
        index: usize,
    },

    /// More present markers than handles in the table.
    #[error("too many handles consumed: table holds {available}")]
    TooManyHandlesConsumed {
        /// Handles in the table.
        available: usize,
    },

    /// A required handle was marked absent.
    #[error("absent non-nullable handle at offset {offset}")]
    AbsentNonNullableHandle {
        /// Offset of the marker.
        offset: usize,
    },

    /// A string body was not UTF-8.
    #[error("invalid UTF-8 in string at offset {offset}")]
    InvalidUtf8 {
        /// Offset of the string body.
        offset: usize,
    },

    /// A boolean byte was neither 0 nor 1.
    #[error("invalid boolean {value} at offset {offset}")]
    InvalidBoolean {
        /// Offset of the byte.
        offset: usize,
        /// Byte value.
        value: u8,
    },

    /// Unknown header magic number.
    #[error("unsupported magic number {0}")]
    UnsupportedMagic(u8),

    /// A handle referred to the wrong kind of object.
    #[error("wrong handle kind: expected {expected:?}, got {actual:?}")]
    WrongHandleKind {
        /// Kind required.
        expected: HandleKind,
        /// Kind found.
        actual: HandleKind,
    },

    /// A handle lacked required rights.
    #[error("missing rights: required {required:?}, present {present:?}")]
    MissingRights {
        /// Rights required.
        required: Rights,
        /// Rights held.
        present: Rights,
    },

    /// Bytes left over after the message was decoded.
    #[error("extra bytes: consumed {consumed} of {total}")]
    ExtraBytes {
        /// Bytes consumed by decoding.
        consumed: usize,
        /// Bytes in the buffer.
        total: usize,
    },

    /// Handles left unclaimed after the message was decoded.
    #[error("extra handles: consumed {consumed} of {total}")]
    ExtraHandles {
        /// Handles claimed by decoding.
        consumed: usize,
        /// Handles in the table.
        total: usize,
    },
}

/// Result type for decode operations.
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Encode-time failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A write fell outside allocated space.
    #[error("write of {len} bytes at offset {offset} outside allocated space ({allocated})")]
    OutOfBounds {
        /// Write offset.
        offset: usize,
        /// Write length.
        len: usize,
        /// Bytes allocated so far.
        allocated: usize,
    },

    /// A required handle was missing.
    #[error("absent non-nullable handle at offset {offset}")]
    AbsentNonNullableHandle {
        /// Offset of the marker.
        offset: usize,
    },

    /// A handle slot held the invalid value.
    #[error("invalid handle at offset {offset}")]
    InvalidHandle {
        /// Offset of the marker.
        offset: usize,
    },

    /// An allocation would grow the buffer past what can be addressed.
    #[error("allocation of {size} bytes at offset {offset} overflows the buffer")]
    AllocationOverflow {
        /// Offset where the allocation would start.
        offset: usize,
        /// Requested size.
        size: usize,
    },

    /// The message grew past the allowed size.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Encoded size.
        size: usize,
        /// Allowed size.
        max: usize,
    },
}

/// Decode a message frame whose handles belong to `space`.
///
/// The frame's handles are moved into a raw handle table; on failure every one
/// of them is closed through `space`, on success ownership passes to the
/// returned [`DecodedHandles`].
pub fn decode_frame<T: Wire>(
    space: &HandleSpace,
    frame: Frame,
) -> DecodeResult<(MessageHeader, T, DecodedHandles)> {
    let (mut bytes, handles) = frame.into_parts();
    let mut table: Vec<HandleInfo> = handles.into_iter().map(|h| h.into_info()).collect();
    decode_message(space, &mut bytes, &mut table)
}
