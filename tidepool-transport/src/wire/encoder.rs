//! Encoder building a byte buffer and handle table.

use tidepool_core::{Frame, Handle, HandleError, HandleInfo, HandleSpace};
use tracing::warn;

use super::{EncodeError, HANDLE_ABSENT, HANDLE_PRESENT, Position, align};

/// Growing encoder. Every allocation is zero-filled and 8-byte aligned, so
/// padding is always valid on the decode side.
#[derive(Debug, Default)]
pub struct WireEncoder {
    bytes: Vec<u8>,
    handles: Vec<HandleInfo>,
}

impl WireEncoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `size` zeroed bytes at the next aligned offset.
    pub fn alloc(&mut self, size: usize) -> Result<Position, EncodeError> {
        let start = self.bytes.len();
        let end = start
            .checked_add(size)
            .and_then(align)
            .filter(|end| *end <= isize::MAX as usize)
            .ok_or(EncodeError::AllocationOverflow {
                offset: start,
                size,
            })?;
        self.bytes.resize(end, 0);
        Ok(Position(start))
    }

    fn slot(&mut self, position: Position, len: usize) -> Result<&mut [u8], EncodeError> {
        let start = position.offset();
        let allocated = self.bytes.len();
        match start.checked_add(len) {
            Some(end) if end <= allocated => Ok(&mut self.bytes[start..end]),
            _ => Err(EncodeError::OutOfBounds {
                offset: start,
                len,
                allocated,
            }),
        }
    }

    /// Write a byte.
    pub fn write_u8(&mut self, position: Position, value: u8) -> Result<(), EncodeError> {
        self.write_bytes(position, &[value])
    }

    /// Write a little-endian u16.
    pub fn write_u16(&mut self, position: Position, value: u16) -> Result<(), EncodeError> {
        self.write_bytes(position, &value.to_le_bytes())
    }

    /// Write a little-endian u32.
    pub fn write_u32(&mut self, position: Position, value: u32) -> Result<(), EncodeError> {
        self.write_bytes(position, &value.to_le_bytes())
    }

    /// Write a little-endian u64.
    pub fn write_u64(&mut self, position: Position, value: u64) -> Result<(), EncodeError> {
        self.write_bytes(position, &value.to_le_bytes())
    }

    /// Copy `data` into allocated space.
    pub fn write_bytes(&mut self, position: Position, data: &[u8]) -> Result<(), EncodeError> {
        self.slot(position, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Write a handle marker and append the handle to the table.
    pub fn encode_handle(
        &mut self,
        position: Position,
        handle: Option<HandleInfo>,
        optional: bool,
    ) -> Result<(), EncodeError> {
        let offset = position.offset();
        match handle {
            Some(handle) if handle.is_invalid() => Err(EncodeError::InvalidHandle { offset }),
            Some(handle) => {
                self.write_u32(position, HANDLE_PRESENT)?;
                self.handles.push(handle);
                Ok(())
            }
            None if optional => self.write_u32(position, HANDLE_ABSENT),
            None => Err(EncodeError::AbsentNonNullableHandle { offset }),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if nothing has been allocated.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Finish encoding.
    pub fn finish(self) -> EncodedMessage {
        EncodedMessage {
            bytes: self.bytes,
            handles: self.handles,
        }
    }
}

/// Output of a [`WireEncoder`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedMessage {
    /// Encoded bytes.
    pub bytes: Vec<u8>,
    /// Handle table in marker order.
    pub handles: Vec<HandleInfo>,
}

impl EncodedMessage {
    /// Take ownership of the handles through `space` and build a frame.
    ///
    /// # Errors
    ///
    /// Fails if a handle is not open in `space`. Handles not yet adopted are
    /// closed before returning.
    pub fn into_frame(self, space: &HandleSpace) -> Result<Frame, HandleError> {
        let handles = adopt_all(space, self.handles)?;
        Ok(Frame::new(self.bytes, handles))
    }
}

pub(super) fn adopt_all(
    space: &HandleSpace,
    infos: Vec<HandleInfo>,
) -> Result<Vec<Handle>, HandleError> {
    let mut owned = Vec::with_capacity(infos.len());
    let mut pending = infos.into_iter();
    while let Some(info) = pending.next() {
        match space.adopt(info) {
            Ok(handle) => owned.push(handle),
            Err(error) => {
                for rest in pending {
                    if let Err(close_error) = space.close(rest.raw) {
                        warn!("failed to close unadopted handle {}: {}", rest.raw, close_error);
                    }
                }
                return Err(error);
            }
        }
    }
    Ok(owned)
}
