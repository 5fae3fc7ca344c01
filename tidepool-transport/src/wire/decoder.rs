//! Validating decoder over a byte buffer and a handle table.

use tidepool_core::{HandleInfo, RawHandle};

use super::{
    ALIGNMENT, CodingConfig, DecodeError, DecodeResult, HANDLE_ABSENT, HANDLE_PRESENT,
    HandleAttributes, Position, align,
};

/// Cursor-based decoder.
///
/// Only the first error is kept; later operations still return errors but do
/// not replace it. [`finish`](Self::finish) reports that error after closing
/// every handle of the message.
pub struct WireDecoder<'a, C: CodingConfig + ?Sized> {
    config: &'a C,
    bytes: &'a mut [u8],
    handles: &'a mut [HandleInfo],
    next_out_of_line: usize,
    handle_cursor: usize,
    claimed: Vec<HandleInfo>,
    error: Option<DecodeError>,
}

impl<'a, C: CodingConfig + ?Sized> WireDecoder<'a, C> {
    /// Start decoding `bytes` with `handles` as the handle table.
    pub fn new(config: &'a C, bytes: &'a mut [u8], handles: &'a mut [HandleInfo]) -> Self {
        Self {
            config,
            bytes,
            handles,
            next_out_of_line: 0,
            handle_cursor: 0,
            claimed: Vec::new(),
            error: None,
        }
    }

    /// Record `error` unless an earlier one exists, and return it.
    pub fn fail(&mut self, error: DecodeError) -> DecodeError {
        if self.error.is_none() {
            tracing::debug!("decode failed: {}", error);
            self.error = Some(error.clone());
        }
        error
    }

    /// The first recorded error.
    pub fn error(&self) -> Option<&DecodeError> {
        self.error.as_ref()
    }

    /// Reserve the next `size` bytes of object space, 8-byte aligned.
    ///
    /// A zero size returns the current cursor without advancing. The padding
    /// between `size` and the next boundary must be zero.
    pub fn alloc(&mut self, size: usize) -> DecodeResult<Position> {
        let start = self.next_out_of_line;
        let total = self.bytes.len();
        let Some(end) = start.checked_add(size) else {
            return Err(self.fail(DecodeError::BufferTooSmall {
                needed: usize::MAX,
                available: total,
            }));
        };
        let Some(aligned_end) = align(end) else {
            return Err(self.fail(DecodeError::BufferTooSmall {
                needed: usize::MAX,
                available: total,
            }));
        };
        if aligned_end > total {
            return Err(self.fail(DecodeError::BufferTooSmall {
                needed: aligned_end,
                available: total,
            }));
        }
        if let Some(index) = self.bytes[end..aligned_end].iter().position(|b| *b != 0) {
            return Err(self.fail(DecodeError::InvalidPadding { offset: end + index }));
        }
        self.next_out_of_line = aligned_end;
        debug_assert_eq!(start % ALIGNMENT, 0);
        Ok(Position(start))
    }

    fn slice(&mut self, position: Position, len: usize) -> DecodeResult<&[u8]> {
        let start = position.offset();
        let end = start.checked_add(len).unwrap_or(usize::MAX);
        if end > self.bytes.len() {
            let available = self.bytes.len();
            return Err(self.fail(DecodeError::BufferTooSmall {
                needed: end,
                available,
            }));
        }
        Ok(&self.bytes[start..end])
    }

    fn read_array<const N: usize>(&mut self, position: Position) -> DecodeResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(position, N)?);
        Ok(out)
    }

    /// Read a byte.
    pub fn read_u8(&mut self, position: Position) -> DecodeResult<u8> {
        Ok(self.read_array::<1>(position)?[0])
    }

    /// Read a little-endian u16.
    pub fn read_u16(&mut self, position: Position) -> DecodeResult<u16> {
        self.read_array(position).map(u16::from_le_bytes)
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self, position: Position) -> DecodeResult<u32> {
        self.read_array(position).map(u32::from_le_bytes)
    }

    /// Read a little-endian u64.
    pub fn read_u64(&mut self, position: Position) -> DecodeResult<u64> {
        self.read_array(position).map(u64::from_le_bytes)
    }

    /// Copy `len` bytes out of the buffer.
    pub fn read_bytes(&mut self, position: Position, len: usize) -> DecodeResult<Vec<u8>> {
        self.slice(position, len).map(<[u8]>::to_vec)
    }

    /// Decode the handle marker at `position`.
    ///
    /// A present marker claims the next table slot: the slot is invalidated,
    /// the handle is checked against `attributes` and its raw value is written
    /// over the marker. Returns None for an absent marker when `optional`.
    pub fn decode_handle(
        &mut self,
        position: Position,
        attributes: HandleAttributes,
        optional: bool,
    ) -> DecodeResult<Option<HandleInfo>> {
        let marker = self.read_u32(position)?;
        match marker {
            HANDLE_PRESENT => {
                let index = self.handle_cursor;
                let Some(slot) = self.handles.get_mut(index) else {
                    let available = self.handles.len();
                    return Err(self.fail(DecodeError::TooManyHandlesConsumed { available }));
                };
                self.handle_cursor += 1;
                let mut handle = slot.take();
                if handle.is_invalid() {
                    return Err(self.fail(DecodeError::InvalidHandleInInput { index }));
                }
                // Claimed before validation so a rejected handle is still closed.
                let checked = self.config.process_handle(&mut handle, attributes);
                self.claimed.push(handle);
                if let Err(error) = checked {
                    return Err(self.fail(error));
                }
                let offset = position.offset();
                self.bytes[offset..offset + 4].copy_from_slice(&handle.raw.into_raw().to_le_bytes());
                Ok(Some(handle))
            }
            HANDLE_ABSENT if optional => Ok(None),
            HANDLE_ABSENT => Err(self.fail(DecodeError::AbsentNonNullableHandle {
                offset: position.offset(),
            })),
            other => Err(self.fail(DecodeError::InvalidPresenceIndicator {
                offset: position.offset(),
                value: u64::from(other),
            })),
        }
    }

    /// Close up to `count` handles from the cursor onwards, advancing past them.
    pub fn close_next_n_handles(&mut self, count: usize) {
        let end = self.handle_cursor.saturating_add(count).min(self.handles.len());
        for slot in &mut self.handles[self.handle_cursor..end] {
            let handle = slot.take();
            if !handle.is_invalid() {
                self.config.close_handle(handle.raw);
            }
        }
        self.handle_cursor = end;
    }

    /// Bytes reserved so far.
    pub fn bytes_consumed(&self) -> usize {
        self.next_out_of_line
    }

    /// Size of the buffer.
    pub fn bytes_total(&self) -> usize {
        self.bytes.len()
    }

    /// Table slots consumed so far.
    pub fn handles_consumed(&self) -> usize {
        self.handle_cursor
    }

    /// Size of the handle table.
    pub fn handles_total(&self) -> usize {
        self.handles.len()
    }

    /// Handles claimed so far, in claim order.
    pub fn claimed_handles(&self) -> &[HandleInfo] {
        &self.claimed
    }

    /// End decoding.
    ///
    /// On error every claimed handle and every handle still in the table is
    /// closed, then the first error is returned. On success the claimed
    /// handles are handed to the caller.
    pub fn finish(mut self) -> DecodeResult<DecodedHandles> {
        match self.error.take() {
            Some(error) => {
                for handle in std::mem::take(&mut self.claimed) {
                    self.config.close_handle(handle.raw);
                }
                self.handle_cursor = 0;
                self.close_next_n_handles(self.handles.len());
                Err(error)
            }
            None => Ok(DecodedHandles {
                handles: self.claimed,
                bytes_consumed: self.next_out_of_line,
            }),
        }
    }
}

/// Handles handed out by a successful decode, plus bookkeeping.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecodedHandles {
    handles: Vec<HandleInfo>,
    bytes_consumed: usize,
}

impl DecodedHandles {
    /// Claimed handles in the order their markers appeared.
    pub fn handles(&self) -> &[HandleInfo] {
        &self.handles
    }

    /// Raw values of the claimed handles.
    pub fn raw(&self) -> Vec<RawHandle> {
        self.handles.iter().map(|h| h.raw).collect()
    }

    /// Bytes the decode consumed.
    pub fn bytes_consumed(&self) -> usize {
        self.bytes_consumed
    }

    /// Take the claimed handles.
    pub fn into_handles(self) -> Vec<HandleInfo> {
        self.handles
    }

    /// Close every claimed handle through `config`.
    pub fn close_all<C: CodingConfig + ?Sized>(self, config: &C) {
        for handle in self.handles {
            config.close_handle(handle.raw);
        }
    }
}
