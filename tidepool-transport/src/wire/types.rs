//! Structured values with a wire representation.

use tidepool_core::HandleInfo;

use super::{
    ALLOC_PRESENT, CodingConfig, DecodeError, DecodeResult, EncodeError, HandleAttributes,
    Position, WireDecoder, WireEncoder,
};

/// A value that can be laid out in a message.
///
/// `INLINE_SIZE` bytes live at the value's position; anything variable-sized
/// goes out of line, allocated in traversal order.
pub trait Wire: Sized {
    /// Bytes occupied inline.
    const INLINE_SIZE: usize;

    /// Write the value at `position`, allocating out-of-line space as needed.
    fn encode(&self, encoder: &mut WireEncoder, position: Position) -> Result<(), EncodeError>;

    /// Read a value from `position`.
    fn decode<C: CodingConfig + ?Sized>(
        decoder: &mut WireDecoder<'_, C>,
        position: Position,
    ) -> DecodeResult<Self>;
}

macro_rules! impl_wire_int {
    ($($ty:ty => $unsigned:ty, $read:ident, $write:ident;)*) => {
        $(
            impl Wire for $ty {
                const INLINE_SIZE: usize = std::mem::size_of::<$ty>();

                fn encode(&self, encoder: &mut WireEncoder, position: Position) -> Result<(), EncodeError> {
                    encoder.$write(position, *self as $unsigned)
                }

                fn decode<C: CodingConfig + ?Sized>(
                    decoder: &mut WireDecoder<'_, C>,
                    position: Position,
                ) -> DecodeResult<Self> {
                    decoder.$read(position).map(|value| value as $ty)
                }
            }
        )*
    };
}

impl_wire_int! {
    u8 => u8, read_u8, write_u8;
    u16 => u16, read_u16, write_u16;
    u32 => u32, read_u32, write_u32;
    u64 => u64, read_u64, write_u64;
    i8 => u8, read_u8, write_u8;
    i16 => u16, read_u16, write_u16;
    i32 => u32, read_u32, write_u32;
    i64 => u64, read_u64, write_u64;
}

impl Wire for bool {
    const INLINE_SIZE: usize = 1;

    fn encode(&self, encoder: &mut WireEncoder, position: Position) -> Result<(), EncodeError> {
        encoder.write_u8(position, u8::from(*self))
    }

    fn decode<C: CodingConfig + ?Sized>(
        decoder: &mut WireDecoder<'_, C>,
        position: Position,
    ) -> DecodeResult<Self> {
        match decoder.read_u8(position)? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(decoder.fail(DecodeError::InvalidBoolean {
                offset: position.offset(),
                value,
            })),
        }
    }
}

/// Write a `[count][presence]` header and return the body position.
fn encode_header(
    encoder: &mut WireEncoder,
    position: Position,
    count: usize,
    body_size: usize,
) -> Result<Position, EncodeError> {
    encoder.write_u64(position, count as u64)?;
    encoder.write_u64(position.add(8), ALLOC_PRESENT)?;
    encoder.alloc(body_size)
}

/// Read a `[count][presence]` header, allocate the body and return both.
fn decode_header<C: CodingConfig + ?Sized>(
    decoder: &mut WireDecoder<'_, C>,
    position: Position,
    element_size: usize,
) -> DecodeResult<(usize, Position)> {
    let count = decoder.read_u64(position)?;
    let presence = decoder.read_u64(position.add(8))?;
    if presence != ALLOC_PRESENT {
        return Err(decoder.fail(DecodeError::InvalidPresenceIndicator {
            offset: position.offset() + 8,
            value: presence,
        }));
    }
    let body_size = usize::try_from(count)
        .ok()
        .and_then(|count| count.checked_mul(element_size));
    let Some(body_size) = body_size else {
        let available = decoder.bytes_total();
        return Err(decoder.fail(DecodeError::BufferTooSmall {
            needed: usize::MAX,
            available,
        }));
    };
    let body = decoder.alloc(body_size)?;
    // Bounded by the allocation above.
    Ok((count as usize, body))
}

impl Wire for String {
    const INLINE_SIZE: usize = 16;

    fn encode(&self, encoder: &mut WireEncoder, position: Position) -> Result<(), EncodeError> {
        let body = encode_header(encoder, position, self.len(), self.len())?;
        encoder.write_bytes(body, self.as_bytes())
    }

    fn decode<C: CodingConfig + ?Sized>(
        decoder: &mut WireDecoder<'_, C>,
        position: Position,
    ) -> DecodeResult<Self> {
        let (len, body) = decode_header(decoder, position, 1)?;
        let bytes = decoder.read_bytes(body, len)?;
        String::from_utf8(bytes).map_err(|_| {
            decoder.fail(DecodeError::InvalidUtf8 {
                offset: body.offset(),
            })
        })
    }
}

impl<T: Wire> Wire for Vec<T> {
    const INLINE_SIZE: usize = 16;

    fn encode(&self, encoder: &mut WireEncoder, position: Position) -> Result<(), EncodeError> {
        let body_size = self.len().saturating_mul(T::INLINE_SIZE);
        let body = encode_header(encoder, position, self.len(), body_size)?;
        for (index, element) in self.iter().enumerate() {
            element.encode(encoder, body.add(index * T::INLINE_SIZE))?;
        }
        Ok(())
    }

    fn decode<C: CodingConfig + ?Sized>(
        decoder: &mut WireDecoder<'_, C>,
        position: Position,
    ) -> DecodeResult<Self> {
        let (count, body) = decode_header(decoder, position, T::INLINE_SIZE)?;
        let mut elements = Vec::with_capacity(count);
        for index in 0..count {
            elements.push(T::decode(decoder, body.add(index * T::INLINE_SIZE))?);
        }
        Ok(elements)
    }
}

impl Wire for HandleInfo {
    const INLINE_SIZE: usize = 4;

    fn encode(&self, encoder: &mut WireEncoder, position: Position) -> Result<(), EncodeError> {
        encoder.encode_handle(position, Some(*self), false)
    }

    fn decode<C: CodingConfig + ?Sized>(
        decoder: &mut WireDecoder<'_, C>,
        position: Position,
    ) -> DecodeResult<Self> {
        let handle = decoder.decode_handle(position, HandleAttributes::ANY, false)?;
        handle.ok_or(DecodeError::AbsentNonNullableHandle {
            offset: position.offset(),
        })
    }
}

impl Wire for Option<HandleInfo> {
    const INLINE_SIZE: usize = 4;

    fn encode(&self, encoder: &mut WireEncoder, position: Position) -> Result<(), EncodeError> {
        encoder.encode_handle(position, *self, true)
    }

    fn decode<C: CodingConfig + ?Sized>(
        decoder: &mut WireDecoder<'_, C>,
        position: Position,
    ) -> DecodeResult<Self> {
        decoder.decode_handle(position, HandleAttributes::ANY, true)
    }
}
