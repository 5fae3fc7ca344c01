//! Message header and whole-message helpers.

use tidepool_core::HandleInfo;

use super::{
    CodingConfig, DecodeError, DecodeResult, DecodedHandles, EncodeError, EncodedMessage,
    Position, Wire, WireDecoder, WireEncoder,
};

/// Size of [`MessageHeader`] on the wire.
pub const HEADER_SIZE: usize = 16;

/// The only supported header magic number.
pub const MAGIC_NUMBER: u8 = 1;

/// Header preceding every message body.
///
/// ```text
/// 0        4           7       8                16
/// +--------+-----------+-------+----------------+
/// |  txid  | flags[3]  | magic |    ordinal     |
/// +--------+-----------+-------+----------------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageHeader {
    /// Transaction id pairing a request with its response. Zero for events.
    pub txid: u32,
    /// Reserved flag bytes.
    pub flags: [u8; 3],
    /// Wire format magic number.
    pub magic: u8,
    /// Method ordinal.
    pub ordinal: u64,
}

impl MessageHeader {
    /// Header for `ordinal` with the current magic number.
    pub fn new(txid: u32, ordinal: u64) -> Self {
        Self {
            txid,
            flags: [0; 3],
            magic: MAGIC_NUMBER,
            ordinal,
        }
    }

    /// Returns true if the magic number is supported.
    pub fn is_compatible(&self) -> bool {
        self.magic == MAGIC_NUMBER
    }
}

impl Wire for MessageHeader {
    const INLINE_SIZE: usize = HEADER_SIZE;

    fn encode(&self, encoder: &mut WireEncoder, position: Position) -> Result<(), EncodeError> {
        encoder.write_u32(position, self.txid)?;
        encoder.write_bytes(position.add(4), &self.flags)?;
        encoder.write_u8(position.add(7), self.magic)?;
        encoder.write_u64(position.add(8), self.ordinal)
    }

    fn decode<C: CodingConfig + ?Sized>(
        decoder: &mut WireDecoder<'_, C>,
        position: Position,
    ) -> DecodeResult<Self> {
        let txid = decoder.read_u32(position)?;
        let mut flags = [0u8; 3];
        flags.copy_from_slice(&decoder.read_bytes(position.add(4), 3)?);
        let magic = decoder.read_u8(position.add(7))?;
        if magic != MAGIC_NUMBER {
            return Err(decoder.fail(DecodeError::UnsupportedMagic(magic)));
        }
        let ordinal = decoder.read_u64(position.add(8))?;
        Ok(Self {
            txid,
            flags,
            magic,
            ordinal,
        })
    }
}

/// Encode `header` followed by `body`.
pub fn encode_message<T: Wire>(
    header: &MessageHeader,
    body: &T,
) -> Result<EncodedMessage, EncodeError> {
    let mut encoder = WireEncoder::new();
    let position = encoder.alloc(HEADER_SIZE)?;
    header.encode(&mut encoder, position)?;
    let position = encoder.alloc(T::INLINE_SIZE)?;
    body.encode(&mut encoder, position)?;
    Ok(encoder.finish())
}

fn decode_parts<T: Wire, C: CodingConfig + ?Sized>(
    decoder: &mut WireDecoder<'_, C>,
) -> DecodeResult<(MessageHeader, T)> {
    let position = decoder.alloc(HEADER_SIZE)?;
    let header = MessageHeader::decode(decoder, position)?;
    let position = decoder.alloc(T::INLINE_SIZE)?;
    let body = T::decode(decoder, position)?;

    let (consumed, total) = (decoder.bytes_consumed(), decoder.bytes_total());
    if consumed != total {
        return Err(decoder.fail(DecodeError::ExtraBytes { consumed, total }));
    }
    let (consumed, total) = (decoder.handles_consumed(), decoder.handles_total());
    if consumed != total {
        return Err(decoder.fail(DecodeError::ExtraHandles { consumed, total }));
    }
    Ok((header, body))
}

/// Decode a whole message: header, body, and nothing else.
///
/// Every byte must be consumed and every handle claimed. On failure every
/// handle of the message is closed through `config`.
pub fn decode_message<T: Wire, C: CodingConfig + ?Sized>(
    config: &C,
    bytes: &mut [u8],
    handles: &mut [HandleInfo],
) -> DecodeResult<(MessageHeader, T, DecodedHandles)> {
    let mut decoder = WireDecoder::new(config, bytes, handles);
    let parts = decode_parts::<T, C>(&mut decoder).map_err(|error| decoder.fail(error));
    let claimed = decoder.finish()?;
    let (header, body) = parts?;
    Ok((header, body, claimed))
}
