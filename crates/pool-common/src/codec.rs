//! Length-prefixed stream framing for [`Packet`]s.
//!
//! Wraps a byte stream into a packet stream via `tokio_util`'s
//! [`Decoder`]/[`Encoder`] traits. Partial reads stay buffered; the codec
//! never discards bytes except on a fatal framing error, which the owning
//! connection task treats as terminal for that socket.

use crate::packet::{FramingError, Packet, HEADER_LEN, MAX_PAYLOAD};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Stateless framing codec for the pool wire protocol.
///
/// Used on both links: the upstream wallet connection and every miner
/// connection speak the same header ‖ length ‖ payload framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl PacketCodec {
    /// Creates a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, FramingError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let declared = u32::from_be_bytes(src[1..HEADER_LEN].try_into().expect("4 length bytes"));
        let declared = declared as usize;
        if declared > MAX_PAYLOAD {
            // Fatal: the stream is desynchronized or hostile. Do not resync.
            return Err(FramingError::PayloadTooLarge {
                max: MAX_PAYLOAD,
                actual: declared,
            });
        }

        let total = HEADER_LEN + declared;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let header = src[0];
        src.advance(HEADER_LEN);
        let payload = src.split_to(declared);
        Packet::parse(header, &payload).map(Some)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = FramingError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), FramingError> {
        let bytes = packet.serialize();
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}
