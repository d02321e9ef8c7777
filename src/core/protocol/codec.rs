// src/core/protocol/codec.rs

//! Length-delimited framing of protocol envelopes for tokio streams.

use super::messages::Envelope;
use crate::core::TesseraError;
use bincode::config;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Hard cap on a single frame; phantom-update payloads are flushed in much
/// smaller batches.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Default)]
pub struct RpcCodec;

impl Encoder<Envelope> for RpcCodec {
    type Error = TesseraError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = bincode::encode_to_vec(&item, config::standard())?;
        if body.len() > MAX_FRAME_LEN {
            return Err(TesseraError::Protocol(format!(
                "frame of {} bytes exceeds maximum",
                body.len()
            )));
        }
        dst.reserve(4 + body.len());
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for RpcCodec {
    type Item = Envelope;
    type Error = TesseraError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TesseraError::Protocol(format!(
                "frame of {len} bytes exceeds maximum"
            )));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let body = src.split_to(len);
        let (envelope, _): (Envelope, usize) =
            bincode::decode_from_slice(&body, config::standard())?;
        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{RpcRequest, messages::RpcBody};

    #[test]
    fn envelope_roundtrip() {
        let mut codec = RpcCodec;
        let envelope = Envelope::request(7, 1000, RpcRequest::Status);
        let mut buf = BytesMut::new();
        codec.encode(envelope.clone(), &mut buf).unwrap();

        // Partial frame decodes to None without consuming input.
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert!(matches!(decoded.body, RpcBody::Request(RpcRequest::Status)));
    }
}
