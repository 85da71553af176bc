//! TLV frame codec for byte-stream transports
//!
//! Wire layout: `tag:u32` big-endian, `length:u32` big-endian, then
//! `length` payload bytes. A declared length beyond the configured maximum
//! is a protocol violation; the connection closes rather than attempting to
//! resynchronize the stream.

use crate::error::NetError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const HEADER_LEN: usize = 8;

/// One tagged message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvFrame {
    /// Message type selector, application-defined
    pub tag: u32,
    pub payload: Bytes,
}

impl TlvFrame {
    pub fn new(tag: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }
}

/// Codec enforcing the configured payload ceiling in both directions
#[derive(Debug, Clone)]
pub struct TlvCodec {
    max_payload: usize,
}

impl TlvCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Decoder for TlvCodec {
    type Item = TlvFrame;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<TlvFrame>, NetError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if length > self.max_payload {
            return Err(NetError::FrameTooLarge {
                size: length,
                limit: self.max_payload,
            });
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let tag = src.get_u32();
        let _ = src.get_u32();
        let payload = src.split_to(length).freeze();
        Ok(Some(TlvFrame { tag, payload }))
    }
}

impl Encoder<TlvFrame> for TlvCodec {
    type Error = NetError;

    fn encode(&mut self, frame: TlvFrame, dst: &mut BytesMut) -> Result<(), NetError> {
        if frame.payload.len() > self.max_payload {
            return Err(NetError::FrameTooLarge {
                size: frame.payload.len(),
                limit: self.max_payload,
            });
        }

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u32(frame.tag);
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
