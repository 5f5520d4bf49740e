//! Codec for encoding/decoding control messages

use crate::messages::ControlMessage;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control message codec
///
/// Format: [length: u32 big-endian][payload: JSON encoded message]
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlCodec;

impl ControlCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode a control message to a standalone frame
    pub fn encode_frame(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        Self::write_frame(msg, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one control message from the front of `buf`
    ///
    /// Returns Ok(Some(message)) if a complete frame was consumed,
    /// Ok(None) if more data is needed,
    /// Err if the frame is oversized or malformed
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        // Need at least 4 bytes for length header
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let payload = buf.split_to(length);
        let msg: ControlMessage = serde_json::from_slice(&payload)?;

        Ok(Some(msg))
    }

    /// Decode every complete frame currently buffered
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<ControlMessage>, CodecError> {
        let mut messages = Vec::new();

        while let Some(msg) = Self::decode_frame(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }

    fn write_frame(msg: &ControlMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(msg)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::decode_frame(src)
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::write_frame(&item, dst)
    }
}
