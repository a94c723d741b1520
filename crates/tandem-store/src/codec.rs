use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StoreError, StoreResult};
use crate::message::{MessageKind, MuxedProxyMessage, ProxyMessage};

/// Largest payload a frame may carry.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 8;

/// Messages that can be framed by [`MessageCodec`].
pub trait Framed {
    fn kind(&self) -> MessageKind;
}

impl<D, O> Framed for ProxyMessage<D, O> {
    fn kind(&self) -> MessageKind {
        ProxyMessage::kind(self)
    }
}

impl<D, O> Framed for MuxedProxyMessage<D, O> {
    fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

/// Envelope codec for relaying store messages across a process boundary.
///
/// Frame layout: `[4 bytes len][4 bytes crc32][1 byte tag][payload]`, where
/// `len` counts the tag and payload and the checksum covers the same bytes.
pub struct MessageCodec;

impl MessageCodec {
    pub fn encode<T: Framed + Serialize>(message: &T) -> StoreResult<Vec<u8>> {
        let payload = bincode::serialize(message)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(StoreError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(message.kind().tag());
        body.extend_from_slice(&payload);

        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode one frame from the front of `data`. Returns the message and the
    /// number of bytes consumed.
    pub fn decode<T: Framed + DeserializeOwned>(data: &[u8]) -> StoreResult<(T, usize)> {
        if data.len() < HEADER_LEN + 1 {
            return Err(StoreError::Framing("too short".into()));
        }
        let len = read_u32(&data[0..4]) as usize;
        if len < 1 {
            return Err(StoreError::Framing("zero-length frame".into()));
        }
        if len - 1 > MAX_FRAME_SIZE {
            return Err(StoreError::FrameTooLarge {
                size: len - 1,
                max: MAX_FRAME_SIZE,
            });
        }
        let total = HEADER_LEN + len;
        if data.len() < total {
            return Err(StoreError::Framing(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let body = &data[HEADER_LEN..total];
        let expected = read_u32(&data[4..8]);
        let computed = crc32fast::hash(body);
        if expected != computed {
            return Err(StoreError::ChecksumMismatch { expected, computed });
        }
        let tag = MessageKind::from_tag(body[0])
            .ok_or_else(|| StoreError::Framing(format!("unknown tag {}", body[0])))?;
        let message: T = bincode::deserialize(&body[1..])
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        if message.kind() != tag {
            return Err(StoreError::Framing(format!(
                "tag {} does not match {} payload",
                tag.name(),
                message.kind().name()
            )));
        }
        Ok((message, total))
    }
}

/// Encode model data handed to a driver.
pub fn encode_model<D: Serialize>(data: &D) -> StoreResult<Bytes> {
    bincode::serialize(data)
        .map(Bytes::from)
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode model data received from a driver.
pub fn decode_model<D: DeserializeOwned>(bytes: &[u8]) -> StoreResult<D> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}
