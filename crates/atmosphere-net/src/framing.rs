//! Message framing for the Atmosphere wire protocol (§6).
//!
//! Every frame is CBOR-encoded and length-prefixed by a u32 big-endian byte
//! count, except BLE which uses a 1-byte length and requires fragmentation
//! (handled by [`Fragmenter`]/[`Reassembler`] below, since a single BLE
//! characteristic write caps out at 220 bytes).

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {1})")]
    TooLarge(usize, usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR encode error: {0}")]
    Encode(String),
    #[error("CBOR decode error: {0}")]
    Decode(String),
    #[error("unknown discriminator: {0}")]
    UnknownDiscriminator(u8),
}

/// The top-level frame discriminator (§6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    Handshake = 0x01,
    HandshakeAck = 0x02,
    Heartbeat = 0x03,
    GossipEnvelope = 0x04,
    AntiEntropyReq = 0x05,
    AntiEntropyResp = 0x06,
    IntentRequest = 0x07,
    IntentResponse = 0x08,
    TransportSwitch = 0x09,
    Revocation = 0x0A,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::HandshakeAck),
            0x03 => Ok(Self::Heartbeat),
            0x04 => Ok(Self::GossipEnvelope),
            0x05 => Ok(Self::AntiEntropyReq),
            0x06 => Ok(Self::AntiEntropyResp),
            0x07 => Ok(Self::IntentRequest),
            0x08 => Ok(Self::IntentResponse),
            0x09 => Ok(Self::TransportSwitch),
            0x0A => Ok(Self::Revocation),
            other => Err(FrameError::UnknownDiscriminator(other)),
        }
    }
}

/// A single wire frame: discriminator plus opaque CBOR payload bytes. The
/// payload is decoded into its concrete message type by the caller, once it
/// knows which [`FrameKind`] it received — this module only owns transport
/// framing, not message semantics.
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Encode a message as a frame of the given kind using canonical CBOR.
    pub fn encode<T: Serialize>(kind: FrameKind, message: &T) -> Result<Self, FrameError> {
        let mut payload = Vec::new();
        ciborium::into_writer(message, &mut payload)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(Self { kind, payload })
    }

    /// Decode this frame's payload as a message of type `T`.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, FrameError> {
        ciborium::from_reader(self.payload.as_slice()).map_err(|e| FrameError::Decode(e.to_string()))
    }
}

/// Codec for length-prefixed frames on stream transports (LAN TCP, Relay WebSocket).
///
/// Wire format: 4 bytes length (big-endian, includes the 1 discriminator
/// byte) + 1 byte discriminator + N bytes CBOR payload.
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 5 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(FrameError::TooLarge(length, self.max_frame_size));
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let kind = FrameKind::try_from(src[0])?;
        src.advance(1);

        let payload_len = length - 1;
        let payload = src.split_to(payload_len).to_vec();

        Ok(Some(Frame { kind, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > self.max_frame_size {
            return Err(FrameError::TooLarge(length, self.max_frame_size));
        }
        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.kind as u8);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// Splits an oversized frame into BLE-sized chunks (1-byte length prefix,
/// 220-byte max payload per §6/§9).
///
/// Chunk wire format: `[kind:1][msg_id:2][chunk_idx:1][total_chunks:1][chunk_len:1][chunk_bytes]`.
pub struct Fragmenter;

const BLE_CHUNK_HEADER: usize = 6;

impl Fragmenter {
    pub fn fragment(frame: &Frame, max_chunk: usize, msg_id: u16) -> Result<Vec<Vec<u8>>, FrameError> {
        let body_chunk_size = max_chunk.saturating_sub(BLE_CHUNK_HEADER);
        if body_chunk_size == 0 {
            return Err(FrameError::TooLarge(max_chunk, BLE_CHUNK_HEADER));
        }
        let total_chunks = frame.payload.len().div_ceil(body_chunk_size).max(1);
        if total_chunks > u8::MAX as usize {
            return Err(FrameError::TooLarge(frame.payload.len(), body_chunk_size * u8::MAX as usize));
        }

        let mut chunks = Vec::with_capacity(total_chunks);
        for (idx, body) in frame.payload.chunks(body_chunk_size).enumerate() {
            let mut chunk = Vec::with_capacity(BLE_CHUNK_HEADER + body.len());
            chunk.push(frame.kind as u8);
            chunk.extend_from_slice(&msg_id.to_be_bytes());
            chunk.push(idx as u8);
            chunk.push(total_chunks as u8);
            chunk.push(body.len() as u8);
            chunk.extend_from_slice(body);
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

/// Reassembles BLE chunks back into a [`Frame`], tracking one in-flight
/// message per `msg_id` until all chunks arrive.
#[derive(Default)]
pub struct Reassembler {
    pending: std::collections::HashMap<u16, PartialMessage>,
}

struct PartialMessage {
    kind: FrameKind,
    total_chunks: u8,
    chunks: Vec<Option<Vec<u8>>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received chunk; returns `Some(Frame)` once the message is complete.
    pub fn accept(&mut self, chunk: &[u8]) -> Result<Option<Frame>, FrameError> {
        if chunk.len() < BLE_CHUNK_HEADER {
            return Err(FrameError::Decode("BLE chunk shorter than header".into()));
        }
        let kind = FrameKind::try_from(chunk[0])?;
        let msg_id = u16::from_be_bytes([chunk[1], chunk[2]]);
        let idx = chunk[3] as usize;
        let total_chunks = chunk[4];
        let chunk_len = chunk[5] as usize;
        let body = chunk
            .get(BLE_CHUNK_HEADER..BLE_CHUNK_HEADER + chunk_len)
            .ok_or_else(|| FrameError::Decode("BLE chunk body truncated".into()))?;

        let partial = self.pending.entry(msg_id).or_insert_with(|| PartialMessage {
            kind,
            total_chunks,
            chunks: vec![None; total_chunks as usize],
        });

        if idx >= partial.chunks.len() {
            return Err(FrameError::Decode("BLE chunk index out of range".into()));
        }
        partial.chunks[idx] = Some(body.to_vec());

        if partial.chunks.iter().all(Option::is_some) {
            let partial = self.pending.remove(&msg_id).expect("just inserted");
            let mut payload = Vec::new();
            for part in partial.chunks {
                payload.extend_from_slice(&part.expect("checked all-some"));
            }
            return Ok(Some(Frame { kind: partial.kind, payload }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        sequence: u32,
    }

    #[test]
    fn frame_roundtrip() {
        let mut codec = FrameCodec::new(1024 * 1024);
        let frame = Frame::encode(FrameKind::Heartbeat, &Ping { sequence: 7 }).unwrap();

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, frame.kind);
        let msg: Ping = decoded.decode().unwrap();
        assert_eq!(msg, Ping { sequence: 7 });
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut codec = FrameCodec::new(16);
        let frame = Frame::new(FrameKind::GossipEnvelope, vec![0u8; 64]);
        let mut buf = BytesMut::new();
        assert!(codec.encode(frame, &mut buf).is_err());
    }

    #[test]
    fn ble_fragmentation_roundtrip() {
        let payload: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        let frame = Frame::new(FrameKind::GossipEnvelope, payload.clone());

        let chunks = Fragmenter::fragment(&frame, 220, 1).unwrap();
        assert!(chunks.len() > 1);

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for chunk in &chunks {
            result = reassembler.accept(chunk).unwrap();
        }
        let reassembled = result.expect("last chunk should complete the message");
        assert_eq!(reassembled.kind, FrameKind::GossipEnvelope);
        assert_eq!(reassembled.payload, payload);
    }
}
