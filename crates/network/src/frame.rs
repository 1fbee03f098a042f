//! Wire framing.
//!
//! Every frame is a 5 byte little-endian header followed by the body:
//!
//! ```text
//! [length: u16][kind: u8][correlation id: u16][body: length bytes]
//! ```

use std::fmt;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::ProtocolError;

/// Frame header size (2 bytes length + 1 byte kind + 2 bytes correlation id).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Largest body a frame can carry.
pub const MAX_BODY_SIZE: usize = u16::MAX as usize;

/// 16-bit value linking a request to its response.
pub type CorrelationId = u16;

/// Kind of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Plain frame. Accepted on the wire, ignored by dispatch.
    Plain = 0,
    /// Keep-alive request sent by clients.
    Heartbeat = 1,
    /// Reply to a heartbeat, carrying the heartbeat's correlation id.
    HeartbeatAck = 2,
    /// Application data.
    Data = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Plain),
            1 => Ok(Self::Heartbeat),
            2 => Ok(Self::HeartbeatAck),
            3 => Ok(Self::Data),
            _ => Err(ProtocolError::UnknownFrameKind(value)),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Plain => "plain",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat-ack",
            Self::Data => "data",
        };
        f.write_str(name)
    }
}

/// A frame in the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Kind of this frame.
    pub kind: FrameKind,
    /// Correlation id carried in the header.
    pub correlation_id: CorrelationId,
    /// Frame body.
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(correlation_id: CorrelationId, kind: FrameKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            correlation_id,
            body: body.into(),
        }
    }

    /// Heartbeat with an empty body.
    #[must_use]
    pub const fn heartbeat(correlation_id: CorrelationId) -> Self {
        Self {
            kind: FrameKind::Heartbeat,
            correlation_id,
            body: Bytes::new(),
        }
    }

    /// Heartbeat acknowledgment with an empty body.
    #[must_use]
    pub const fn heartbeat_ack(correlation_id: CorrelationId) -> Self {
        Self {
            kind: FrameKind::HeartbeatAck,
            correlation_id,
            body: Bytes::new(),
        }
    }

    /// Data frame.
    pub fn data(correlation_id: CorrelationId, body: impl Into<Bytes>) -> Self {
        Self::new(correlation_id, FrameKind::Data, body)
    }
}

/// Encode a frame into its wire bytes.
///
/// A body longer than [`MAX_BODY_SIZE`] is never sent: it is replaced by an
/// empty body with `length = 0` and a warning is logged.
#[must_use]
pub fn encode(correlation_id: CorrelationId, kind: FrameKind, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len().min(MAX_BODY_SIZE));
    put_frame(&mut buf, correlation_id, kind, body);
    buf.freeze()
}

fn put_frame(buf: &mut BytesMut, correlation_id: CorrelationId, kind: FrameKind, body: &[u8]) {
    let body: &[u8] = match u16::try_from(body.len()) {
        Ok(_) => body,
        Err(_) => {
            warn!(
                correlation_id,
                %kind,
                size = body.len(),
                max = MAX_BODY_SIZE,
                "frame body too large, sending empty body instead"
            );
            &[]
        }
    };

    buf.reserve(FRAME_HEADER_SIZE + body.len());

    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16_le(body.len() as u16);
    buf.put_u8(kind as u8);
    buf.put_u16_le(correlation_id);
    buf.put_slice(body);
}

/// Codec for encoding/decoding frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Parse header without consuming
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let body_len = header.get_u16_le() as usize;
        let kind_byte = header.get_u8();
        let correlation_id = header.get_u16_le();

        let frame_len = FRAME_HEADER_SIZE + body_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let kind = FrameKind::try_from(kind_byte)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        buf.advance(FRAME_HEADER_SIZE);
        let body = buf.split_to(body_len).freeze();

        Ok(Some(Frame {
            kind,
            correlation_id,
            body,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended inside a frame ({} bytes buffered)", buf.len()),
            )),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(buf, frame.correlation_id, frame.kind, &frame.body);
        Ok(())
    }
}
