//! Wire framing for chat messages.
//!
//! Every message on the wire is a fixed 8-byte header followed by a body:
//!
//! ```text
//! +----------------+----------------+---------------------------+
//! | body_size: u32 | msg_type: u32  | body (body_size bytes)    |
//! +----------------+----------------+---------------------------+
//! ```
//!
//! Both header fields are big-endian. Bodies are limited to
//! [`MAX_BODY_LENGTH`] bytes; anything larger is rejected on both the
//! sending and the receiving side.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the frame header in bytes.
pub const HEADER_LENGTH: usize = 8;

/// Maximum body size in bytes.
pub const MAX_BODY_LENGTH: usize = 512;

/// Known message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Client sets its display name.
    BindName,
    /// Client posts a chat line.
    ChatInfo,
    /// Server broadcast of a labelled chat line.
    RoomInfo,
}

impl MessageType {
    /// Wire value of this type.
    pub fn as_u32(self) -> u32 {
        match self {
            MessageType::BindName => 1,
            MessageType::ChatInfo => 2,
            MessageType::RoomInfo => 3,
        }
    }

    /// Map a wire value to a known type. Returns `None` for unknown values.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(MessageType::BindName),
            2 => Some(MessageType::ChatInfo),
            3 => Some(MessageType::RoomInfo),
            _ => None,
        }
    }
}

/// Framing errors. Always fatal to the connection that produced them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame body of {size} bytes exceeds the 512 byte limit")]
    OversizedBody { size: usize },
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_size: usize,
    pub msg_type: u32,
}

/// Encode a frame header. The caller guarantees `body_size` fits a frame.
pub fn encode_header(body_size: u32, msg_type: u32) -> [u8; HEADER_LENGTH] {
    let mut header = [0u8; HEADER_LENGTH];
    header[..4].copy_from_slice(&body_size.to_be_bytes());
    header[4..].copy_from_slice(&msg_type.to_be_bytes());
    header
}

/// Decode a frame header.
///
/// A header announcing more than [`MAX_BODY_LENGTH`] bytes is rejected; the
/// bytes that produced it must not be retried.
pub fn decode_header(bytes: &[u8; HEADER_LENGTH]) -> Result<FrameHeader, FrameError> {
    let body_size = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let msg_type = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    if body_size > MAX_BODY_LENGTH {
        return Err(FrameError::OversizedBody { size: body_size });
    }

    Ok(FrameHeader {
        body_size,
        msg_type,
    })
}

/// A complete message: type plus body.
///
/// The body length always equals the header's `body_size`, so the size is
/// derived rather than stored. Cloning is cheap (the body is shared).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    msg_type: u32,
    body: Bytes,
}

impl MessageFrame {
    /// Build a frame from a raw type value and payload.
    pub fn new(msg_type: u32, body: impl Into<Bytes>) -> Result<Self, FrameError> {
        let body = body.into();
        if body.len() > MAX_BODY_LENGTH {
            return Err(FrameError::OversizedBody { size: body.len() });
        }
        Ok(Self { msg_type, body })
    }

    /// Build a frame for a known message type.
    pub fn with_type(msg_type: MessageType, body: impl Into<Bytes>) -> Result<Self, FrameError> {
        Self::new(msg_type.as_u32(), body)
    }

    /// Raw wire type value.
    pub fn msg_type(&self) -> u32 {
        self.msg_type
    }

    /// Known message type, if any.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u32(self.msg_type)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn body_size(&self) -> usize {
        self.body.len()
    }

    /// Header bytes for this frame.
    pub fn header(&self) -> [u8; HEADER_LENGTH] {
        // body length is bounded by MAX_BODY_LENGTH at construction
        encode_header(self.body.len() as u32, self.msg_type)
    }

    /// Total encoded length (header + body).
    pub fn encoded_len(&self) -> usize {
        HEADER_LENGTH + self.body.len()
    }

    /// Serialize header and body into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&self.header());
        buf.put_slice(&self.body);
        buf.freeze()
    }
}
