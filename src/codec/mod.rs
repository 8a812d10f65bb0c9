//! Payload codecs.
//!
//! The framing layer only routes by message type; the codec turns frame
//! bodies into application payloads and back. Two interchangeable encodings
//! are available:
//!
//! - `raw`: fixed-layout binary records with big-endian length fields
//! - `json`: small JSON objects
//!
//! Both enforce the same field limits ([`MAX_NAME_LENGTH`],
//! [`MAX_TEXT_LENGTH`]) so a room behaves the same regardless of encoding.

pub mod json;
pub mod raw;

use crate::frame::{MessageFrame, MessageType, MAX_BODY_LENGTH};
use bytes::Bytes;
use thiserror::Error;

/// Maximum bound name length in bytes.
pub const MAX_NAME_LENGTH: usize = 32;

/// Maximum chat text length in bytes.
pub const MAX_TEXT_LENGTH: usize = 256;

/// Application payloads carried in frame bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Set the sender's display name.
    BindName { name: String },
    /// A chat line from the sender.
    ChatInfo { text: String },
    /// A chat line labelled with its author, as broadcast to the room.
    RoomInfo { name: String, text: String },
}

impl Payload {
    /// Message type this payload travels under.
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::BindName { .. } => MessageType::BindName,
            Payload::ChatInfo { .. } => MessageType::ChatInfo,
            Payload::RoomInfo { .. } => MessageType::RoomInfo,
        }
    }

    fn validate(&self) -> Result<(), CodecError> {
        match self {
            Payload::BindName { name } => check_field("name", name, MAX_NAME_LENGTH),
            Payload::ChatInfo { text } => check_field("text", text, MAX_TEXT_LENGTH),
            Payload::RoomInfo { name, text } => {
                check_field("name", name, MAX_NAME_LENGTH)?;
                check_field("text", text, MAX_TEXT_LENGTH)
            }
        }
    }
}

fn check_field(field: &'static str, value: &str, max: usize) -> Result<(), CodecError> {
    if value.len() > max {
        return Err(CodecError::FieldTooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

/// Payload encode/decode errors. Recoverable: the message is dropped and
/// the connection stays open.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("payload is {len} bytes, expected {expected}")]
    BadLength { len: usize, expected: usize },
    #[error("payload field is not valid UTF-8")]
    InvalidUtf8,
    #[error("encoded payload of {len} bytes does not fit in a frame")]
    TooLarge { len: usize },
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Selects the payload encoding used on every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Raw,
    Json,
}

impl Codec {
    /// Encode a payload into frame body bytes.
    pub fn encode(&self, payload: &Payload) -> Result<Bytes, CodecError> {
        payload.validate()?;

        let body = match self {
            Codec::Raw => raw::encode(payload),
            Codec::Json => json::encode(payload)?,
        };

        if body.len() > MAX_BODY_LENGTH {
            return Err(CodecError::TooLarge { len: body.len() });
        }
        Ok(body)
    }

    /// Decode frame body bytes for the given message type.
    pub fn decode(&self, msg_type: MessageType, body: &[u8]) -> Result<Payload, CodecError> {
        let payload = match self {
            Codec::Raw => raw::decode(msg_type, body)?,
            Codec::Json => json::decode(msg_type, body)?,
        };
        payload.validate()?;
        Ok(payload)
    }

    /// Encode a payload straight into a frame of the matching type.
    pub fn encode_frame(&self, payload: &Payload) -> Result<MessageFrame, CodecError> {
        let body = self.encode(payload)?;
        let len = body.len();
        MessageFrame::with_type(payload.message_type(), body)
            .map_err(|_| CodecError::TooLarge { len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_sets_type() {
        for codec in [Codec::Raw, Codec::Json] {
            let payload = Payload::RoomInfo {
                name: "alice".to_string(),
                text: "hello".to_string(),
            };
            let frame = codec.encode_frame(&payload).unwrap();
            assert_eq!(frame.message_type(), Some(MessageType::RoomInfo));
            assert_eq!(
                codec.decode(MessageType::RoomInfo, frame.body()).unwrap(),
                payload
            );
        }
    }

    #[test]
    fn test_limits_enforced_on_encode() {
        for codec in [Codec::Raw, Codec::Json] {
            let name = Payload::BindName {
                name: "x".repeat(MAX_NAME_LENGTH + 1),
            };
            assert!(matches!(
                codec.encode(&name),
                Err(CodecError::FieldTooLong { field: "name", .. })
            ));

            let chat = Payload::ChatInfo {
                text: "y".repeat(MAX_TEXT_LENGTH + 1),
            };
            assert!(matches!(
                codec.encode(&chat),
                Err(CodecError::FieldTooLong { field: "text", .. })
            ));
        }
    }

    #[test]
    fn test_json_limit_enforced_on_decode() {
        let body = format!(r#"{{"name":"{}"}}"#, "n".repeat(MAX_NAME_LENGTH + 1));
        assert!(matches!(
            Codec::Json.decode(MessageType::BindName, body.as_bytes()),
            Err(CodecError::FieldTooLong { .. })
        ));
    }

    #[test]
    fn test_json_escaping_can_overflow_frame() {
        // Control characters expand to \u00XX escapes, six bytes each
        let payload = Payload::RoomInfo {
            name: "\u{1}".repeat(MAX_NAME_LENGTH),
            text: "\u{1}".repeat(MAX_TEXT_LENGTH),
        };
        assert!(matches!(
            Codec::Json.encode(&payload),
            Err(CodecError::TooLarge { .. })
        ));
        assert!(Codec::Raw.encode(&payload).is_ok());
    }
}
