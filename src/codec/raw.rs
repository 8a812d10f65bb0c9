//! Fixed-layout binary records.
//!
//! ```text
//! BindName:  name[32]  | name_len: u32
//! ChatInfo:  text[256] | text_len: u32
//! RoomInfo:  BindName record | ChatInfo record
//! ```
//!
//! Unused bytes in the fixed arrays are zero. Length fields are big-endian.

use super::{CodecError, Payload, MAX_NAME_LENGTH, MAX_TEXT_LENGTH};
use crate::frame::MessageType;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encoded size of a BindName record.
pub const BIND_NAME_SIZE: usize = MAX_NAME_LENGTH + 4;

/// Encoded size of a ChatInfo record.
pub const CHAT_INFO_SIZE: usize = MAX_TEXT_LENGTH + 4;

/// Encoded size of a RoomInfo record.
pub const ROOM_INFO_SIZE: usize = BIND_NAME_SIZE + CHAT_INFO_SIZE;

/// Encode a payload. Field lengths must already be validated.
pub fn encode(payload: &Payload) -> Bytes {
    match payload {
        Payload::BindName { name } => {
            let mut buf = BytesMut::with_capacity(BIND_NAME_SIZE);
            put_field(&mut buf, name, MAX_NAME_LENGTH);
            buf.freeze()
        }
        Payload::ChatInfo { text } => {
            let mut buf = BytesMut::with_capacity(CHAT_INFO_SIZE);
            put_field(&mut buf, text, MAX_TEXT_LENGTH);
            buf.freeze()
        }
        Payload::RoomInfo { name, text } => {
            let mut buf = BytesMut::with_capacity(ROOM_INFO_SIZE);
            put_field(&mut buf, name, MAX_NAME_LENGTH);
            put_field(&mut buf, text, MAX_TEXT_LENGTH);
            buf.freeze()
        }
    }
}

/// Decode a record of the given type.
pub fn decode(msg_type: MessageType, mut body: &[u8]) -> Result<Payload, CodecError> {
    let expected = match msg_type {
        MessageType::BindName => BIND_NAME_SIZE,
        MessageType::ChatInfo => CHAT_INFO_SIZE,
        MessageType::RoomInfo => ROOM_INFO_SIZE,
    };
    if body.len() != expected {
        return Err(CodecError::BadLength {
            len: body.len(),
            expected,
        });
    }

    let payload = match msg_type {
        MessageType::BindName => Payload::BindName {
            name: get_field(&mut body, "name", MAX_NAME_LENGTH)?,
        },
        MessageType::ChatInfo => Payload::ChatInfo {
            text: get_field(&mut body, "text", MAX_TEXT_LENGTH)?,
        },
        MessageType::RoomInfo => Payload::RoomInfo {
            name: get_field(&mut body, "name", MAX_NAME_LENGTH)?,
            text: get_field(&mut body, "text", MAX_TEXT_LENGTH)?,
        },
    };
    Ok(payload)
}

fn put_field(buf: &mut BytesMut, value: &str, capacity: usize) {
    buf.put_slice(value.as_bytes());
    buf.put_bytes(0, capacity - value.len());
    buf.put_u32(value.len() as u32);
}

fn get_field(body: &mut &[u8], field: &'static str, capacity: usize) -> Result<String, CodecError> {
    let record: &[u8] = *body;
    let data = &record[..capacity];
    body.advance(capacity);
    let len = body.get_u32() as usize;

    if len > capacity {
        return Err(CodecError::FieldTooLong {
            field,
            len,
            max: capacity,
        });
    }

    String::from_utf8(data[..len].to_vec()).map_err(|_| CodecError::InvalidUtf8)
}
