//! JSON payloads.
//!
//! ```text
//! BindName: {"name": "..."}
//! ChatInfo: {"information": "..."}
//! RoomInfo: {"name": "...", "information": "..."}
//! ```

use super::{CodecError, Payload};
use crate::frame::MessageType;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct BindName {
    name: String,
}

#[derive(Serialize, Deserialize)]
struct ChatInfo {
    information: String,
}

#[derive(Serialize, Deserialize)]
struct RoomInfo {
    name: String,
    information: String,
}

pub fn encode(payload: &Payload) -> Result<Bytes, CodecError> {
    let body = match payload {
        Payload::BindName { name } => serde_json::to_vec(&BindName { name: name.clone() })?,
        Payload::ChatInfo { text } => serde_json::to_vec(&ChatInfo {
            information: text.clone(),
        })?,
        Payload::RoomInfo { name, text } => serde_json::to_vec(&RoomInfo {
            name: name.clone(),
            information: text.clone(),
        })?,
    };
    Ok(Bytes::from(body))
}

pub fn decode(msg_type: MessageType, body: &[u8]) -> Result<Payload, CodecError> {
    let payload = match msg_type {
        MessageType::BindName => {
            let BindName { name } = serde_json::from_slice(body)?;
            Payload::BindName { name }
        }
        MessageType::ChatInfo => {
            let ChatInfo { information } = serde_json::from_slice(body)?;
            Payload::ChatInfo { text: information }
        }
        MessageType::RoomInfo => {
            let RoomInfo { name, information } = serde_json::from_slice(body)?;
            Payload::RoomInfo {
                name,
                text: information,
            }
        }
    };
    Ok(payload)
}
