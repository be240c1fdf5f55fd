//! CBOR data-channel frame format (§6.3), encoded via `ciborium`.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame kind. Only [`MsgType::UserMsg`] is accepted on delivery; any other
/// value is round-tripped as [`MsgType::Reserved`] so unrecognized future
/// wire variants don't break decoding, then logged and dropped by the
/// framing layer rather than rejected at the codec boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    UserMsg,
    Reserved(u8),
}

const USER_MSG_CODE: u8 = 0;

impl Serialize for MsgType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let code = match self {
            MsgType::UserMsg => USER_MSG_CODE,
            MsgType::Reserved(code) => *code,
        };
        serializer.serialize_u8(code)
    }
}

impl<'de> Deserialize<'de> for MsgType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Ok(match code {
            USER_MSG_CODE => MsgType::UserMsg,
            other => MsgType::Reserved(other),
        })
    }
}

/// A single data-channel frame: one part of a (possibly multi-part)
/// user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "msgType")]
    pub msg_type: MsgType,
    #[serde(rename = "msgId")]
    pub msg_id: i32,
    pub channel: String,
    pub payload: String,
    pub part: u32,
    pub total: u32,
}

#[derive(Debug, Error)]
pub enum FrameCodecError {
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameCodecError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| FrameCodecError::Encode(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameCodecError> {
        ciborium::de::from_reader(bytes).map_err(|e| FrameCodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_msg_round_trips() {
        let frame = Frame {
            msg_type: MsgType::UserMsg,
            msg_id: 7,
            channel: "chat".into(),
            payload: "hello".into(),
            part: 0,
            total: 1,
        };
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.msg_type, MsgType::UserMsg);
        assert_eq!(decoded.msg_id, 7);
        assert_eq!(decoded.payload, "hello");
    }

    #[test]
    fn unknown_msg_type_round_trips_as_reserved() {
        let frame = Frame {
            msg_type: MsgType::Reserved(42),
            msg_id: 1,
            channel: "x".into(),
            payload: String::new(),
            part: 0,
            total: 1,
        };
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.msg_type, MsgType::Reserved(42));
    }

    #[test]
    fn decode_rejects_truncated_bytes_missing_fields() {
        // A bare CBOR integer is not a map with the required fields.
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&42u8, &mut buf).unwrap();
        assert!(Frame::decode(&buf).is_err());
    }

    #[test]
    fn negative_msg_id_is_representable() {
        let frame = Frame {
            msg_type: MsgType::UserMsg,
            msg_id: -1,
            channel: "x".into(),
            payload: "p".into(),
            part: 0,
            total: 1,
        };
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.msg_id, -1);
    }
}
