//! Wire framing for the live sync connection.
//!
//! Binary WebSocket frames carry CRDT traffic (bincode-encoded):
//! ```text
//! ┌────────────┬──────────┬──────────┬──────────┐
//! │ frame_type │ crdt     │ room_id  │ payload  │
//! │ 1 byte     │ string   │ string   │ variable │
//! └────────────┴──────────┴──────────┴──────────┘
//! ```
//! Text frames carry JSON application frames tagged by `type`, plus the
//! bare `ping`/`pong` liveness strings.
//!
//! Handshake for one room:
//! ```text
//! client                                   server
//!   │ ── Join(vv) ───────────────────────────► │
//!   │ ◄──────────────────────── JoinOk(delta)  │
//!   │ ◄──────────────── SnapshotRequest(vv')   │  only when alone and backfill allowed
//!   │ ── Snapshot(delta') ───────────────────► │
//!   │ ◄──── Update ────► (other members) ────► │
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SyncResult;
use crate::room::RoomKey;
use crate::session::SessionId;

/// Text frame a client sends to check liveness.
pub const PING_TEXT: &str = "ping";
/// Reply to [`PING_TEXT`], written by the connection task itself.
pub const PONG_TEXT: &str = "pong";

/// CRDT frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Subscribe to a room; payload is the client's version vector (may be empty)
    Join = 1,
    /// Join accepted; payload is the update the client is missing
    JoinOk = 2,
    /// Incremental yrs v1 update
    Update = 3,
    /// Ask the peer for what it has beyond the payload version vector
    SnapshotRequest = 4,
    /// Answer to a snapshot request; payload is an update
    Snapshot = 5,
    /// Unsubscribe from a room
    Leave = 6,
    /// Failure; payload is a UTF-8 message
    Error = 7,
}

/// A room-scoped CRDT frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtFrame {
    pub frame_type: FrameType,
    pub crdt: String,
    pub room_id: String,
    pub payload: Vec<u8>,
}

impl CrdtFrame {
    pub fn new(frame_type: FrameType, key: &RoomKey, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            crdt: key.crdt.as_str().to_string(),
            room_id: key.room_id.to_string(),
            payload,
        }
    }

    pub fn join(key: &RoomKey, version_vector: Vec<u8>) -> Self {
        Self::new(FrameType::Join, key, version_vector)
    }

    pub fn join_ok(key: &RoomKey, missing: Vec<u8>) -> Self {
        Self::new(FrameType::JoinOk, key, missing)
    }

    pub fn update(key: &RoomKey, update: Vec<u8>) -> Self {
        Self::new(FrameType::Update, key, update)
    }

    pub fn snapshot_request(key: &RoomKey, version_vector: Vec<u8>) -> Self {
        Self::new(FrameType::SnapshotRequest, key, version_vector)
    }

    pub fn snapshot(key: &RoomKey, update: Vec<u8>) -> Self {
        Self::new(FrameType::Snapshot, key, update)
    }

    pub fn leave(key: &RoomKey) -> Self {
        Self::new(FrameType::Leave, key, Vec::new())
    }

    /// Error frame echoing whatever room addressing the failed frame had.
    pub fn error(crdt: &str, room_id: &str, message: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Error,
            crdt: crdt.to_string(),
            room_id: room_id.to_string(),
            payload: message.into().into_bytes(),
        }
    }

    /// Parse the addressed room.
    pub fn room_key(&self) -> SyncResult<RoomKey> {
        RoomKey::parse(&self.crdt, &self.room_id)
    }

    /// Message carried by an `Error` frame.
    pub fn error_message(&self) -> Result<String, ProtocolError> {
        if self.frame_type != FrameType::Error {
            return Err(ProtocolError::UnexpectedFrame(self.frame_type));
        }
        String::from_utf8(self.payload.clone())
            .map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

/// JSON application frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AppFrame {
    /// Chat message; persisted, then relayed to the other members.
    NewMsg { message: serde_json::Value },
    #[serde(rename_all = "camelCase")]
    MemberJoined {
        session_id: SessionId,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    MemberLeft {
        session_id: SessionId,
        user_id: String,
    },
    Error { message: String },
}

impl AppFrame {
    pub fn error(message: impl Into<String>) -> Self {
        AppFrame::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Frame encode/decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame encoding failed: {0}")]
    Encode(String),
    #[error("frame decoding failed: {0}")]
    Decode(String),
    #[error("unexpected frame type {0:?}")]
    UnexpectedFrame(FrameType),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::CrdtType;
    use uuid::Uuid;

    fn key() -> RoomKey {
        RoomKey::new("org/proj/camp".parse().unwrap(), CrdtType::Yrs)
    }

    #[test]
    fn test_frame_roundtrip_keeps_addressing() {
        let frame = CrdtFrame::update(&key(), vec![1, 2, 3]);
        let decoded = CrdtFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.crdt, "yrs");
        assert_eq!(decoded.room_id, "org/proj/camp");
        assert_eq!(decoded.room_key().unwrap(), key());
    }

    #[test]
    fn test_join_with_empty_version_vector() {
        let frame = CrdtFrame::join(&key(), Vec::new());
        let decoded = CrdtFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Join);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_error_frame_message() {
        let frame = CrdtFrame::error("loro", "o/p", "unsupported room kind: loro");
        assert_eq!(frame.error_message().unwrap(), "unsupported room kind: loro");
        assert!(frame.room_key().is_err());

        let not_error = CrdtFrame::leave(&key());
        assert_eq!(
            not_error.error_message(),
            Err(ProtocolError::UnexpectedFrame(FrameType::Leave))
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(matches!(
            CrdtFrame::decode(&[0xFF, 0xFE, 0xFD]),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_frame_header_is_small() {
        let frame = CrdtFrame::update(&key(), vec![0u8; 50]);
        let encoded = frame.encode().unwrap();
        assert!(
            encoded.len() < 80,
            "Encoded size {} too large for 50-byte update",
            encoded.len()
        );
    }

    #[test]
    fn test_app_frame_wire_shape() {
        let frame = AppFrame::NewMsg {
            message: serde_json::json!({"id": "m1", "text": "hi"}),
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "new-msg");
        assert_eq!(json["message"]["text"], "hi");

        let session_id = Uuid::new_v4();
        let joined = AppFrame::MemberJoined {
            session_id,
            user_id: "u1".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&joined.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "member-joined");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["sessionId"], session_id.to_string());
    }

    #[test]
    fn test_app_frame_parse() {
        let frame = AppFrame::from_json(r#"{"type":"new-msg","message":{"text":"yo"}}"#).unwrap();
        assert!(matches!(frame, AppFrame::NewMsg { .. }));

        assert!(AppFrame::from_json(r#"{"type":"mystery"}"#).is_err());
        assert!(AppFrame::from_json("not json").is_err());
    }

    #[test]
    fn test_frame_type_values() {
        assert_eq!(FrameType::Join as u8, 1);
        assert_eq!(FrameType::Update as u8, 3);
        assert_eq!(FrameType::Error as u8, 7);
    }
}
