//! JSON wire protocol over WebSocket text frames.
//!
//! ```text
//! client → server   {"event": "room:join", "ack": 7, "data": {"roomId": "k3j9x0abc"}}
//! server → client   {"ack": 7, "data": {"success": true, "room": {...}}}
//!                   {"ack": 7, "data": {"error": "Room not found"}}
//! server → client   {"event": "room:vote", "data": {"username": "bob", "hasVoted": true}}
//! ```
//!
//! The ack channel reports whether the caller's own request succeeded.
//! Events report resulting state to everyone it concerns. The two are never
//! mixed: an ack is only ever sent to the requesting socket.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::room::{RoomId, RoomSnapshot, VoteCast, VoteValue, VotesUpdate};

/// `room:create` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoom {
    pub name: String,
    pub voting_scale: Vec<VoteValue>,
}

/// Payload of requests that only address a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: RoomId,
}

/// `vote:submit` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitVote {
    pub room_id: RoomId,
    pub value: VoteValue,
}

/// Client requests.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    CreateRoom(CreateRoom),
    JoinRoom(RoomRef),
    LeaveRoom(RoomRef),
    SubmitVote(SubmitVote),
    RevealVotes(RoomRef),
    ResetVotes(RoomRef),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateRoom(_) => "room:create",
            Self::JoinRoom(_) => "room:join",
            Self::LeaveRoom(_) => "room:leave",
            Self::SubmitVote(_) => "vote:submit",
            Self::RevealVotes(_) => "vote:reveal",
            Self::ResetVotes(_) => "vote:reset",
        }
    }

    fn data(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::CreateRoom(p) => serde_json::to_value(p),
            Self::JoinRoom(p) | Self::LeaveRoom(p) | Self::RevealVotes(p) | Self::ResetVotes(p) => {
                serde_json::to_value(p)
            }
            Self::SubmitVote(p) => serde_json::to_value(p),
        }
    }
}

/// Raw inbound frame. The payload is decoded per event name so that an
/// unknown event or a malformed payload can still be acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ClientFrame {
    /// Build the frame for a request, optionally asking for an ack.
    pub fn request(event: &ClientEvent, ack: Option<u64>) -> Result<Self, ProtocolError> {
        let data = event
            .data()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            event: event.name().to_string(),
            ack,
            data,
        })
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode the typed request carried by this frame.
    pub fn parse_event(&self) -> Result<ClientEvent, ProtocolError> {
        let data = self.data.clone();
        let invalid = |e: serde_json::Error| ProtocolError::InvalidPayload {
            event: self.event.clone(),
            reason: e.to_string(),
        };
        let event = match self.event.as_str() {
            "room:create" => ClientEvent::CreateRoom(serde_json::from_value(data).map_err(invalid)?),
            "room:join" => ClientEvent::JoinRoom(serde_json::from_value(data).map_err(invalid)?),
            "room:leave" => ClientEvent::LeaveRoom(serde_json::from_value(data).map_err(invalid)?),
            "vote:submit" => ClientEvent::SubmitVote(serde_json::from_value(data).map_err(invalid)?),
            "vote:reveal" => ClientEvent::RevealVotes(serde_json::from_value(data).map_err(invalid)?),
            "vote:reset" => ClientEvent::ResetVotes(serde_json::from_value(data).map_err(invalid)?),
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }
}

/// Server-pushed state notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// All rooms, to every socket.
    #[serde(rename = "rooms:update")]
    RoomsUpdate(Vec<RoomSnapshot>),
    /// One room's state, to its members.
    #[serde(rename = "room:updated")]
    RoomUpdated(RoomSnapshot),
    /// Someone voted. Never carries the value.
    #[serde(rename = "room:vote")]
    VoteCast(VoteCast),
    /// Ballot after reveal or reset.
    #[serde(rename = "room:votes")]
    Votes(VotesUpdate),
    /// Presence snapshot, to every socket.
    #[serde(rename = "users:update")]
    UsersUpdate(Vec<String>),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomsUpdate(_) => "rooms:update",
            Self::RoomUpdated(_) => "room:updated",
            Self::VoteCast(_) => "room:vote",
            Self::Votes(_) => "room:votes",
            Self::UsersUpdate(_) => "users:update",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Body of an acknowledgment: `{success: true, ...}` or `{error: ...}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckPayload {
    pub fn ok() -> Self {
        Self {
            success: Some(true),
            ..Self::default()
        }
    }

    pub fn with_room(room: RoomSnapshot) -> Self {
        Self {
            success: Some(true),
            room: Some(room),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.success == Some(true) && self.error.is_none()
    }
}

/// Acknowledgment addressed to the requesting socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckFrame {
    pub ack: u64,
    pub data: AckPayload,
}

impl AckFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Anything the server can send, as seen by a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Ack(AckFrame),
    Event(ServerEvent),
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),
}
