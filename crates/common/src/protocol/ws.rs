// Envelope types for the huddle WebSocket protocol.
//
// Every frame, in both directions, is a JSON object of the form
// `{"type": <string>, "payload": <type-specific>}`. The outer envelope and
// the payload are decoded in two steps so that an envelope with an unknown
// type is still structurally valid.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{User, UserId};

/// Message types the relay recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Chat,
    ConnectedUser,
    DisconnectedUser,
    ActiveUsers,
}

impl MessageType {
    pub const ALL: [MessageType; 4] =
        [Self::Chat, Self::ConnectedUser, Self::DisconnectedUser, Self::ActiveUsers];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::ConnectedUser => "connectedUser",
            Self::DisconnectedUser => "disconnectedUser",
            Self::ActiveUsers => "activeUsers",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Presence events are produced by the relay only; clients may not send them.
    pub const fn is_server_only(self) -> bool {
        !matches!(self, Self::Chat)
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// An envelope as read off the wire, before its payload is interpreted.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawEnvelope {
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(EnvelopeError::Malformed)
    }

    /// `None` when the declared type is not one the relay knows.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_wire(&self.kind)
    }

    /// Decodes the payload as the shape belonging to `kind`.
    pub fn payload_as<T: DeserializeOwned>(&self, kind: MessageType) -> Result<T, EnvelopeError> {
        T::deserialize(&self.payload)
            .map_err(|source| EnvelopeError::InvalidPayload { kind: kind.as_str(), source })
    }
}

/// Sender of a chat message as the client describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSender {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub user: ChatSender,
    pub text: String,
}

/// Payload of `connectedUser` and `disconnectedUser`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub id: UserId,
    pub name: String,
}

impl From<&User> for PresencePayload {
    fn from(user: &User) -> Self {
        Self { id: user.id.clone(), name: user.name.clone() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUsersPayload {
    pub total: usize,
}

/// All recognized envelopes with their typed payloads.
///
/// The relay encodes presence events with this type. Chat envelopes are
/// validated against [`ChatPayload`] but forwarded as the original bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum WsMessage {
    Chat(ChatPayload),
    ConnectedUser(PresencePayload),
    DisconnectedUser(PresencePayload),
    ActiveUsers(ActiveUsersPayload),
}

impl WsMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Chat(_) => MessageType::Chat,
            Self::ConnectedUser(_) => MessageType::ConnectedUser,
            Self::DisconnectedUser(_) => MessageType::DisconnectedUser,
            Self::ActiveUsers(_) => MessageType::ActiveUsers,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
