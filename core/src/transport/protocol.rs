/// Push channel wire format: one JSON envelope per WebSocket text frame
use crate::messenger_types::{Message, MessageId, MessageType, UserRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_JOIN: &str = "join";
pub const EVENT_SEND_MESSAGE: &str = "sendMessage";
pub const EVENT_TYPING: &str = "typing";

pub const EVENT_RECEIVE_MESSAGE: &str = "receiveMessage";
pub const EVENT_MESSAGE_DELIVERED: &str = "messageDelivered";
pub const EVENT_USER_TYPING: &str = "userTyping";
pub const EVENT_USER_ONLINE: &str = "userOnline";

// Lifecycle events, raised locally by the connector
pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_CONNECT_ERROR: &str = "connect_error";

/// Every inbound event the sync loop cares about
pub const INBOUND_EVENTS: [&str; 7] = [
    EVENT_RECEIVE_MESSAGE,
    EVENT_MESSAGE_DELIVERED,
    EVENT_USER_TYPING,
    EVENT_USER_ONLINE,
    EVENT_CONNECT,
    EVENT_DISCONNECT,
    EVENT_CONNECT_ERROR,
];

/// `{"event": "...", "data": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub session_id: String,
}

/// Outbound `sendMessage`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub message_type: MessageType,
}

/// Outbound `typing`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub sender: String,
    pub recipient: String,
    pub is_typing: bool,
}

/// Inbound `userTyping`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub sender: String,
    pub is_typing: bool,
}

/// Message-like payload of `receiveMessage` / `messageDelivered`.
/// The server may or may not have assigned an id yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub sender: UserRef,
    pub recipient: UserRef,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl IncomingMessage {
    /// Build the visible message. Without a server id it gets a fresh
    /// local one, so it can never collide with a persisted entry.
    pub fn into_message(self) -> Message {
        let now = Utc::now();
        let created_at = self.created_at.unwrap_or(now);
        Message {
            id: self.id.map(MessageId::Server).unwrap_or_else(MessageId::local),
            sender: self.sender,
            recipient: self.recipient,
            content: self.content,
            message_type: self.message_type,
            is_read: false,
            read_at: None,
            is_delivered: true,
            delivered_at: Some(now),
            created_at,
            updated_at: now,
        }
    }
}

/// Decoded inbound event
#[derive(Debug, Clone)]
pub enum InboundEvent {
    ReceiveMessage(IncomingMessage),
    MessageDelivered(IncomingMessage),
    UserTyping(UserTyping),
    /// Full snapshot of online user ids
    UserOnline(Vec<String>),
    Connected,
    Disconnected,
    ConnectError(String),
}

impl InboundEvent {
    /// Decode a named event. Unknown names yield `Ok(None)`.
    pub fn parse(event: &str, data: Value) -> Result<Option<Self>, serde_json::Error> {
        let parsed = match event {
            EVENT_RECEIVE_MESSAGE => InboundEvent::ReceiveMessage(serde_json::from_value(data)?),
            EVENT_MESSAGE_DELIVERED => {
                InboundEvent::MessageDelivered(serde_json::from_value(data)?)
            }
            EVENT_USER_TYPING => InboundEvent::UserTyping(serde_json::from_value(data)?),
            EVENT_USER_ONLINE => InboundEvent::UserOnline(serde_json::from_value(data)?),
            EVENT_CONNECT => InboundEvent::Connected,
            EVENT_DISCONNECT => InboundEvent::Disconnected,
            EVENT_CONNECT_ERROR => InboundEvent::ConnectError(match data {
                Value::String(s) => s,
                other => other.to_string(),
            }),
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }
}
