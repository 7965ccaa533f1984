/// Shared types for the messenger layer: REST payloads and the domain model
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

const LOCAL_ID_PREFIX: &str = "local-";

/// A chat participant as returned by the persistence API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Sender/recipient of a message. Push payloads carry bare ids, REST
/// responses carry populated users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserRef {
    Id(String),
    User(Box<User>),
}

impl UserRef {
    pub fn id(&self) -> &str {
        match self {
            UserRef::Id(id) => id,
            UserRef::User(user) => &user.id,
        }
    }
}

impl From<&User> for UserRef {
    fn from(user: &User) -> Self {
        UserRef::User(Box::new(user.clone()))
    }
}

/// Message identity.
///
/// `Local` ids are minted on this client for optimistic entries and are
/// never equal to anything the server hands out. They render as
/// `local-<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Server(String),
    Local(Uuid),
}

impl MessageId {
    /// Fresh temporary identity for an optimistic entry
    pub fn local() -> Self {
        MessageId::Local(Uuid::new_v4())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }

    pub fn as_server(&self) -> Option<&str> {
        match self {
            MessageId::Server(id) => Some(id),
            MessageId::Local(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => f.write_str(id),
            MessageId::Local(uuid) => write!(f, "{}{}", LOCAL_ID_PREFIX, uuid),
        }
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Some(uuid) = raw
            .strip_prefix(LOCAL_ID_PREFIX)
            .and_then(|rest| Uuid::parse_str(rest).ok())
        {
            return Ok(MessageId::Local(uuid));
        }
        Ok(MessageId::Server(raw))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

/// A chat message, either persisted or still optimistic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub sender: UserRef,
    pub recipient: UserRef,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Speculative entry shown before the server confirms the write
    pub fn optimistic(
        id: MessageId,
        sender: &User,
        recipient: &str,
        content: String,
        message_type: MessageType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            sender: UserRef::from(sender),
            recipient: UserRef::Id(recipient.to_string()),
            content,
            message_type,
            is_read: false,
            read_at: None,
            is_delivered: false,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn sender_id(&self) -> &str {
        self.sender.id()
    }

    pub fn server_id(&self) -> Option<&str> {
        self.id.as_server()
    }

    pub fn mark_read(&mut self, at: DateTime<Utc>) {
        self.is_read = true;
        self.read_at = Some(at);
    }

    pub fn mark_delivered(&mut self, at: DateTime<Utc>) {
        self.is_delivered = true;
        self.delivered_at = Some(at);
    }
}

/// Preview of the newest message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub sender: String,
    #[serde(default)]
    pub message_type: MessageType,
}

/// Summary of one conversation thread (for the list view)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(rename = "_id")]
    pub id: String,
    /// The other party
    pub user: User,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    pub fn peer_id(&self) -> &str {
        &self.user.id
    }
}

/// One page of conversation history, oldest first
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub messages: Vec<Message>,
    pub page: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub message: Option<String>,
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Body of `POST /messages`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub recipient: String,
    pub content: String,
    pub message_type: MessageType,
}

/// Plain `{message}` acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub message: String,
}

/// Notifications for the UI layer, alongside the state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A message for the active conversation was appended
    NewMessage { message: Message },
    /// A message we sent was acknowledged by the recipient
    MessageDelivered { message_id: String },
    /// A send failed and its optimistic entry was rolled back
    SendFailed { local_id: String, reason: String },
    /// The server rejected our token; the session is gone
    SessionExpired,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_from_rest_payload() {
        let json = r#"{
            "_id": "m1",
            "sender": {"_id": "u1", "username": "ann", "email": "a@x", "isOnline": true, "lastSeen": "2024-01-01T00:00:00Z"},
            "recipient": {"_id": "u2", "username": "bob", "email": "b@x", "isOnline": false, "lastSeen": "2024-01-01T00:00:00Z"},
            "content": "hi",
            "messageType": "text",
            "isRead": false,
            "isDelivered": true,
            "deliveredAt": "2024-01-01T00:00:01Z",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id, MessageId::Server("m1".to_string()));
        assert_eq!(msg.sender_id(), "u1");
        assert_eq!(msg.recipient.id(), "u2");
        assert!(msg.is_delivered);
        assert!(msg.read_at.is_none());
    }

    #[test]
    fn test_local_id_never_parses_as_server_id() {
        let id = MessageId::local();
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.contains("local-"));
        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(back.is_local());
        assert_eq!(back.as_server(), None);

        let server: MessageId = serde_json::from_str("\"local-not-a-uuid\"").unwrap();
        assert!(!server.is_local());
    }

    #[test]
    fn test_local_ids_are_unique() {
        assert_ne!(MessageId::local(), MessageId::local());
    }

    #[test]
    fn test_conversation_without_last_message() {
        let json = r#"{"_id": "c1", "user": {"_id": "u2", "username": "bob", "email": "b@x"}, "unreadCount": 3}"#;
        let conv: Conversation = serde_json::from_str(json).unwrap();
        assert_eq!(conv.peer_id(), "u2");
        assert_eq!(conv.unread_count, 3);
        assert!(conv.last_message.is_none());
    }
}
