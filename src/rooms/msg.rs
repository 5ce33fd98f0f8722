use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Identity presented on `authenticate`. The email doubles as the display
/// name on the dashboard side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
    pub level: i64,
}

/// One chat message. Immutable once created; `created_at` is stamped by the
/// server when it accepts the message, whatever the sender claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate(Identity),
    JoinRoom(String),
    LeaveRoom(String),
    /// Carries the sender's optimistic fields; `sender_id` and `created_at`
    /// are re-stamped server-side.
    SendMessage(ChatMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once to the joining member, oldest first.
    RoomHistory(Vec<ChatMessage>),
    NewMessage(ChatMessage),
    /// Non-fatal; the channel stays open.
    Error { message: String },
}
