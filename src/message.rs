//! Message protocol definitions
//!
//! JSON-based bidirectional message protocol using Serde's tagged enum
//! for type-safe serialization/deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::ledger::{FileMeta, Message, Reaction, Recipient};
use crate::types::{
    ConnectionId, MessageId, MessageKind, MessageStatus, PresenceStatus, RoomId, UserId,
};

fn default_true() -> bool {
    true
}

/// Client → Server message
///
/// All messages from client to server. Uses tagged enum with snake_case naming.
/// `Authenticate` must be the first frame on a connection.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Present a bearer token
    Authenticate { token: String },
    /// Subscribe to a room's events
    JoinRoom { room: RoomId },
    /// Unsubscribe from a room
    LeaveRoom { room: RoomId },
    /// Typing indicator; `is_typing=false` is the same as `stop_typing`
    Typing {
        room: RoomId,
        #[serde(default = "default_true")]
        is_typing: bool,
    },
    /// Indicate typing stopped
    StopTyping { room: RoomId },
    /// Send a message to a user or group
    NewMessage {
        recipient: Recipient,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        file: Option<FileMeta>,
        #[serde(default)]
        reply_to: Option<MessageId>,
    },
    /// "I have read this message"; advisory, does not move the status
    MessageRead { message_id: MessageId },
    /// React to a message, replacing any earlier reaction of ours
    MessageReaction { message_id: MessageId, emoji: String },
    /// Change our own presence status
    StatusChange { status: PresenceStatus },
    /// Advance a received message to `delivered` or `read`
    UpdateMessageStatus {
        message_id: MessageId,
        status: MessageStatus,
    },
    /// Replace the content of one of our messages
    EditMessage {
        message_id: MessageId,
        content: String,
    },
    /// Soft-delete one of our messages
    DeleteMessage { message_id: MessageId },
    /// Load a page of a room's history
    FetchHistory {
        room: RoomId,
        #[serde(default)]
        before: Option<MessageId>,
        #[serde(default)]
        limit: Option<usize>,
    },
}

/// Server → Client message
///
/// All messages from server to client. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection bound, presence is now online
    Connected {
        connection_id: ConnectionId,
        user_id: UserId,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    },
    /// A newer connection for the same user replaced this one
    Superseded,
    /// Room subscription confirmed
    RoomJoined { room: RoomId },
    /// Room subscription dropped
    RoomLeft { room: RoomId },
    /// Our own message was stored; carries its assigned id
    MessageSent { message: Message },
    /// New message for this user
    MessageReceived { message: Message },
    /// Message moved forward in its lifecycle
    MessageStatusUpdate {
        message_id: MessageId,
        status: MessageStatus,
    },
    /// A room member started typing
    Typing { room: RoomId, user_id: UserId },
    /// A room member stopped typing (explicitly or by expiry)
    StopTyping { room: RoomId, user_id: UserId },
    /// Reactions changed; carries the full reaction list
    MessageReaction {
        message_id: MessageId,
        user_id: UserId,
        emoji: String,
        reactions: Vec<Reaction>,
    },
    /// A room member read a message
    MessageReadReceipt {
        message_id: MessageId,
        read_by: UserId,
        read_at: DateTime<Utc>,
    },
    /// Message content replaced by its sender
    MessageEdited {
        message_id: MessageId,
        content: String,
        edited_at: DateTime<Utc>,
    },
    /// Message soft-deleted by its sender
    MessageDeleted {
        message_id: MessageId,
        deleted_at: DateTime<Utc>,
    },
    /// A contact connected
    FriendOnline {
        user_id: UserId,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    },
    /// A contact disconnected
    FriendOffline {
        user_id: UserId,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    },
    /// A contact changed status explicitly
    FriendStatusChange {
        user_id: UserId,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    },
    /// One page of history, oldest first
    History { room: RoomId, messages: Vec<Message> },
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

/// Error codes for ServerMessage::Error
///
/// Represents different error scenarios that can be communicated to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Identity could not be verified
    AuthFailed,
    /// Message, room or user does not exist
    NotFound,
    /// Not allowed to do that
    Forbidden,
    /// Invalid message format
    InvalidMessage,
    /// Server-side failure
    Internal,
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let code = match &err {
            AppError::Auth => ErrorCode::AuthFailed,
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::Forbidden(_) => ErrorCode::Forbidden,
            AppError::InvalidMessage(_) | AppError::Json(_) => ErrorCode::InvalidMessage,
            // Transport failures are not normally reported (connection closes)
            _ => ErrorCode::Internal,
        };
        let message = match code {
            ErrorCode::Internal => "Internal error".to_string(),
            _ => err.to_string(),
        };
        ServerMessage::Error { code, message }
    }
}
