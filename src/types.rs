//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `ConnectionId`: UUID-based identifier of one live WebSocket connection
//! - `UserId`, `GroupId`, `MessageId`: identifiers issued by the store
//! - `RoomId`: the fanout scope, either a direct pair or a group
//!
//! plus the small status enums shared by presence and messages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4. A user keeps their `UserId` across reconnects, but every
/// physical connection gets a fresh `ConnectionId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// User identity as issued by the auth collaborator
    UserId
);
string_id!(
    /// Group conversation identifier
    GroupId
);
string_id!(
    /// Message identifier assigned on persistence
    MessageId
);

impl MessageId {
    /// Generate a fresh random message ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Addressable fanout scope
///
/// Direct rooms are order-independent: `RoomId::direct(a, b)` and
/// `RoomId::direct(b, a)` are the same room. On the wire a room is a string,
/// `dm:<lo>:<hi>` or `group:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RoomId {
    /// One-to-one conversation; the ids are kept sorted
    Direct(UserId, UserId),
    /// Group conversation
    Group(GroupId),
}

impl RoomId {
    /// Build the direct room for two users, independent of argument order
    pub fn direct(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self::Direct(a, b)
        } else {
            Self::Direct(b, a)
        }
    }

    /// Build a group room
    pub fn group(group_id: GroupId) -> Self {
        Self::Group(group_id)
    }

    /// Whether `user` is one of the two participants of a direct room
    ///
    /// Always false for group rooms; their roster lives in the store.
    pub fn is_participant(&self, user: &UserId) -> bool {
        match self {
            Self::Direct(a, b) => a == user || b == user,
            Self::Group(_) => false,
        }
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(a, b) => write!(f, "dm:{}:{}", a, b),
            Self::Group(g) => write!(f, "group:{}", g),
        }
    }
}

impl FromStr for RoomId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("dm:") {
            match rest.split_once(':') {
                Some((a, b)) if !a.is_empty() && !b.is_empty() && !b.contains(':') => {
                    Ok(Self::direct(UserId::from(a), UserId::from(b)))
                }
                _ => Err(format!("invalid direct room id '{}'", s)),
            }
        } else if let Some(group) = s.strip_prefix("group:") {
            if group.is_empty() {
                Err(format!("invalid group room id '{}'", s))
            } else {
                Ok(Self::Group(GroupId::from(group)))
            }
        } else {
            Err(format!("unknown room id '{}'", s))
        }
    }
}

impl TryFrom<String> for RoomId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoomId> for String {
    fn from(room: RoomId) -> Self {
        room.to_string()
    }
}

/// User reachability status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
    Busy,
}

/// Message delivery status
///
/// Ordered so that `Sent < Delivered < Read`; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

/// Message content kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Document,
    Audio,
}
