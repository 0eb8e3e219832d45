//! Connection struct definition
//!
//! Represents one live, authenticated WebSocket connection and its outbound
//! event channel.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::{ConnectionId, UserId};

/// A live connection bound to a user
///
/// Dropping the `Connection` drops the only server-side sender of its
/// outbound channel, which ends the connection's write task and closes the
/// socket.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this physical connection
    pub id: ConnectionId,
    /// Authenticated owner
    pub user_id: UserId,
    /// Server → Client event channel
    sender: mpsc::Sender<ServerMessage>,
}

impl Connection {
    /// Create a new connection with the given ID, owner and sender channel
    pub fn new(id: ConnectionId, user_id: UserId, sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            user_id,
            sender,
        }
    }

    /// Queue an event for this connection without waiting
    ///
    /// The actor never blocks on a slow client: a full queue drops the event
    /// and reports `ChannelFull`.
    pub fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendError::ChannelFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}
