//! Storage and identity collaborator
//!
//! The real-time core reads friend lists, group rosters and messages from
//! here and writes durable copies of presence and message state through it.
//! Writes are fire-and-forget from the actor's point of view: live state is
//! updated first and persisted by the write-behind worker.
//!
//! `MemoryStore` is a complete in-process implementation used by the binary
//! and the tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::ledger::Message;
use crate::presence::UserPresence;
use crate::types::{GroupId, MessageId, RoomId, UserId};

/// Persistence and auth operations consumed by the chat server
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Resolve a bearer token to the user it was issued to
    async fn verify_identity(&self, token: &str) -> Result<UserId, StoreError>;

    /// The user's contacts, who hear about their presence changes
    async fn friend_ids(&self, user: &UserId) -> Result<HashSet<UserId>, StoreError>;

    /// Members of a group, including its admin
    async fn group_member_ids(&self, group: &GroupId) -> Result<HashSet<UserId>, StoreError>;

    /// A single stored message
    async fn load_message(&self, id: &MessageId) -> Result<Message, StoreError>;

    /// Store a new message, returning the id it is stored under
    async fn persist_message(&self, message: &Message) -> Result<MessageId, StoreError>;

    /// One page of a room's history, oldest to newest
    ///
    /// Pages are taken newest-first: the page holds the `limit` most recent
    /// messages older than `before` (or the most recent overall).
    async fn load_message_history(
        &self,
        room: &RoomId,
        before: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    async fn update_presence_record(&self, presence: &UserPresence) -> Result<(), StoreError>;

    async fn update_message_record(&self, message: &Message) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    tokens: HashMap<String, UserId>,
    users: HashSet<UserId>,
    friends: HashMap<UserId, HashSet<UserId>>,
    groups: HashMap<GroupId, HashSet<UserId>>,
    /// Messages in creation order
    messages: Vec<Message>,
    presence: HashMap<UserId, UserPresence>,
}

/// In-memory `Store`
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    open_registration: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept unknown tokens, registering a user whose id is the token
    pub fn with_open_registration(mut self, open: bool) -> Self {
        self.open_registration = open;
        self
    }

    /// Register a user reachable with `token`
    pub async fn add_user(&self, user: impl Into<UserId>, token: impl Into<String>) {
        let user = user.into();
        let mut state = self.state.write().await;
        state.users.insert(user.clone());
        state.tokens.insert(token.into(), user);
    }

    /// Make two users contacts of each other
    pub async fn add_friends(&self, a: impl Into<UserId>, b: impl Into<UserId>) {
        let (a, b) = (a.into(), b.into());
        let mut state = self.state.write().await;
        state.friends.entry(a.clone()).or_default().insert(b.clone());
        state.friends.entry(b).or_default().insert(a);
    }

    /// Create or replace a group
    pub async fn add_group<I, U>(&self, group: impl Into<GroupId>, members: I)
    where
        I: IntoIterator<Item = U>,
        U: Into<UserId>,
    {
        let members = members.into_iter().map(Into::into).collect();
        self.state.write().await.groups.insert(group.into(), members);
    }

    /// Stored presence record of a user
    pub async fn presence(&self, user: &UserId) -> Option<UserPresence> {
        self.state.read().await.presence.get(user).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn verify_identity(&self, token: &str) -> Result<UserId, StoreError> {
        if let Some(user) = self.state.read().await.tokens.get(token) {
            return Ok(user.clone());
        }
        if !self.open_registration || token.trim().is_empty() {
            return Err(StoreError::Unauthorized);
        }

        let user = UserId::from(token.trim());
        debug!("Registering user {} on first connect", user);
        let mut state = self.state.write().await;
        state.users.insert(user.clone());
        state.tokens.insert(token.to_string(), user.clone());
        Ok(user)
    }

    async fn friend_ids(&self, user: &UserId) -> Result<HashSet<UserId>, StoreError> {
        let state = self.state.read().await;
        if !state.users.contains(user) {
            return Err(StoreError::NotFound(format!("user {}", user)));
        }
        Ok(state.friends.get(user).cloned().unwrap_or_default())
    }

    async fn group_member_ids(&self, group: &GroupId) -> Result<HashSet<UserId>, StoreError> {
        self.state
            .read()
            .await
            .groups
            .get(group)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("group {}", group)))
    }

    async fn load_message(&self, id: &MessageId) -> Result<Message, StoreError> {
        let state = self.state.read().await;
        state
            .messages
            .iter()
            .find(|m| &m.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("message {}", id)))
    }

    async fn persist_message(&self, message: &Message) -> Result<MessageId, StoreError> {
        let mut state = self.state.write().await;
        match state.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => state.messages.push(message.clone()),
        }
        Ok(message.id.clone())
    }

    async fn load_message_history(
        &self,
        room: &RoomId,
        before: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read().await;
        let mut newest_first = state.messages.iter().rev().filter(|m| &m.room_id() == room);

        if let Some(cursor) = before {
            if !newest_first.any(|m| &m.id == cursor) {
                return Err(StoreError::NotFound(format!("message {}", cursor)));
            }
        }

        let mut page: Vec<Message> = newest_first.take(limit).cloned().collect();
        page.reverse();
        Ok(page)
    }

    async fn update_presence_record(&self, presence: &UserPresence) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .presence
            .insert(presence.user_id.clone(), presence.clone());
        Ok(())
    }

    async fn update_message_record(&self, message: &Message) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let existing = state
            .messages
            .iter_mut()
            .find(|m| m.id == message.id)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", message.id)))?;
        *existing = message.clone();
        Ok(())
    }
}
