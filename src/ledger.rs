//! Message model and delivery state machine
//!
//! A message moves `sent → delivered → read` and never back. Edits, soft
//! deletes and reactions are layered on top and do not touch the status.
//!
//! Status is one shared field per message, also for group messages: any
//! group member other than the sender advances it for everyone. Per-recipient
//! read state is not tracked.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::types::{GroupId, MessageId, MessageKind, MessageStatus, RoomId, UserId};

/// Who a message is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    User(UserId),
    Group(GroupId),
}

/// Attachment metadata for non-text messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub url: String,
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// One user's reaction to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient: Recipient,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
    pub status: MessageStatus,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A freshly created message in the `sent` state
    pub fn new(sender_id: UserId, recipient: Recipient, content: String, kind: MessageKind) -> Self {
        Self {
            id: MessageId::generate(),
            sender_id,
            recipient,
            content,
            kind,
            file: None,
            status: MessageStatus::Sent,
            reactions: Vec::new(),
            reply_to: None,
            edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_file(mut self, file: Option<FileMeta>) -> Self {
        self.file = file;
        self
    }

    pub fn with_reply_to(mut self, reply_to: Option<MessageId>) -> Self {
        self.reply_to = reply_to;
        self
    }

    /// The room this message is fanned out to
    pub fn room_id(&self) -> RoomId {
        match &self.recipient {
            Recipient::User(user) => RoomId::direct(self.sender_id.clone(), user.clone()),
            Recipient::Group(group) => RoomId::group(group.clone()),
        }
    }

    /// Move the status forward
    ///
    /// Returns false (no change) when `to` is not ahead of the current status.
    pub fn advance_status(&mut self, to: MessageStatus) -> bool {
        if to > self.status {
            self.status = to;
            true
        } else {
            false
        }
    }

    /// Replace `user`'s reaction, if any, with `emoji`
    pub fn set_reaction(&mut self, user: &UserId, emoji: String, now: DateTime<Utc>) {
        self.reactions.retain(|r| &r.user_id != user);
        self.reactions.push(Reaction {
            user_id: user.clone(),
            emoji,
            created_at: now,
        });
    }

    /// The view returned by normal reads: deleted messages keep their
    /// metadata but lose their content
    pub fn redacted(&self) -> Message {
        if !self.is_deleted {
            return self.clone();
        }
        Message {
            content: String::new(),
            file: None,
            ..self.clone()
        }
    }
}

/// Messages kept live when no capacity is configured
pub const DEFAULT_LEDGER_CAPACITY: usize = 10_000;

/// Recently touched messages, plus cached group rosters used to authorize
/// group participants
///
/// The ledger is a bounded cache in front of the store: once `capacity`
/// messages are held, inserting evicts the oldest insertion. Callers reload
/// evicted messages from the store before mutating them.
#[derive(Debug)]
pub struct MessageLedger {
    messages: HashMap<MessageId, Message>,
    /// Insertion order, oldest first
    order: VecDeque<MessageId>,
    capacity: usize,
    rosters: HashMap<GroupId, HashSet<UserId>>,
}

impl Default for MessageLedger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LEDGER_CAPACITY)
    }
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger holding at most `capacity` messages (at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            rosters: HashMap::new(),
        }
    }

    /// Track a message; an existing entry with the same id is kept, since
    /// the live copy is never older than the stored one
    pub fn insert(&mut self, message: Message) -> &Message {
        if !self.messages.contains_key(&message.id) {
            while self.messages.len() >= self.capacity {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.messages.remove(&oldest);
            }
            self.order.push_back(message.id.clone());
        }
        self.messages.entry(message.id.clone()).or_insert(message)
    }

    /// Whether a message is currently held
    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Result<&Message, AppError> {
        self.messages
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("message {}", id)))
    }

    fn get_mut(&mut self, id: &MessageId) -> Result<&mut Message, AppError> {
        self.messages
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("message {}", id)))
    }

    /// Remember the member list of a group
    pub fn set_roster(&mut self, group: GroupId, members: HashSet<UserId>) {
        self.rosters.insert(group, members);
    }

    pub fn roster(&self, group: &GroupId) -> Option<&HashSet<UserId>> {
        self.rosters.get(group)
    }

    /// Whether `user` takes part in the conversation `message` belongs to
    pub fn is_participant(&self, message: &Message, user: &UserId) -> bool {
        if &message.sender_id == user {
            return true;
        }
        match &message.recipient {
            Recipient::User(recipient) => recipient == user,
            Recipient::Group(group) => self
                .rosters
                .get(group)
                .is_some_and(|members| members.contains(user)),
        }
    }

    fn ensure_participant(&self, message: &Message, user: &UserId) -> Result<(), AppError> {
        if self.is_participant(message, user) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "{} is not part of the conversation for message {}",
                user, message.id
            )))
        }
    }

    /// Recipient-driven status transition
    ///
    /// Direct messages: only the recipient. Group messages: any member but
    /// the sender. A request that is not ahead of the current status is a
    /// no-op and returns `Ok(false)`.
    pub fn advance_status(
        &mut self,
        id: &MessageId,
        actor: &UserId,
        to: MessageStatus,
    ) -> Result<bool, AppError> {
        let message = self.get(id)?;
        let allowed = match &message.recipient {
            Recipient::User(recipient) => recipient == actor,
            Recipient::Group(_) => {
                &message.sender_id != actor && self.is_participant(message, actor)
            }
        };
        if !allowed {
            return Err(AppError::Forbidden(format!(
                "only a recipient may update the status of message {}",
                id
            )));
        }
        Ok(self.get_mut(id)?.advance_status(to))
    }

    /// System transition to `delivered` once a recipient connection took the
    /// message
    pub fn mark_delivered(&mut self, id: &MessageId) -> bool {
        self.messages
            .get_mut(id)
            .is_some_and(|m| m.advance_status(MessageStatus::Delivered))
    }

    /// Set `actor`'s reaction on a message, replacing any earlier one
    pub fn add_reaction(
        &mut self,
        id: &MessageId,
        actor: &UserId,
        emoji: String,
    ) -> Result<&Message, AppError> {
        self.ensure_participant(self.get(id)?, actor)?;
        let message = self.get_mut(id)?;
        message.set_reaction(actor, emoji, Utc::now());
        Ok(&*message)
    }

    /// Sender-only edit of a message that has not been deleted
    pub fn edit(
        &mut self,
        id: &MessageId,
        actor: &UserId,
        content: String,
    ) -> Result<&Message, AppError> {
        let message = self.get_mut(id)?;
        if &message.sender_id != actor {
            return Err(AppError::Forbidden(format!(
                "only the sender may edit message {}",
                id
            )));
        }
        if message.is_deleted {
            return Err(AppError::Forbidden(format!("message {} has been deleted", id)));
        }

        message.content = content;
        message.edited = true;
        message.edited_at = Some(Utc::now());
        Ok(&*message)
    }

    /// Sender-only soft delete
    ///
    /// The record stays in the ledger; deleting twice keeps the first
    /// `deleted_at`.
    pub fn delete(&mut self, id: &MessageId, actor: &UserId) -> Result<&Message, AppError> {
        let message = self.get_mut(id)?;
        if &message.sender_id != actor {
            return Err(AppError::Forbidden(format!(
                "only the sender may delete message {}",
                id
            )));
        }

        if !message.is_deleted {
            message.is_deleted = true;
            message.deleted_at = Some(Utc::now());
        }
        Ok(&*message)
    }

    /// Validate a read receipt: the message exists and the reader belongs
    /// to its conversation. Status is left alone.
    pub fn read_receipt(&self, id: &MessageId, reader: &UserId) -> Result<&Message, AppError> {
        let message = self.get(id)?;
        self.ensure_participant(message, reader)?;
        Ok(message)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(ledger: &mut MessageLedger) -> MessageId {
        let msg = Message::new(
            "alice".into(),
            Recipient::User("bob".into()),
            "hi".to_string(),
            MessageKind::Text,
        );
        ledger.insert(msg).id.clone()
    }

    fn group(ledger: &mut MessageLedger) -> MessageId {
        ledger.set_roster(
            "g1".into(),
            ["alice", "bob", "carol"].into_iter().map(UserId::from).collect(),
        );
        let msg = Message::new(
            "alice".into(),
            Recipient::Group("g1".into()),
            "hello all".to_string(),
            MessageKind::Text,
        );
        ledger.insert(msg).id.clone()
    }

    #[test]
    fn test_new_message_is_sent() {
        let msg = Message::new(
            "alice".into(),
            Recipient::User("bob".into()),
            "hi".to_string(),
            MessageKind::Text,
        );
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(msg.room_id(), RoomId::direct("bob".into(), "alice".into()));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut ledger = MessageLedger::with_capacity(2);
        let first = direct(&mut ledger);
        let second = direct(&mut ledger);

        // Re-inserting a held message neither evicts nor replaces it
        let mut stale = ledger.get(&first).unwrap().clone();
        ledger.advance_status(&first, &"bob".into(), MessageStatus::Read).unwrap();
        stale.content = "stale".to_string();
        assert_eq!(ledger.insert(stale).status, MessageStatus::Read);
        assert_eq!(ledger.len(), 2);

        let third = direct(&mut ledger);
        assert!(!ledger.contains(&first));
        assert!(ledger.contains(&second));
        assert!(ledger.contains(&third));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_roster_refresh_revokes_removed_member() {
        let mut ledger = MessageLedger::new();
        let id = group(&mut ledger);
        let carol = UserId::from("carol");

        ledger.add_reaction(&id, &carol, "👍".into()).unwrap();

        ledger.set_roster(
            "g1".into(),
            ["alice", "bob"].into_iter().map(UserId::from).collect(),
        );
        assert!(matches!(
            ledger.add_reaction(&id, &carol, "👎".into()),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            ledger.advance_status(&id, &carol, MessageStatus::Read),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn test_status_never_regresses() {
        let mut ledger = MessageLedger::new();
        let id = direct(&mut ledger);
        let bob = UserId::from("bob");

        assert!(ledger.advance_status(&id, &bob, MessageStatus::Read).unwrap());
        assert!(!ledger.advance_status(&id, &bob, MessageStatus::Delivered).unwrap());
        assert!(!ledger.advance_status(&id, &bob, MessageStatus::Read).unwrap());
        assert_eq!(ledger.get(&id).unwrap().status, MessageStatus::Read);
        assert!(!ledger.mark_delivered(&id));
    }

    #[test]
    fn test_only_recipient_advances_direct_status() {
        let mut ledger = MessageLedger::new();
        let id = direct(&mut ledger);

        let err = ledger
            .advance_status(&id, &"alice".into(), MessageStatus::Read)
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert_eq!(ledger.get(&id).unwrap().status, MessageStatus::Sent);
    }

    #[test]
    fn test_group_member_advances_shared_status() {
        let mut ledger = MessageLedger::new();
        let id = group(&mut ledger);

        assert!(matches!(
            ledger.advance_status(&id, &"alice".into(), MessageStatus::Read),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            ledger.advance_status(&id, &"mallory".into(), MessageStatus::Read),
            Err(AppError::Forbidden(_))
        ));
        assert!(ledger
            .advance_status(&id, &"carol".into(), MessageStatus::Delivered)
            .unwrap());
        assert_eq!(ledger.get(&id).unwrap().status, MessageStatus::Delivered);
    }

    #[test]
    fn test_missing_message_is_not_found() {
        let mut ledger = MessageLedger::new();
        let ghost = MessageId::from("ghost");
        let bob = UserId::from("bob");

        assert!(matches!(ledger.get(&ghost), Err(AppError::NotFound(_))));
        assert!(matches!(
            ledger.advance_status(&ghost, &bob, MessageStatus::Read),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            ledger.add_reaction(&ghost, &bob, "👍".into()),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(ledger.delete(&ghost, &bob), Err(AppError::NotFound(_))));
        assert!(!ledger.mark_delivered(&ghost));
    }

    #[test]
    fn test_reaction_replaces_previous() {
        let mut ledger = MessageLedger::new();
        let id = direct(&mut ledger);
        let bob = UserId::from("bob");

        ledger.add_reaction(&id, &bob, "👍".into()).unwrap();
        ledger.add_reaction(&id, &"alice".into(), "🎉".into()).unwrap();
        let msg = ledger.add_reaction(&id, &bob, "❤️".into()).unwrap();

        let bobs: Vec<_> = msg.reactions.iter().filter(|r| r.user_id == bob).collect();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].emoji, "❤️");
        assert_eq!(msg.reactions.len(), 2);
    }

    #[test]
    fn test_reaction_by_outsider_forbidden() {
        let mut ledger = MessageLedger::new();
        let id = direct(&mut ledger);

        assert!(matches!(
            ledger.add_reaction(&id, &"mallory".into(), "👎".into()),
            Err(AppError::Forbidden(_))
        ));
        assert!(ledger.get(&id).unwrap().reactions.is_empty());
    }

    #[test]
    fn test_edit_by_sender() {
        let mut ledger = MessageLedger::new();
        let id = direct(&mut ledger);

        let msg = ledger.edit(&id, &"alice".into(), "hi there".into()).unwrap();
        assert_eq!(msg.content, "hi there");
        assert!(msg.edited);
        assert!(msg.edited_at.is_some());
    }

    #[test]
    fn test_edit_and_delete_by_non_sender_forbidden() {
        let mut ledger = MessageLedger::new();
        let id = direct(&mut ledger);
        let before = ledger.get(&id).unwrap().clone();

        assert!(matches!(
            ledger.edit(&id, &"bob".into(), "pwned".into()),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            ledger.delete(&id, &"bob".into()),
            Err(AppError::Forbidden(_))
        ));
        assert_eq!(ledger.get(&id).unwrap(), &before);
    }

    #[test]
    fn test_soft_delete_hides_content() {
        let mut ledger = MessageLedger::new();
        let id = direct(&mut ledger);
        let alice = UserId::from("alice");

        let deleted_at = ledger.delete(&id, &alice).unwrap().deleted_at;
        assert!(deleted_at.is_some());

        // Record persists with its content; reads get the redacted view
        let msg = ledger.get(&id).unwrap();
        assert!(msg.is_deleted);
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.redacted().content, "");

        // Second delete keeps the original timestamp
        assert_eq!(ledger.delete(&id, &alice).unwrap().deleted_at, deleted_at);

        assert!(matches!(
            ledger.edit(&id, &alice, "back".into()),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn test_read_receipt_requires_participant() {
        let mut ledger = MessageLedger::new();
        let id = group(&mut ledger);

        assert!(ledger.read_receipt(&id, &"bob".into()).is_ok());
        assert!(matches!(
            ledger.read_receipt(&id, &"mallory".into()),
            Err(AppError::Forbidden(_))
        ));
        // Receipts never move the status
        assert_eq!(ledger.get(&id).unwrap().status, MessageStatus::Sent);
    }

    #[test]
    fn test_insert_keeps_live_copy() {
        let mut ledger = MessageLedger::new();
        let id = direct(&mut ledger);
        ledger.mark_delivered(&id);

        let mut stale = ledger.get(&id).unwrap().clone();
        stale.status = MessageStatus::Sent;
        ledger.insert(stale);

        assert_eq!(ledger.get(&id).unwrap().status, MessageStatus::Delivered);
        assert_eq!(ledger.len(), 1);
    }
}
